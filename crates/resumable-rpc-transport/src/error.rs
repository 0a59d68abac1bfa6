//! Transport errors and their HTTP rendering.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use resumable_rpc_core::StoreError;
use resumable_rpc_session::SessionError;
use serde_json::Value;
use thiserror::Error;

use crate::protocol::{JsonRpcError, JsonRpcMessage, error_codes};

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Unauthorized: {0}")]
    Unauthorized(&'static str),
    #[error("Missing session id")]
    MissingSession,
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Not acceptable: {0}")]
    NotAcceptable(&'static str),
    #[error("Event store error: {0}")]
    Store(#[from] StoreError),
    #[error("Session error: {0}")]
    Session(SessionError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<SessionError> for TransportError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(id) => Self::SessionNotFound(id),
            SessionError::Events(e) => Self::Store(e),
            other @ SessionError::Storage(_) => Self::Session(other),
        }
    }
}

impl TransportError {
    /// HTTP status for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::MissingSession | Self::Parse(_) | Self::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::NotAcceptable(_) => StatusCode::NOT_ACCEPTABLE,
            Self::Store(_) | Self::Session(_) | Self::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// JSON-RPC error object sent to the client. Internal details stay in the logs.
    #[must_use]
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            Self::Unauthorized(_) => JsonRpcError::new(error_codes::UNAUTHORIZED, self.to_string()),
            Self::MissingSession | Self::SessionNotFound(_) | Self::NotAcceptable(_) => {
                JsonRpcError::new(error_codes::BAD_SESSION, self.to_string())
            }
            Self::Parse(_) => JsonRpcError::new(error_codes::PARSE_ERROR, self.to_string()),
            Self::InvalidRequest(_) => {
                JsonRpcError::new(error_codes::INVALID_REQUEST, self.to_string())
            }
            Self::Store(_) | Self::Session(_) | Self::Serialization(_) => {
                JsonRpcError::new(error_codes::INTERNAL_ERROR, "Internal error")
            }
        }
    }
}

impl IntoResponse for TransportError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Transport request failed");
        } else {
            tracing::debug!(error = %self, %status, "Transport request rejected");
        }
        let envelope = JsonRpcMessage::error_response(Value::Null, self.to_rpc_error());
        (status, Json(envelope)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_errors_are_generic() {
        let err = TransportError::Store(StoreError::Disposed);
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_rpc_error().code, error_codes::INTERNAL_ERROR);
        assert_eq!(err.to_rpc_error().message, "Internal error");
    }

    #[test]
    fn test_session_errors_map_to_client_errors() {
        let err = TransportError::from(SessionError::NotFound("abc".into()));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.to_rpc_error().code, error_codes::BAD_SESSION);

        let err = TransportError::from(SessionError::Events(StoreError::Disposed));
        assert!(matches!(err, TransportError::Store(StoreError::Disposed)));
    }

    #[test]
    fn test_unauthorized_envelope() {
        let err = TransportError::Unauthorized("invalid API key");
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.to_rpc_error().code, error_codes::UNAUTHORIZED);
    }
}
