//! JSON-RPC wire types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version string carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Error codes used in error envelopes.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Missing or unknown session.
    pub const BAD_SESSION: i64 = -32000;
    pub const UNAUTHORIZED: i64 = -32001;
}

/// Error object of a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// What a message is, judged by which members are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Notification,
    Response,
    Invalid,
}

/// Any JSON-RPC message: request, notification or response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcMessage {
    /// Create a request.
    #[must_use]
    pub fn request(id: impl Into<Value>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: Some(id.into()),
            method: Some(method.into()),
            params,
            ..Self::empty()
        }
    }

    /// Create a notification (no id, no response expected).
    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: Some(method.into()),
            params,
            ..Self::empty()
        }
    }

    /// Create a successful response.
    #[must_use]
    pub fn response(id: Value, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            ..Self::empty()
        }
    }

    /// Create an error response. Use `Value::Null` when the id is unknown.
    #[must_use]
    pub fn error_response(id: Value, error: JsonRpcError) -> Self {
        Self {
            id: Some(id),
            error: Some(error),
            ..Self::empty()
        }
    }

    fn empty() -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        }
    }

    /// Classify the message.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        if self.jsonrpc != JSONRPC_VERSION {
            return MessageKind::Invalid;
        }
        match (&self.method, &self.id) {
            (Some(_), Some(_)) => MessageKind::Request,
            (Some(_), None) => MessageKind::Notification,
            (None, Some(_)) if self.result.is_some() != self.error.is_some() => {
                MessageKind::Response
            }
            _ => MessageKind::Invalid,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_kind_classification() {
        let parse = |v: Value| serde_json::from_value::<JsonRpcMessage>(v).unwrap().kind();

        assert_eq!(
            parse(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})),
            MessageKind::Request
        );
        assert_eq!(
            parse(json!({"jsonrpc": "2.0", "method": "notifications/initialized"})),
            MessageKind::Notification
        );
        assert_eq!(
            parse(json!({"jsonrpc": "2.0", "id": "a", "result": {}})),
            MessageKind::Response
        );
        assert_eq!(parse(json!({"jsonrpc": "1.0", "id": 1, "method": "x"})), MessageKind::Invalid);
        assert_eq!(parse(json!({"jsonrpc": "2.0", "id": 1})), MessageKind::Invalid);
    }

    #[test]
    fn test_error_envelope_keeps_null_id() {
        let msg = JsonRpcMessage::error_response(
            Value::Null,
            JsonRpcError::new(error_codes::INTERNAL_ERROR, "Internal error"),
        );
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(
            json,
            json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": {"code": -32603, "message": "Internal error"}
            })
        );
    }
}
