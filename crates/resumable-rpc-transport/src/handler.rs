//! Boundary between the transport and the RPC dispatch layer.

use std::sync::Arc;

use async_trait::async_trait;
use resumable_rpc_core::{EventId, EventStore, SessionId};
use serde_json::{Value, json};

use crate::{
    error::TransportError,
    protocol::{JsonRpcError, JsonRpcMessage, MessageKind, error_codes},
};

/// Protocol revision reported by [`BasicHandler`] during `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// Session-scoped outbound channel handed to the RPC layer.
///
/// Every message sent here is appended to the session's stream in the event
/// store, which both records it for replay and publishes it to live streams.
#[derive(Clone)]
pub struct OutboundSink {
    session_id: SessionId,
    events: Arc<dyn EventStore>,
}

impl OutboundSink {
    /// Create a sink for one session's stream.
    #[must_use]
    pub fn new(session_id: SessionId, events: Arc<dyn EventStore>) -> Self {
        Self { session_id, events }
    }

    /// Session (and stream) this sink writes to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Append a server-to-client message to the stream.
    ///
    /// # Errors
    /// Returns error if the message cannot be serialized or the store is disposed.
    pub async fn send(&self, message: &JsonRpcMessage) -> Result<EventId, TransportError> {
        let value = serde_json::to_value(message)?;
        let event_id = self.events.append(&self.session_id, value).await?;
        tracing::trace!(session_id = %self.session_id, %event_id, "Queued outbound message");
        Ok(event_id)
    }
}

/// Handles client messages for one session.
///
/// Implement this trait to plug in tool dispatch. Requests must yield a
/// response; notifications and client responses usually yield `None`.
///
/// The returned response is written straight into the POST reply and is not
/// recorded in the event store, so it cannot be replayed if that HTTP
/// exchange is lost. Anything sent through `sink` is recorded and goes out on
/// the session's SSE stream, where it survives reconnects.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, message: JsonRpcMessage, sink: OutboundSink) -> Option<JsonRpcMessage>;
}

/// Minimal handler: `initialize`, `ping` and an empty `tools/list`.
#[derive(Debug, Clone)]
pub struct BasicHandler {
    name: String,
    version: String,
}

impl BasicHandler {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl Default for BasicHandler {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }
}

#[async_trait]
impl RpcHandler for BasicHandler {
    async fn handle(&self, message: JsonRpcMessage, _sink: OutboundSink) -> Option<JsonRpcMessage> {
        if message.kind() != MessageKind::Request {
            return None;
        }
        let id = message.id.unwrap_or(Value::Null);

        let result = match message.method.as_deref() {
            Some("initialize") => json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": self.name, "version": self.version },
            }),
            Some("ping") => json!({}),
            Some("tools/list") => json!({ "tools": [] }),
            Some(other) => {
                return Some(JsonRpcMessage::error_response(
                    id,
                    JsonRpcError::new(error_codes::METHOD_NOT_FOUND, format!("Method not found: {other}")),
                ));
            }
            None => return None,
        };
        Some(JsonRpcMessage::response(id, result))
    }
}
