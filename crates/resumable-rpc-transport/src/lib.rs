//! Streamable HTTP transport for resumable RPC streams.
//!
//! Provides:
//! - Wire protocol (JSON-RPC 2.0)
//! - `StreamableHttpTransport` - POST/GET/DELETE endpoint with SSE replay
//! - `SecurityGuard` - API-key middleware and CORS policy
//! - `RpcHandler` - Boundary to the request dispatch layer

pub mod error;
pub mod handler;
pub mod http;
pub mod protocol;
pub mod security;

pub use error::TransportError;
pub use handler::{BasicHandler, OutboundSink, RpcHandler};
pub use http::{LAST_EVENT_ID_HEADER, SESSION_ID_HEADER, StreamableHttpTransport, TransportConfig};
pub use protocol::{JsonRpcError, JsonRpcMessage, MessageKind};
pub use security::{API_KEY_HEADER, CorsOrigins, SecurityConfig, SecurityGuard, SecurityWarning};
