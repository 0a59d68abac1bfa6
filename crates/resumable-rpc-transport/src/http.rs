//! Streamable HTTP transport with resumable SSE delivery.
//!
//! One endpoint serves three verbs:
//! - `POST` submits a JSON-RPC message (an `initialize` without a session
//!   header opens a new session)
//! - `GET` opens the session's SSE stream, replaying from `Last-Event-ID`
//! - `DELETE` terminates the session

use std::{
    collections::HashSet,
    convert::Infallible,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header::ACCEPT},
    middleware,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::StreamExt;
use resumable_rpc_core::{
    EventId, EventStore, EventStoreConfig, InMemoryEventStore, ReplaySink, SendError, SessionId,
    StoreError, StreamEvent,
};
use resumable_rpc_session::{
    CleanupConfig, CleanupHandle, CleanupScheduler, SessionRegistry, storage::MemoryStorage,
};
use serde_json::{Value, json};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::{
    error::TransportError,
    handler::{OutboundSink, RpcHandler},
    protocol::{JsonRpcError, JsonRpcMessage, MessageKind, error_codes},
    security::{SecurityConfig, SecurityGuard, require_api_key},
};

/// Header carrying the session id.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Header carrying the client's resumption token.
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// Events buffered per SSE connection.
const CONNECTION_BUFFER: usize = 64;

/// Transport settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Endpoint path.
    pub path: String,
    /// SSE keep-alive period.
    pub keep_alive: Duration,
    pub events: EventStoreConfig,
    pub cleanup: CleanupConfig,
    pub security: SecurityConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            path: "/mcp".to_string(),
            keep_alive: Duration::from_secs(15),
            events: EventStoreConfig::default(),
            cleanup: CleanupConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

/// Streamable HTTP transport.
///
/// Owns the event store, the session registry and the cleanup task.
pub struct StreamableHttpTransport {
    path: String,
    keep_alive: Duration,
    events: Arc<dyn EventStore>,
    sessions: Arc<SessionRegistry<MemoryStorage>>,
    handler: Arc<dyn RpcHandler>,
    guard: Arc<SecurityGuard>,
    cleanup: Mutex<Option<CleanupHandle>>,
    closing: AtomicBool,
}

impl StreamableHttpTransport {
    /// Build a transport with an in-memory event store.
    ///
    /// Security configuration is validated here; problems are logged as
    /// warnings. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn new(config: TransportConfig, handler: Arc<dyn RpcHandler>) -> Arc<Self> {
        let events: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new(config.events.clone()));
        Self::with_event_store(config, events, handler)
    }

    /// Build a transport around an existing event store.
    #[must_use]
    pub fn with_event_store(
        config: TransportConfig,
        events: Arc<dyn EventStore>,
        handler: Arc<dyn RpcHandler>,
    ) -> Arc<Self> {
        let guard = Arc::new(SecurityGuard::new(config.security));
        let sessions = Arc::new(SessionRegistry::new(MemoryStorage::new(), Arc::clone(&events)));
        let cleanup = CleanupScheduler::spawn(Arc::clone(&sessions), config.cleanup);

        Arc::new(Self {
            path: config.path,
            keep_alive: config.keep_alive,
            events,
            sessions,
            handler,
            guard,
            cleanup: Mutex::new(Some(cleanup)),
            closing: AtomicBool::new(false),
        })
    }

    /// Event store backing the streams.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventStore> {
        &self.events
    }

    /// Session registry.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionRegistry<MemoryStorage>> {
        &self.sessions
    }

    /// Security guard built from the configuration.
    #[must_use]
    pub fn security(&self) -> &SecurityGuard {
        &self.guard
    }

    /// Build the router.
    ///
    /// # Example
    /// ```ignore
    /// let transport = StreamableHttpTransport::new(TransportConfig::default(), handler);
    /// axum::serve(listener, transport.router()).await?;
    /// ```
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(
                &self.path,
                post(handle_post).get(handle_get).delete(handle_delete),
            )
            .route("/health", get(handle_health))
            .route_layer(middleware::from_fn_with_state(
                Arc::clone(&self.guard),
                require_api_key,
            ))
            .with_state(Arc::clone(self))
            .layer(self.guard.cors_layer())
            .layer(TraceLayer::new_for_http())
    }

    /// Stop the cleanup task, then dispose the event store. Idempotent.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::Release);
        if let Some(cleanup) = self.cleanup.lock().await.take() {
            cleanup.shutdown().await;
        }
        self.events.dispose().await;
        tracing::info!("Transport closed");
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(StoreError::Disposed.into());
        }
        Ok(())
    }

    async fn require_session(&self, id: &str) -> Result<(), TransportError> {
        if self.sessions.touch(id).await? {
            Ok(())
        } else {
            Err(TransportError::SessionNotFound(id.to_owned()))
        }
    }
}

fn session_header(headers: &HeaderMap) -> Result<Option<&str>, TransportError> {
    headers
        .get(SESSION_ID_HEADER)
        .map(|v| {
            v.to_str()
                .map_err(|_| TransportError::InvalidRequest("malformed session id".into()))
        })
        .transpose()
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers.get(ACCEPT).and_then(|v| v.to_str().ok()).is_none_or(|accept| {
        accept.contains("text/event-stream") || accept.contains("*/*")
    })
}

async fn handle_post(
    State(transport): State<Arc<StreamableHttpTransport>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, TransportError> {
    transport.ensure_open()?;

    let message: JsonRpcMessage =
        serde_json::from_slice(&body).map_err(|e| TransportError::Parse(e.to_string()))?;
    let kind = message.kind();
    if kind == MessageKind::Invalid {
        return Err(TransportError::InvalidRequest("not a JSON-RPC 2.0 message".into()));
    }

    let (session_id, created) = match session_header(&headers)? {
        Some(id) => {
            transport.require_session(id).await?;
            (id.to_owned(), false)
        }
        None if message.method.as_deref() == Some("initialize") => {
            (transport.sessions.create_session().await?.id, true)
        }
        None => return Err(TransportError::MissingSession),
    };

    let request_id = message.id.clone().unwrap_or(Value::Null);
    let sink = OutboundSink::new(session_id.clone(), Arc::clone(&transport.events));
    let reply = transport.handler.handle(message, sink).await;

    let mut response = match (kind, reply) {
        (MessageKind::Request, Some(reply)) => (StatusCode::OK, Json(reply)).into_response(),
        (MessageKind::Request, None) => {
            tracing::warn!(session_id = %session_id, "Handler produced no response to a request");
            let reply = JsonRpcMessage::error_response(
                request_id,
                JsonRpcError::new(error_codes::INTERNAL_ERROR, "Internal error"),
            );
            (StatusCode::OK, Json(reply)).into_response()
        }
        _ => StatusCode::ACCEPTED.into_response(),
    };

    if created {
        let value = HeaderValue::from_str(&session_id)
            .map_err(|_| TransportError::InvalidRequest("unencodable session id".into()))?;
        response.headers_mut().insert(SESSION_ID_HEADER, value);
    }
    Ok(response)
}

async fn handle_get(
    State(transport): State<Arc<StreamableHttpTransport>>,
    headers: HeaderMap,
) -> Result<Response, TransportError> {
    transport.ensure_open()?;
    if !accepts_event_stream(&headers) {
        return Err(TransportError::NotAcceptable("client must accept text/event-stream"));
    }

    let session_id = session_header(&headers)?
        .ok_or(TransportError::MissingSession)?
        .to_owned();
    transport.require_session(&session_id).await?;
    let closed = transport
        .sessions
        .closed_signal(&session_id)
        .await
        .ok_or_else(|| TransportError::SessionNotFound(session_id.clone()))?;

    // Subscribe before replaying so nothing appended in between is missed.
    let live = transport.events.subscribe().await?;
    let last_event_id = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned);

    let (tx, rx) = mpsc::channel(CONNECTION_BUFFER);
    tokio::spawn(pump(
        Arc::clone(&transport.events),
        session_id,
        last_event_id,
        live,
        tx,
        closed,
    ));

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(transport.keep_alive))
        .into_response())
}

async fn handle_delete(
    State(transport): State<Arc<StreamableHttpTransport>>,
    headers: HeaderMap,
) -> Result<StatusCode, TransportError> {
    transport.ensure_open()?;
    let session_id = session_header(&headers)?.ok_or(TransportError::MissingSession)?;
    transport.sessions.terminate(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_health(
    State(transport): State<Arc<StreamableHttpTransport>>,
) -> Result<Json<Value>, TransportError> {
    transport.ensure_open()?;
    Ok(Json(json!({
        "status": "ok",
        "sessions": transport.sessions.count().await?,
        "events": transport.events.count_all().await?,
    })))
}

fn sse_event(event_id: &EventId, message: &Value) -> Event {
    Event::default().id(event_id.as_str()).data(message.to_string())
}

/// Replay sink writing into one SSE connection.
struct ConnectionSink<'a> {
    tx: &'a mpsc::Sender<Event>,
    delivered: &'a mut HashSet<EventId>,
}

#[async_trait]
impl ReplaySink for ConnectionSink<'_> {
    async fn send(&mut self, event_id: &EventId, message: &Value) -> Result<(), SendError> {
        self.tx
            .send(sse_event(event_id, message))
            .await
            .map_err(|_| SendError("connection closed".to_string()))?;
        self.delivered.insert(event_id.clone());
        Ok(())
    }
}

/// Feed one SSE connection: replay first, then live events for the session.
async fn pump(
    events: Arc<dyn EventStore>,
    session_id: SessionId,
    last_event_id: Option<String>,
    mut live: broadcast::Receiver<StreamEvent>,
    tx: mpsc::Sender<Event>,
    closed: CancellationToken,
) {
    let mut replayed = HashSet::new();

    if let Some(last) = last_event_id {
        if EventId::from(last.as_str()).stream_id() == Some(session_id.as_str()) {
            let outcome = {
                let mut sink = ConnectionSink {
                    tx: &tx,
                    delivered: &mut replayed,
                };
                events.replay_after(&last, &mut sink).await
            };
            match outcome {
                Ok(Some(_)) => {
                    tracing::debug!(session_id = %session_id, replayed = replayed.len(), "Stream resumed");
                }
                Ok(None) => {
                    tracing::debug!(session_id = %session_id, last_event_id = %last, "Nothing to resume");
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Replay failed, closing stream");
                    return;
                }
            }
        } else {
            tracing::warn!(
                session_id = %session_id,
                last_event_id = %last,
                "Resumption token does not belong to this session, ignoring"
            );
        }
    }

    loop {
        tokio::select! {
            () = closed.cancelled() => {
                tracing::debug!(session_id = %session_id, "Session closed, ending stream");
                break;
            }
            () = tx.closed() => {
                tracing::debug!(session_id = %session_id, "Client disconnected");
                break;
            }
            received = live.recv() => match received {
                Ok(event) => {
                    if event.stream_id != session_id || replayed.remove(&event.event_id) {
                        continue;
                    }
                    if tx.send(sse_event(&event.event_id, &event.message)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Ending the stream makes the client reconnect and replay the gap.
                    tracing::warn!(session_id = %session_id, skipped, "Live stream lagged, closing");
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_event_stream() {
        let mut headers = HeaderMap::new();
        assert!(accepts_event_stream(&headers));

        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        assert!(!accepts_event_stream(&headers));

        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/event-stream"));
        assert!(accepts_event_stream(&headers));
    }

    #[test]
    fn test_session_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(session_header(&headers).unwrap(), None);

        headers.insert(SESSION_ID_HEADER, HeaderValue::from_static("abc"));
        assert_eq!(session_header(&headers).unwrap(), Some("abc"));
    }
}
