//! Session registry: session lifecycle on top of a storage backend.

use std::{collections::HashMap, sync::Arc, time::Duration};

use resumable_rpc_core::{
    EventStore, StoreError,
    traits::{Session, SessionId, SessionStorage, StorageError},
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Session registry error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Event store error: {0}")]
    Events(#[from] StoreError),
    #[error("Session not found: {0}")]
    NotFound(SessionId),
}

/// Live state for a session.
struct ActiveSession {
    shutdown: CancellationToken,
}

/// Tracks sessions and keeps their event streams in step with them.
///
/// Removing a session, explicitly or through idle expiry, clears its stream
/// in the event store and signals open connections to close.
pub struct SessionRegistry<S>
where
    S: SessionStorage,
{
    storage: S,
    events: Arc<dyn EventStore>,
    active_sessions: RwLock<HashMap<SessionId, ActiveSession>>,
}

impl<S> SessionRegistry<S>
where
    S: SessionStorage,
{
    /// Create a new session registry.
    #[must_use]
    pub fn new(storage: S, events: Arc<dyn EventStore>) -> Self {
        Self {
            storage,
            events,
            active_sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Event store the registry clears on session removal.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventStore> {
        &self.events
    }

    /// Mint and record a new session.
    ///
    /// # Errors
    /// Returns error if the storage backend fails.
    pub async fn create_session(&self) -> Result<Session, SessionError> {
        let session = self.storage.create().await?;
        self.active_sessions.write().await.insert(
            session.id.clone(),
            ActiveSession {
                shutdown: CancellationToken::new(),
            },
        );
        tracing::info!(session_id = %session.id, "Session created");
        Ok(session)
    }

    /// Refresh a session's activity time.
    ///
    /// Returns `false` for unknown sessions, which is not an error: a request
    /// may race its own session's expiry.
    ///
    /// # Errors
    /// Returns error if the storage backend fails.
    pub async fn touch(&self, id: &str) -> Result<bool, SessionError> {
        Ok(self.storage.touch(id).await?)
    }

    /// Get a session by ID.
    ///
    /// # Errors
    /// Returns error if the storage backend fails.
    pub async fn get(&self, id: &str) -> Result<Option<Session>, SessionError> {
        Ok(self.storage.get(id).await?)
    }

    /// Whether the session exists.
    ///
    /// # Errors
    /// Returns error if the storage backend fails.
    pub async fn contains(&self, id: &str) -> Result<bool, SessionError> {
        Ok(self.get(id).await?.is_some())
    }

    /// All sessions, newest first.
    ///
    /// # Errors
    /// Returns error if the storage backend fails.
    pub async fn list(&self) -> Result<Vec<Session>, SessionError> {
        Ok(self.storage.list().await?)
    }

    /// Number of sessions.
    ///
    /// # Errors
    /// Returns error if the storage backend fails.
    pub async fn count(&self) -> Result<usize, SessionError> {
        Ok(self.storage.count().await?)
    }

    /// Signal that fires when the session is terminated or expires.
    pub async fn closed_signal(&self, id: &str) -> Option<CancellationToken> {
        self.active_sessions
            .read()
            .await
            .get(id)
            .map(|s| s.shutdown.child_token())
    }

    /// Explicitly remove a session and its events.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown sessions, or the event store error if
    /// its stream could not be cleared.
    pub async fn terminate(&self, id: &str) -> Result<Session, SessionError> {
        let session = self
            .storage
            .remove(id)
            .await?
            .ok_or_else(|| SessionError::NotFound(id.to_owned()))?;

        let cleared = self.release(&session.id).await?;
        tracing::info!(session_id = %session.id, cleared, "Session terminated");
        Ok(session)
    }

    /// Remove every session idle for longer than `max_idle`, clearing their
    /// events. Returns the removed sessions.
    ///
    /// # Errors
    /// Returns error if the storage backend fails.
    pub async fn expire_idle(&self, max_idle: Duration) -> Result<Vec<Session>, SessionError> {
        let removed = self.storage.remove_idle(max_idle).await?;

        for session in &removed {
            match self.release(&session.id).await {
                Ok(cleared) => {
                    tracing::info!(session_id = %session.id, cleared, "Session expired");
                }
                Err(e) => {
                    tracing::warn!(session_id = %session.id, error = %e, "Failed to clear expired session events");
                }
            }
        }
        Ok(removed)
    }

    async fn release(&self, id: &str) -> Result<usize, SessionError> {
        if let Some(active) = self.active_sessions.write().await.remove(id) {
            active.shutdown.cancel();
        }
        Ok(self.events.clear_for_stream(id).await?)
    }
}
