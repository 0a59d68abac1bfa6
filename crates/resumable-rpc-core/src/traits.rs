//! Session types and the storage trait.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Session identifier. Also used as the stream id of the session's events.
pub type SessionId = String;

/// A client session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier.
    pub id: SessionId,
    /// Creation timestamp (Unix epoch millis).
    pub created_at: u64,
    /// Last request bound to this session (Unix epoch millis).
    pub last_active_at: u64,
}

impl Session {
    /// Time since the last activity, measured at `now_ms`.
    #[must_use]
    pub fn idle_for(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.last_active_at))
    }
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Trait for session storage backends.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Mint and record a new session.
    async fn create(&self) -> Result<Session, StorageError>;

    /// Get a session by ID.
    async fn get(&self, id: &str) -> Result<Option<Session>, StorageError>;

    /// Refresh `last_active_at`. Returns `false` if the session is unknown.
    async fn touch(&self, id: &str) -> Result<bool, StorageError>;

    /// Remove a session, returning it if it existed.
    async fn remove(&self, id: &str) -> Result<Option<Session>, StorageError>;

    /// Remove and return every session idle for longer than `max_idle`.
    async fn remove_idle(&self, max_idle: Duration) -> Result<Vec<Session>, StorageError>;

    /// All sessions, newest first.
    async fn list(&self) -> Result<Vec<Session>, StorageError>;

    /// Number of sessions.
    async fn count(&self) -> Result<usize, StorageError>;
}
