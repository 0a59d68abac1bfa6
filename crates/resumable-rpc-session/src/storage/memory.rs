//! In-memory session storage.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use resumable_rpc_core::{
    traits::{Session, SessionStorage, StorageError},
    unix_millis,
};
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-memory storage implementation.
///
/// Waiters queue on an async lock, so a busy map never blocks a runtime
/// thread. Data is lost on restart.
pub struct MemoryStorage {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemoryStorage {
    /// Create a new in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    async fn create(&self) -> Result<Session, StorageError> {
        let timestamp = unix_millis();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            created_at: timestamp,
            last_active_at: timestamp,
        };

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(StorageError::Internal(format!(
                "session id collision: {}",
                session.id
            )));
        }
        sessions.insert(session.id.clone(), session.clone());

        Ok(session)
    }

    async fn get(&self, id: &str) -> Result<Option<Session>, StorageError> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn touch(&self, id: &str) -> Result<bool, StorageError> {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(id) else {
            return Ok(false);
        };
        session.last_active_at = unix_millis().max(session.last_active_at);
        Ok(true)
    }

    async fn remove(&self, id: &str) -> Result<Option<Session>, StorageError> {
        Ok(self.sessions.write().await.remove(id))
    }

    async fn remove_idle(&self, max_idle: Duration) -> Result<Vec<Session>, StorageError> {
        let now = unix_millis();
        let mut sessions = self.sessions.write().await;

        let idle: Vec<String> = sessions
            .values()
            .filter(|s| s.idle_for(now) > max_idle)
            .map(|s| s.id.clone())
            .collect();

        Ok(idle
            .iter()
            .filter_map(|id| sessions.remove(id))
            .collect())
    }

    async fn list(&self) -> Result<Vec<Session>, StorageError> {
        let mut result: Vec<Session> = self.sessions.read().await.values().cloned().collect();

        // Sort by created_at descending
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(result)
    }

    async fn count(&self) -> Result<usize, StorageError> {
        Ok(self.sessions.read().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_get() {
        let storage = MemoryStorage::new();
        let session = storage.create().await.unwrap();

        assert_eq!(session.created_at, session.last_active_at);
        assert_eq!(storage.get(&session.id).await.unwrap(), Some(session));
        assert_eq!(storage.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_touch_unknown_is_not_an_error() {
        let storage = MemoryStorage::new();
        assert!(!storage.touch("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_idle_keeps_active_sessions() {
        let storage = MemoryStorage::new();
        let stale = storage.create().await.unwrap();
        let fresh = storage.create().await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(storage.touch(&fresh.id).await.unwrap());

        let removed = storage.remove_idle(Duration::from_millis(30)).await.unwrap();

        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, stale.id);
        assert!(storage.get(&fresh.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let storage = MemoryStorage::new();
        let first = storage.create().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = storage.create().await.unwrap();

        let ids: Vec<_> = storage.list().await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }
}
