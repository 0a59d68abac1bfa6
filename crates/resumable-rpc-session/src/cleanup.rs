//! Recurring sweep that expires idle sessions and prunes aged-out events.

use std::{sync::Arc, time::Duration};

use resumable_rpc_core::{SessionStorage, StoreError};
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::SessionRegistry;

/// Sweep timing.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// How often idle sessions are looked for.
    pub session_sweep_interval: Duration,
    /// Idle time after which a session is expired.
    pub idle_expiry: Duration,
    /// How often aged-out events are pruned.
    pub event_sweep_interval: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            session_sweep_interval: Duration::from_secs(60 * 60),
            idle_expiry: Duration::from_secs(24 * 60 * 60),
            event_sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Handle to a running cleanup task.
///
/// Dropping the handle cancels the task without waiting for it.
pub struct CleanupHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CleanupHandle {
    /// Whether the task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancel the task and wait for an in-flight sweep to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Cleanup task ended abnormally");
            }
        }
    }
}

impl Drop for CleanupHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawns the cleanup task.
pub struct CleanupScheduler;

impl CleanupScheduler {
    /// Start sweeping `registry` and its event store.
    #[must_use]
    pub fn spawn<S>(registry: Arc<SessionRegistry<S>>, config: CleanupConfig) -> CleanupHandle
    where
        S: SessionStorage + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(registry, config, cancel.clone()));
        CleanupHandle {
            cancel,
            task: Some(task),
        }
    }
}

fn interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn run<S>(registry: Arc<SessionRegistry<S>>, config: CleanupConfig, cancel: CancellationToken)
where
    S: SessionStorage + 'static,
{
    let mut sessions = interval(config.session_sweep_interval);
    let mut events = interval(config.event_sweep_interval);

    tracing::debug!(?config, "Cleanup scheduler started");
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = sessions.tick() => {
                match registry.expire_idle(config.idle_expiry).await {
                    Ok(removed) if !removed.is_empty() => {
                        tracing::info!(removed = removed.len(), "Expired idle sessions");
                    }
                    Ok(_) => tracing::debug!("No idle sessions"),
                    Err(e) => tracing::warn!(error = %e, "Idle session sweep failed"),
                }
            }
            _ = events.tick() => {
                match registry.events().prune_expired().await {
                    Ok(removed) => tracing::debug!(removed, "Pruned expired events"),
                    Err(StoreError::Disposed) => {
                        tracing::debug!("Event store disposed, stopping cleanup");
                        break;
                    }
                }
            }
        }
    }
    tracing::debug!("Cleanup scheduler stopped");
}

#[cfg(test)]
mod tests {
    use resumable_rpc_core::{EventStore, EventStoreConfig, InMemoryEventStore};
    use serde_json::json;

    use super::*;
    use crate::storage::MemoryStorage;

    fn fast_config() -> CleanupConfig {
        CleanupConfig {
            session_sweep_interval: Duration::from_millis(20),
            idle_expiry: Duration::from_millis(40),
            event_sweep_interval: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_idle_sessions_are_swept() {
        let events: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::default());
        let registry = Arc::new(SessionRegistry::new(MemoryStorage::new(), Arc::clone(&events)));
        let session = registry.create_session().await.unwrap();
        events.append(&session.id, json!("pending")).await.unwrap();

        let handle = CleanupScheduler::spawn(Arc::clone(&registry), fast_config());
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(registry.get(&session.id).await.unwrap().is_none());
        assert_eq!(events.count_all().await.unwrap(), 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_expired_events_are_pruned() {
        let events: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new(EventStoreConfig {
            max_event_age: Duration::from_millis(30),
            sweep_interval: None,
            ..EventStoreConfig::default()
        }));
        let registry = Arc::new(SessionRegistry::new(MemoryStorage::new(), Arc::clone(&events)));
        events.append("orphan", json!(1)).await.unwrap();

        let handle = CleanupScheduler::spawn(
            Arc::clone(&registry),
            CleanupConfig {
                session_sweep_interval: Duration::from_secs(3600),
                ..fast_config()
            },
        );
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(events.count_all().await.unwrap(), 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_sweep_after_shutdown() {
        let events: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::default());
        let registry = Arc::new(SessionRegistry::new(MemoryStorage::new(), Arc::clone(&events)));

        let handle = CleanupScheduler::spawn(Arc::clone(&registry), fast_config());
        assert!(handle.is_running());
        handle.shutdown().await;

        let session = registry.create_session().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(registry.get(&session.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stops_when_store_disposed() {
        let events: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::default());
        let registry = Arc::new(SessionRegistry::new(MemoryStorage::new(), Arc::clone(&events)));
        let handle = CleanupScheduler::spawn(
            Arc::clone(&registry),
            CleanupConfig {
                session_sweep_interval: Duration::from_secs(3600),
                ..fast_config()
            },
        );

        events.dispose().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!handle.is_running());
        handle.shutdown().await;
    }
}
