//! Bounded, ordered, per-stream event log used for stream resumption.
//!
//! The in-memory implementation is a single-writer actor: every operation is
//! a command enqueued on an unbounded channel and answered over a oneshot, so
//! appends, eviction, the age sweep and clears never interleave, and callers
//! wait cooperatively instead of blocking a runtime thread.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time::{Instant, Interval, MissedTickBehavior},
};

use crate::event::{EventId, SUFFIX_RANGE, StoredEvent, StreamEvent, StreamId, unix_millis};

/// Default maximum number of retained events across all streams.
pub const DEFAULT_MAX_EVENTS: usize = 1000;

/// Default maximum event age.
pub const DEFAULT_MAX_EVENT_AGE: Duration = Duration::from_secs(60 * 60);

/// Default age-sweep period.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Live feed capacity (events buffered per slow subscriber).
const LIVE_CAPACITY: usize = 10_000;

/// Random suffix draws per timestamp before moving to the next millisecond.
const MAX_SUFFIX_ATTEMPTS: usize = 32;

/// Event store error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Event store has been disposed")]
    Disposed,
}

/// A replay delivery that did not go through.
#[derive(Debug, Error)]
#[error("Replay send failed: {0}")]
pub struct SendError(pub String);

/// Receiver of replayed events.
#[async_trait]
pub trait ReplaySink: Send {
    /// Deliver one event. Failures are logged by the store and replay continues.
    async fn send(&mut self, event_id: &EventId, message: &Value) -> Result<(), SendError>;
}

/// Append-only event log keyed by stream.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Store a message and return its freshly minted id.
    async fn append(&self, stream_id: &str, message: Value) -> Result<EventId, StoreError>;

    /// Replay every event of the marker's stream stored after the marker.
    ///
    /// Returns `Ok(None)` without calling the sink when the marker is empty or
    /// not in the store.
    async fn replay_after(
        &self,
        last_event_id: &str,
        sink: &mut dyn ReplaySink,
    ) -> Result<Option<StreamId>, StoreError>;

    /// Remove all events of one stream. Returns how many were removed.
    async fn clear_for_stream(&self, stream_id: &str) -> Result<usize, StoreError>;

    /// Remove every event. Returns how many were removed.
    async fn clear_all(&self) -> Result<usize, StoreError>;

    /// Total number of stored events.
    async fn count_all(&self) -> Result<usize, StoreError>;

    /// Number of stored events for one stream.
    async fn count_for_stream(&self, stream_id: &str) -> Result<usize, StoreError>;

    /// Run the age sweep now. Returns how many events expired.
    async fn prune_expired(&self) -> Result<usize, StoreError>;

    /// Subscribe to events stored from this point on.
    async fn subscribe(&self) -> Result<broadcast::Receiver<StreamEvent>, StoreError>;

    /// Stop the background sweep and drop all events. Idempotent.
    async fn dispose(&self);
}

/// Retention settings for [`InMemoryEventStore`].
#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    /// Maximum number of events across all streams. Oldest are evicted first.
    pub max_events: usize,
    /// Maximum event age enforced by the sweep.
    pub max_event_age: Duration,
    /// Period of the background age sweep. `None` disables it.
    pub sweep_interval: Option<Duration>,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            max_events: DEFAULT_MAX_EVENTS,
            max_event_age: DEFAULT_MAX_EVENT_AGE,
            sweep_interval: Some(DEFAULT_SWEEP_INTERVAL),
        }
    }
}

type Replay = Option<(StreamId, Vec<StreamEvent>)>;

enum Command {
    Append {
        stream_id: StreamId,
        message: Value,
        reply: oneshot::Sender<EventId>,
    },
    CollectAfter {
        last_event_id: EventId,
        reply: oneshot::Sender<Replay>,
    },
    ClearStream {
        stream_id: StreamId,
        reply: oneshot::Sender<usize>,
    },
    ClearAll {
        reply: oneshot::Sender<usize>,
    },
    CountAll {
        reply: oneshot::Sender<usize>,
    },
    CountStream {
        stream_id: StreamId,
        reply: oneshot::Sender<usize>,
    },
    PruneExpired {
        reply: oneshot::Sender<usize>,
    },
    Subscribe {
        reply: oneshot::Sender<broadcast::Receiver<StreamEvent>>,
    },
    Dispose {
        reply: oneshot::Sender<()>,
    },
}

/// State owned by the store actor.
struct EventLog {
    events: BTreeMap<u64, StoredEvent>,
    index: HashMap<EventId, u64>,
    next_seq: u64,
    last_timestamp: u64,
    /// Suffixes already minted at `last_timestamp`.
    minted_suffixes: HashSet<u16>,
    max_events: usize,
    max_age_ms: u64,
    live: broadcast::Sender<StreamEvent>,
}

impl EventLog {
    fn new(config: &EventStoreConfig) -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            events: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 0,
            last_timestamp: 0,
            minted_suffixes: HashSet::new(),
            max_events: config.max_events.max(1),
            max_age_ms: u64::try_from(config.max_event_age.as_millis()).unwrap_or(u64::MAX),
            live,
        }
    }

    /// Pick an unused `(timestamp, suffix)` pair.
    ///
    /// Timestamps never decrease and every suffix minted at the current
    /// timestamp is remembered, so an id is never issued twice, even after
    /// the original event was evicted. When the suffix space gets crowded the
    /// timestamp moves forward by one millisecond.
    fn mint(&mut self, now_ms: u64) -> (u64, u16) {
        if now_ms > self.last_timestamp {
            self.last_timestamp = now_ms;
            self.minted_suffixes.clear();
        }

        let mut rng = rand::thread_rng();
        loop {
            for _ in 0..MAX_SUFFIX_ATTEMPTS {
                let suffix = rng.gen_range(0..SUFFIX_RANGE);
                if self.minted_suffixes.insert(suffix) {
                    return (self.last_timestamp, suffix);
                }
            }
            self.last_timestamp = self.last_timestamp.saturating_add(1);
            self.minted_suffixes.clear();
        }
    }

    fn append(&mut self, stream_id: StreamId, message: Value, now_ms: u64) -> EventId {
        let (timestamp_ms, suffix) = self.mint(now_ms);
        let event_id = EventId::encode(&stream_id, timestamp_ms, suffix);

        let seq = self.next_seq;
        self.next_seq += 1;

        let event = StoredEvent {
            event_id: event_id.clone(),
            stream_id,
            message,
            timestamp_ms,
            seq,
        };
        // No subscribers is fine.
        let _ = self.live.send(StreamEvent::from(&event));
        self.index.insert(event_id.clone(), seq);
        self.events.insert(seq, event);

        let evicted = self.evict_overflow();
        if evicted > 0 {
            tracing::debug!(evicted, max_events = self.max_events, "Evicted oldest events");
        }
        event_id
    }

    fn evict_overflow(&mut self) -> usize {
        let mut evicted = 0;
        while self.events.len() > self.max_events {
            let Some((_, event)) = self.events.pop_first() else {
                break;
            };
            self.index.remove(&event.event_id);
            evicted += 1;
        }
        evicted
    }

    fn collect_after(&self, last_event_id: &EventId) -> Replay {
        let Some(stream_id) = last_event_id.stream_id() else {
            return None;
        };
        let seq = *self.index.get(last_event_id)?;
        let marker = self.events.get(&seq)?;
        if marker.stream_id != stream_id {
            tracing::warn!(
                event_id = %last_event_id,
                stream_id = %marker.stream_id,
                "Event id does not encode its owning stream"
            );
            return None;
        }

        // Sequence order is (timestamp, insertion) order, see `append`.
        let pending = self
            .events
            .range(seq + 1..)
            .map(|(_, event)| event)
            .filter(|event| event.stream_id == marker.stream_id)
            .map(StreamEvent::from)
            .collect();
        Some((marker.stream_id.clone(), pending))
    }

    fn remove_where(&mut self, mut predicate: impl FnMut(&StoredEvent) -> bool) -> usize {
        let before = self.events.len();
        let index = &mut self.index;
        self.events.retain(|_, event| {
            if predicate(event) {
                index.remove(&event.event_id);
                false
            } else {
                true
            }
        });
        before - self.events.len()
    }

    fn count_for_stream(&self, stream_id: &str) -> usize {
        self.events
            .values()
            .filter(|event| event.stream_id == stream_id)
            .count()
    }

    fn prune_expired(&mut self, now_ms: u64) -> usize {
        let mut removed = 0;
        while let Some(entry) = self.events.first_entry() {
            if now_ms.saturating_sub(entry.get().timestamp_ms) <= self.max_age_ms {
                break;
            }
            let event = entry.remove();
            self.index.remove(&event.event_id);
            removed += 1;
        }
        removed
    }

    fn handle(&mut self, command: Command) {
        // A dropped reply means the caller gave up waiting; nothing to do.
        match command {
            Command::Append {
                stream_id,
                message,
                reply,
            } => {
                let _ = reply.send(self.append(stream_id, message, unix_millis()));
            }
            Command::CollectAfter {
                last_event_id,
                reply,
            } => {
                let _ = reply.send(self.collect_after(&last_event_id));
            }
            Command::ClearStream { stream_id, reply } => {
                let _ = reply.send(self.remove_where(|event| event.stream_id == stream_id));
            }
            Command::ClearAll { reply } => {
                let _ = reply.send(self.remove_where(|_| true));
            }
            Command::CountAll { reply } => {
                let _ = reply.send(self.events.len());
            }
            Command::CountStream { stream_id, reply } => {
                let _ = reply.send(self.count_for_stream(&stream_id));
            }
            Command::PruneExpired { reply } => {
                let _ = reply.send(self.prune_expired(unix_millis()));
            }
            Command::Subscribe { reply } => {
                let _ = reply.send(self.live.subscribe());
            }
            Command::Dispose { reply } => {
                self.remove_where(|_| true);
                let _ = reply.send(());
            }
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, sweep: Option<Duration>) {
        let mut sweep = sweep.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command @ Command::Dispose { .. }) => {
                        self.handle(command);
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => break,
                },
                () = next_tick(sweep.as_mut()) => {
                    let removed = self.prune_expired(unix_millis());
                    if removed > 0 {
                        tracing::debug!(removed, "Age sweep removed expired events");
                    }
                }
            }
        }
        tracing::debug!("Event store actor stopped");
    }
}

async fn next_tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// In-memory [`EventStore`].
///
/// Contents are lost when the process exits. Dropping
/// the handle stops the actor.
pub struct InMemoryEventStore {
    commands: mpsc::UnboundedSender<Command>,
    disposed: AtomicBool,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new(EventStoreConfig::default())
    }
}

impl InMemoryEventStore {
    /// Create a store and spawn its actor.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn new(config: EventStoreConfig) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let log = EventLog::new(&config);
        tokio::spawn(log.run(rx, config.sweep_interval));
        Self {
            commands,
            disposed: AtomicBool::new(false),
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, StoreError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StoreError::Disposed);
        }
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| StoreError::Disposed)?;
        rx.await.map_err(|_| StoreError::Disposed)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, stream_id: &str, message: Value) -> Result<EventId, StoreError> {
        let stream_id = stream_id.to_owned();
        self.request(|reply| Command::Append {
            stream_id,
            message,
            reply,
        })
        .await
    }

    async fn replay_after(
        &self,
        last_event_id: &str,
        sink: &mut dyn ReplaySink,
    ) -> Result<Option<StreamId>, StoreError> {
        let last_event_id = EventId::from(last_event_id);
        let marker = last_event_id.clone();
        let collected = self
            .request(|reply| Command::CollectAfter {
                last_event_id,
                reply,
            })
            .await?;

        let Some((stream_id, pending)) = collected else {
            tracing::debug!(event_id = %marker, "Nothing to replay");
            return Ok(None);
        };

        let total = pending.len();
        let mut failed = 0usize;
        for event in pending {
            if let Err(e) = sink.send(&event.event_id, &event.message).await {
                failed += 1;
                tracing::warn!(
                    event_id = %event.event_id,
                    stream_id = %stream_id,
                    error = %e,
                    "Failed to replay event, continuing"
                );
            }
        }
        tracing::debug!(stream_id = %stream_id, total, failed, "Replay finished");
        Ok(Some(stream_id))
    }

    async fn clear_for_stream(&self, stream_id: &str) -> Result<usize, StoreError> {
        let stream_id = stream_id.to_owned();
        self.request(|reply| Command::ClearStream { stream_id, reply })
            .await
    }

    async fn clear_all(&self) -> Result<usize, StoreError> {
        self.request(|reply| Command::ClearAll { reply }).await
    }

    async fn count_all(&self) -> Result<usize, StoreError> {
        self.request(|reply| Command::CountAll { reply }).await
    }

    async fn count_for_stream(&self, stream_id: &str) -> Result<usize, StoreError> {
        let stream_id = stream_id.to_owned();
        self.request(|reply| Command::CountStream { stream_id, reply })
            .await
    }

    async fn prune_expired(&self) -> Result<usize, StoreError> {
        self.request(|reply| Command::PruneExpired { reply }).await
    }

    async fn subscribe(&self) -> Result<broadcast::Receiver<StreamEvent>, StoreError> {
        self.request(|reply| Command::Subscribe { reply }).await
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Dispose { reply: tx }).is_ok() {
            let _ = rx.await;
        }
        tracing::debug!("Event store disposed");
    }
}
