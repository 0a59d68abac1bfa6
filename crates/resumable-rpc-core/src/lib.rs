//! Core abstractions for resumable RPC streams.
//!
//! This crate provides the fundamental building blocks:
//! - `EventStore` - Bounded per-stream log with replay for reconnection support
//! - `EventId` - Resumption marker that encodes its stream
//! - `Session` and the `SessionStorage` trait

pub mod event;
pub mod event_store;
pub mod traits;

pub use event::{EventId, StoredEvent, StreamEvent, StreamId, unix_millis};
pub use event_store::{
    EventStore, EventStoreConfig, InMemoryEventStore, ReplaySink, SendError, StoreError,
};
pub use traits::{Session, SessionId, SessionStorage, StorageError};
