//! Session lifecycle for resumable RPC streams.
//!
//! Provides:
//! - `SessionRegistry` - Create, touch, terminate and expire sessions
//! - `CleanupScheduler` - Background idle-session and event-age sweeps
//! - Storage implementations (memory)

pub mod cleanup;
pub mod registry;
pub mod storage;

pub use cleanup::{CleanupConfig, CleanupHandle, CleanupScheduler};
pub use registry::{SessionError, SessionRegistry};
