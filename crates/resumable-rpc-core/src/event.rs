//! Event identifiers and event records.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stream identifier. Shares its value space with session ids.
pub type StreamId = String;

/// Exclusive upper bound of the random suffix in an [`EventId`].
pub const SUFFIX_RANGE: u16 = 10_000;

/// Opaque resumption marker handed to clients.
///
/// Encoded as `<stream_id>-<timestamp_ms>-<suffix>`. The owning stream is
/// recovered by stripping the last two dash-delimited segments, so stream ids
/// may themselves contain dashes (UUIDs, `foo-123-456`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Build an id from its components.
    #[must_use]
    pub fn encode(stream_id: &str, timestamp_ms: u64, suffix: u16) -> Self {
        Self(format!("{stream_id}-{timestamp_ms}-{suffix}"))
    }

    /// Stream id encoded in this token, or `None` if the token is malformed.
    #[must_use]
    pub fn stream_id(&self) -> Option<&str> {
        self.split().map(|(stream, _, _)| stream)
    }

    /// Timestamp component in Unix epoch milliseconds.
    #[must_use]
    pub fn timestamp_ms(&self) -> Option<u64> {
        self.split().and_then(|(_, ts, _)| ts.parse().ok())
    }

    /// Raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn split(&self) -> Option<(&str, &str, &str)> {
        let mut parts = self.0.rsplitn(3, '-');
        let suffix = parts.next()?;
        let timestamp = parts.next()?;
        let stream = parts.next()?;
        if stream.is_empty() || !is_digits(timestamp) || !is_digits(suffix) {
            return None;
        }
        Some((stream, timestamp, suffix))
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EventId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for EventId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// An event held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: EventId,
    pub stream_id: StreamId,
    pub message: Value,
    /// Wall-clock append time (Unix epoch millis), non-decreasing across the store.
    pub timestamp_ms: u64,
    /// Store-wide insertion sequence, breaks timestamp ties.
    pub seq: u64,
}

/// An event as delivered to a live subscriber or replay sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub event_id: EventId,
    pub stream_id: StreamId,
    pub message: Value,
}

impl From<&StoredEvent> for StreamEvent {
    fn from(event: &StoredEvent) -> Self {
        Self {
            event_id: event.event_id.clone(),
            stream_id: event.stream_id.clone(),
            message: event.message.clone(),
        }
    }
}

/// Current wall-clock time in Unix epoch milliseconds.
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_is_recovered() {
        let id = EventId::encode("session", 1_700_000_000_000, 42);
        assert_eq!(id.as_str(), "session-1700000000000-42");
        assert_eq!(id.stream_id(), Some("session"));
        assert_eq!(id.timestamp_ms(), Some(1_700_000_000_000));
    }

    #[test]
    fn test_stream_id_with_numeric_dash_segments() {
        let id = EventId::encode("foo-123-456", 99, 7);
        assert_eq!(id.stream_id(), Some("foo-123-456"));

        let uuid = "550e8400-e29b-41d4-a716-446655440000";
        let id = EventId::encode(uuid, 1, 0);
        assert_eq!(id.stream_id(), Some(uuid));
    }

    #[test]
    fn test_malformed_tokens_have_no_stream() {
        assert_eq!(EventId::from("").stream_id(), None);
        assert_eq!(EventId::from("bogus-id").stream_id(), None);
        assert_eq!(EventId::from("a-b-c").stream_id(), None);
        assert_eq!(EventId::from("-12-34").stream_id(), None);
        assert_eq!(EventId::from("stream-12-").stream_id(), None);
    }
}
