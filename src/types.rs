//! Core types for the history engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Position in the history log. `Sequence(0)` means "nothing yet".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Sequence(pub u64);

impl Sequence {
    pub const ZERO: Sequence = Sequence(0);

    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }

    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(Sequence(self.0 - 1))
        } else {
            None
        }
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch. Informational only, never used for ordering.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp(micros)
    }

    /// RFC 3339 rendering with microsecond precision.
    pub fn to_rfc3339(&self) -> String {
        match chrono::DateTime::<chrono::Utc>::from_timestamp_micros(self.0) {
            Some(dt) => dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            None => self.0.to_string(),
        }
    }

    /// Parse an RFC 3339 string back into a timestamp.
    pub fn parse_rfc3339(s: &str) -> Option<Self> {
        chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| Timestamp(dt.timestamp_micros()))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A single, immutable entry in the history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Position in the log (assigned by the history log).
    pub sequence: Sequence,

    /// When the event was appended.
    pub timestamp: Timestamp,

    /// Discriminator for the payload's semantic type.
    pub kind: String,

    /// Opaque serialized domain data.
    pub payload: Vec<u8>,
}

/// Input for appending a new event (before sequence/timestamp are assigned).
#[derive(Clone, Debug)]
pub struct EventInput {
    pub kind: String,
    pub payload: Vec<u8>,
}

impl EventInput {
    /// Create an input with a JSON payload.
    pub fn json(kind: impl Into<String>, payload: &impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: kind.into(),
            payload: serde_json::to_vec(payload)?,
        })
    }

    /// Create an input with raw bytes.
    pub fn raw(kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Materialize the event once the log has assigned its position.
    pub(crate) fn into_event(self, sequence: Sequence, timestamp: Timestamp) -> Event {
        Event {
            sequence,
            timestamp,
            kind: self.kind,
            payload: self.payload,
        }
    }
}

/// Unique identifier for an attached subscriber.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberId(pub u64);

impl fmt::Debug for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriberId({})", self.0)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Lifecycle of a subscriber: `CatchingUp -> Live -> Detached`, or
/// `CatchingUp -> Detached`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberState {
    CatchingUp,
    Live,
    Detached,
}

impl SubscriberState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            SubscriberState::CatchingUp => 0,
            SubscriberState::Live => 1,
            SubscriberState::Detached => 2,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => SubscriberState::CatchingUp,
            1 => SubscriberState::Live,
            _ => SubscriberState::Detached,
        }
    }
}

/// Why a subscriber was detached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetachReason {
    /// Explicitly unsubscribed.
    Unsubscribed,
    /// The connection reported that it closed.
    ConnectionClosed,
    /// A send on the connection failed.
    SendFailed(String),
    /// The private delivery queue overflowed (slow consumer).
    QueueOverflow,
    /// Reading the replay range from the store failed.
    StorageFailure(String),
    /// Delivery would have skipped a sequence number.
    SequenceGap { expected: Sequence, got: Sequence },
    /// The engine is shutting down.
    Shutdown,
}
