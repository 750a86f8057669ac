//! Logical message shapes exchanged with subscribers.
//!
//! Byte framing belongs to the transport; this module only fixes the
//! field layout and offers JSON and MessagePack encodings of it.

use crate::error::{Result, SyncError};
use crate::subscriptions::{KindFilter, SubscribeRequest};
use crate::types::{Event, Sequence, Timestamp};
use serde::{Deserialize, Serialize};

/// Error tag carried by [`InvalidResume`].
pub const INVALID_RESUME_POINT: &str = "InvalidResumePoint";

/// Client → core, at attach time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeRequest {
    #[serde(rename = "lastKnownSeq", default)]
    pub last_known_seq: u64,
}

impl From<ResumeRequest> for SubscribeRequest {
    fn from(req: ResumeRequest) -> Self {
        SubscribeRequest {
            last_known: Sequence(req.last_known_seq),
            filter: KindFilter::All,
        }
    }
}

/// Core → client: one event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPush {
    pub sequence: u64,
    pub kind: String,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    /// RFC 3339.
    pub timestamp: String,
}

impl From<&Event> for EventPush {
    fn from(event: &Event) -> Self {
        Self {
            sequence: event.sequence.0,
            kind: event.kind.clone(),
            payload: event.payload.clone(),
            timestamp: event.timestamp.to_rfc3339(),
        }
    }
}

impl TryFrom<EventPush> for Event {
    type Error = SyncError;

    fn try_from(push: EventPush) -> Result<Self> {
        let timestamp = Timestamp::parse_rfc3339(&push.timestamp).ok_or_else(|| {
            SyncError::Deserialization(format!("invalid timestamp: {}", push.timestamp))
        })?;
        Ok(Event {
            sequence: Sequence(push.sequence),
            timestamp,
            kind: push.kind,
            payload: push.payload,
        })
    }
}

/// Core → client: terminal refusal of an attach attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidResume {
    pub error: String,
    pub head: u64,
}

impl InvalidResume {
    pub fn new(head: Sequence) -> Self {
        Self {
            error: INVALID_RESUME_POINT.to_string(),
            head: head.0,
        }
    }
}

/// Any message the core sends to a client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Event(EventPush),
    InvalidResume(InvalidResume),
}

impl ServerMessage {
    pub fn event(event: &Event) -> Self {
        ServerMessage::Event(EventPush::from(event))
    }

    /// The client-visible form of an error, if it has one.
    ///
    /// Only `InvalidResumePoint` is reported to clients; everything else is
    /// resolved inside the engine.
    pub fn from_error(err: &SyncError) -> Option<Self> {
        match err {
            SyncError::InvalidResumePoint { head, .. } => {
                Some(ServerMessage::InvalidResume(InvalidResume::new(*head)))
            }
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| SyncError::Deserialization(e.to_string()))
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

impl ResumeRequest {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| SyncError::Deserialization(e.to_string()))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}
