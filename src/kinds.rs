//! Registration table mapping event kinds to payload encodings.
//!
//! The table is built once at startup and frozen. Installing it on the
//! history log makes appends of unregistered kinds fail fast.

use crate::error::{Result, SyncError};
use crate::types::{Event, EventInput};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Payload encoding format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    #[default]
    Json,
    MessagePack,
    /// Bytes are passed through untouched; typed encode/decode is rejected.
    Raw,
}

/// Frozen mapping of event kind to payload encoding.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(try_from = "HashMap<String, PayloadEncoding>")]
pub struct KindRegistry {
    kinds: HashMap<String, PayloadEncoding>,
}

impl KindRegistry {
    /// Start building a registry.
    pub fn builder() -> KindRegistryBuilder {
        KindRegistryBuilder::default()
    }

    /// Get the encoding registered for `kind`.
    pub fn encoding(&self, kind: &str) -> Option<PayloadEncoding> {
        self.kinds.get(kind).copied()
    }

    /// Check if `kind` is registered.
    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    /// Number of registered kinds.
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Check if no kinds are registered.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Fail with `UnknownKind` if `kind` was never registered.
    pub fn check(&self, kind: &str) -> Result<PayloadEncoding> {
        self.encoding(kind)
            .ok_or_else(|| SyncError::UnknownKind(kind.to_string()))
    }

    /// Serialize a domain value with the strategy registered for `kind`.
    pub fn encode<T: Serialize>(&self, kind: &str, value: &T) -> Result<EventInput> {
        let payload = match self.check(kind)? {
            PayloadEncoding::Json => serde_json::to_vec(value)?,
            PayloadEncoding::MessagePack => rmp_serde::to_vec_named(value)?,
            PayloadEncoding::Raw => {
                return Err(SyncError::Serialization(format!(
                    "kind {} is registered as raw bytes",
                    kind
                )))
            }
        };
        Ok(EventInput::raw(kind, payload))
    }

    /// Deserialize an event's payload with the strategy registered for its kind.
    pub fn decode<T: DeserializeOwned>(&self, event: &Event) -> Result<T> {
        match self.check(&event.kind)? {
            PayloadEncoding::Json => serde_json::from_slice(&event.payload)
                .map_err(|e| SyncError::Deserialization(e.to_string())),
            PayloadEncoding::MessagePack => Ok(rmp_serde::from_slice(&event.payload)?),
            PayloadEncoding::Raw => Err(SyncError::Deserialization(format!(
                "kind {} is registered as raw bytes",
                event.kind
            ))),
        }
    }
}

impl TryFrom<HashMap<String, PayloadEncoding>> for KindRegistry {
    type Error = SyncError;

    fn try_from(map: HashMap<String, PayloadEncoding>) -> Result<Self> {
        map.into_iter()
            .fold(KindRegistry::builder(), |b, (kind, enc)| b.register(kind, enc))
            .build()
    }
}

/// Collects registrations; validation happens in [`KindRegistryBuilder::build`].
#[derive(Default)]
pub struct KindRegistryBuilder {
    entries: Vec<(String, PayloadEncoding)>,
}

impl KindRegistryBuilder {
    /// Register `kind` with its payload encoding.
    pub fn register(mut self, kind: impl Into<String>, encoding: PayloadEncoding) -> Self {
        self.entries.push((kind.into(), encoding));
        self
    }

    /// Validate the registrations and build the registry.
    pub fn build(self) -> Result<KindRegistry> {
        let mut kinds = HashMap::with_capacity(self.entries.len());
        for (kind, encoding) in self.entries {
            if kind.trim().is_empty() {
                return Err(SyncError::InvalidRegistration("empty kind name".into()));
            }
            if kind.len() > u16::MAX as usize {
                return Err(SyncError::InvalidRegistration(format!(
                    "kind name too long: {} bytes",
                    kind.len()
                )));
            }
            if kinds.insert(kind.clone(), encoding).is_some() {
                return Err(SyncError::InvalidRegistration(format!(
                    "kind {} registered twice",
                    kind
                )));
            }
        }
        Ok(KindRegistry { kinds })
    }
}
