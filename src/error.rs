//! Error types for the history engine.

use crate::types::Sequence;
use thiserror::Error;

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid resume point: {requested:?} is ahead of head {head:?}")]
    InvalidResumePoint { requested: Sequence, head: Sequence },

    #[error("Unknown event kind: {0}")]
    UnknownKind(String),

    #[error("Invalid kind registration: {0}")]
    InvalidRegistration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("History log is closed")]
    Closed,

    #[error("Store is locked by another process")]
    Locked,
}

impl SyncError {
    /// True for failures originating in the store adapter.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            SyncError::Io(_)
                | SyncError::Storage(_)
                | SyncError::Corruption(_)
                | SyncError::ChecksumMismatch { .. }
                | SyncError::Locked
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            SyncError::Deserialization(e.to_string())
        } else {
            SyncError::Serialization(e.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for SyncError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SyncError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SyncError::Deserialization(e.to_string())
    }
}

/// Failure of a single subscriber's connection. Always resolved locally by
/// detaching that subscriber.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,

    #[error("send failed: {0}")]
    Failed(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;
