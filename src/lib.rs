//! # History Sync
//!
//! An append-only event history that keeps live viewers synchronized with
//! it, including viewers that connect late or reconnect after a drop.
//!
//! ## Core Concepts
//!
//! - **Events**: Immutable entries with a gap-free, strictly increasing sequence
//! - **History log**: The single writer assigning sequences and persisting events
//! - **Subscribers**: Connections with a cursor, caught up from storage then fed live
//! - **Backpressure**: A subscriber that can't keep up is detached, never waited on
//!
//! ## Example
//!
//! ```ignore
//! use history_sync::{ChannelConnection, Engine, EngineConfig, EventInput, MemoryStore, SubscribeRequest};
//!
//! let engine = Engine::start(Arc::new(MemoryStore::new()), EngineConfig::default())?;
//!
//! // Append an event
//! let event = engine.append(EventInput::json("state_changed", &json!({
//!     "key": "door", "state": "open"
//! }))?)?;
//!
//! // Attach a viewer resuming after sequence 0
//! let (conn, client) = ChannelConnection::unbounded();
//! let id = engine.subscribe(Arc::new(conn), SubscribeRequest::from_start())?;
//! let first = client.recv()?;
//! ```

pub mod engine;
pub mod error;
pub mod kinds;
pub mod log;
pub mod storage;
pub mod subscriptions;
pub mod types;
pub mod wire;

// Re-exports
pub use engine::{Engine, EngineConfig};
pub use error::{ConnectionError, Result, SyncError};
pub use kinds::{KindRegistry, KindRegistryBuilder, PayloadEncoding};
pub use log::HistoryLog;
pub use storage::{EventStore, FileStore, FileStoreConfig, MemoryStore};
pub use subscriptions::{
    Broadcaster, CatchUpOutcome, CatchUpProtocol, ChannelConnection, ChannelReceiver, CloseHook,
    Connection, KindFilter, SubscribeRequest, SubscriptionConfig, SubscriptionRegistry,
};
pub use types::*;
pub use wire::{EventPush, InvalidResume, ResumeRequest, ServerMessage};
