//! Live subscriptions over the history log.
//!
//! This module keeps attached viewers in step with the log:
//! - [`SubscriptionRegistry`] attaches and detaches connections
//! - [`CatchUpProtocol`] replays the gap between a client's cursor and the head
//! - [`Broadcaster`] fans each new event out to per-subscriber bounded queues
//!
//! Every subscriber is registered as a broadcast target *before* its replay
//! boundary is captured, and its worker drains the queue only after replay,
//! so each event is delivered exactly once and in sequence order. A
//! subscriber whose queue overflows is detached; the writer never waits.
//!
//! # Example
//!
//! ```ignore
//! let (conn, client) = ChannelConnection::unbounded();
//! let id = registry.subscribe(Arc::new(conn), SubscribeRequest::resume(Sequence(3)))?;
//!
//! while let Ok(event) = client.recv() {
//!     println!("{:?} {}", event.sequence, event.kind);
//! }
//! ```

mod broadcast;
mod catchup;
mod connection;
pub(crate) mod registry;
mod types;

pub use broadcast::Broadcaster;
pub use catchup::{CatchUpOutcome, CatchUpProtocol};
pub use connection::{ChannelConnection, ChannelReceiver, CloseHook, Connection};
pub use registry::SubscriptionRegistry;
pub use types::{KindFilter, SubscribeRequest, SubscriptionConfig};
