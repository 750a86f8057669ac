//! Store adapters.
//!
//! The history log persists through the [`EventStore`] contract and never
//! touches storage directly. Two adapters ship with the crate:
//! - [`MemoryStore`]: volatile, for tests and embedding
//! - [`FileStore`]: an append-only binary log on disk

mod file;
mod memory;

pub use file::{FileStore, FileStoreConfig};
pub use memory::MemoryStore;

use crate::error::Result;
use crate::types::{Event, EventInput, Sequence, Timestamp};

/// Durable append/read/head operations over events.
///
/// Implementations are called by a single writer at a time for `append`,
/// but `read_range` and `head` may be called concurrently from catch-up
/// workers.
pub trait EventStore: Send + Sync {
    /// Persist an event and return the sequence it was stored at.
    ///
    /// Must return `head() + 1` on success. On failure nothing is persisted.
    fn append(&self, input: &EventInput, timestamp: Timestamp) -> Result<Sequence>;

    /// Events with `from_exclusive < sequence <= to_inclusive`, ascending.
    fn read_range(&self, from_exclusive: Sequence, to_inclusive: Sequence) -> Result<Vec<Event>>;

    /// Sequence of the most recently persisted event.
    fn head(&self) -> Result<Sequence>;

    /// Flush pending writes.
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
