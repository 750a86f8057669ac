//! In-memory event store.

use super::EventStore;
use crate::error::Result;
use crate::types::{Event, EventInput, Sequence, Timestamp};
use parking_lot::RwLock;

/// Volatile store keeping every event in a vector indexed by `sequence - 1`.
#[derive(Default)]
pub struct MemoryStore {
    events: RwLock<Vec<Event>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

impl EventStore for MemoryStore {
    fn append(&self, input: &EventInput, timestamp: Timestamp) -> Result<Sequence> {
        let mut events = self.events.write();
        let sequence = Sequence(events.len() as u64 + 1);
        events.push(input.clone().into_event(sequence, timestamp));
        Ok(sequence)
    }

    fn read_range(&self, from_exclusive: Sequence, to_inclusive: Sequence) -> Result<Vec<Event>> {
        let events = self.events.read();
        let end = (to_inclusive.0 as usize).min(events.len());
        let start = (from_exclusive.0 as usize).min(end);
        Ok(events[start..end].to_vec())
    }

    fn head(&self) -> Result<Sequence> {
        Ok(Sequence(self.events.read().len() as u64))
    }
}
