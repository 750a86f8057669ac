//! The history log: single writer, monotonic sequence assignment.

use crate::error::{Result, SyncError};
use crate::kinds::KindRegistry;
use crate::storage::EventStore;
use crate::subscriptions::Broadcaster;
use crate::types::{Event, EventInput, Sequence, Timestamp};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Authoritative append-only sequence of events.
///
/// Appends are serialized by a write lock held across the store write, so
/// a sequence number is only ever observed once its event is durable. The
/// head is published through an atomic and can be read without touching the
/// lock.
pub struct HistoryLog {
    store: Arc<dyn EventStore>,

    /// Sequence of the last completed append.
    head: AtomicU64,

    /// Lock for appends to keep sequence assignment and persistence atomic.
    write_lock: Mutex<()>,

    broadcaster: Broadcaster,

    /// When set, only registered kinds may be appended.
    kinds: Option<KindRegistry>,

    closed: AtomicBool,
}

impl HistoryLog {
    /// Start the log over `store`, picking up its current head.
    pub fn open(
        store: Arc<dyn EventStore>,
        broadcaster: Broadcaster,
        kinds: Option<KindRegistry>,
    ) -> Result<Self> {
        let head = store.head()?;
        tracing::debug!(head = head.0, "opened history log");

        Ok(Self {
            store,
            head: AtomicU64::new(head.0),
            write_lock: Mutex::new(()),
            broadcaster,
            kinds,
            closed: AtomicBool::new(false),
        })
    }

    /// Append an event and publish it to subscribers.
    ///
    /// Fails without consuming a sequence number if the store rejects the
    /// write. Never blocks on subscribers.
    pub fn append(&self, input: EventInput) -> Result<Arc<Event>> {
        self.check_kind(&input.kind)?;

        let _lock = self.write_lock.lock();
        self.ensure_open()?;
        self.append_locked(input)
    }

    /// Append several events with consecutive sequence numbers.
    ///
    /// Stops at the first failure; events persisted before it stay in the
    /// log and have been published.
    pub fn append_batch(&self, inputs: Vec<EventInput>) -> Result<Vec<Arc<Event>>> {
        for input in &inputs {
            self.check_kind(&input.kind)?;
        }

        let _lock = self.write_lock.lock();
        self.ensure_open()?;
        inputs
            .into_iter()
            .map(|input| self.append_locked(input))
            .collect()
    }

    /// Encode `value` with the strategy registered for `kind` and append it.
    ///
    /// Without a kind registry the value is encoded as JSON.
    pub fn append_value<T: Serialize>(&self, kind: &str, value: &T) -> Result<Arc<Event>> {
        let input = match &self.kinds {
            Some(kinds) => kinds.encode(kind, value)?,
            None => EventInput::json(kind, value)?,
        };
        self.append(input)
    }

    /// Sequence of the latest completed append (0 if empty).
    pub fn current_head(&self) -> Sequence {
        Sequence(self.head.load(Ordering::Acquire))
    }

    /// Persisted events with `from_exclusive < sequence <= to_inclusive`.
    pub fn read_range(&self, from_exclusive: Sequence, to_inclusive: Sequence) -> Result<Vec<Event>> {
        self.store.read_range(from_exclusive, to_inclusive)
    }

    /// Stop accepting appends. Waits for an in-flight append to finish.
    pub fn close(&self) -> Result<()> {
        let _lock = self.write_lock.lock();
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!(head = self.current_head().0, "closing history log");
            self.store.sync()?;
        }
        Ok(())
    }

    /// Check if the log has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Get the kind registry, if one is installed.
    pub fn kinds(&self) -> Option<&KindRegistry> {
        self.kinds.as_ref()
    }

    /// Get the broadcaster fed by appends.
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    fn check_kind(&self, kind: &str) -> Result<()> {
        if let Some(kinds) = &self.kinds {
            kinds.check(kind)?;
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(SyncError::Closed)
        } else {
            Ok(())
        }
    }

    /// Caller must hold `write_lock`.
    fn append_locked(&self, input: EventInput) -> Result<Arc<Event>> {
        let expected = self.current_head().next();
        let timestamp = Timestamp::now();

        let sequence = self.store.append(&input, timestamp).map_err(|e| {
            tracing::error!(kind = %input.kind, error = %e, "append rejected by store");
            e
        })?;

        if sequence != expected {
            return Err(SyncError::Corruption(format!(
                "store assigned {:?}, expected {:?}",
                sequence, expected
            )));
        }

        let event = Arc::new(input.into_event(sequence, timestamp));
        self.head.store(sequence.0, Ordering::Release);

        let enqueued = self.broadcaster.publish(Arc::clone(&event));
        tracing::debug!(
            sequence = sequence.0,
            kind = %event.kind,
            subscribers = enqueued,
            "appended event"
        );

        Ok(event)
    }
}
