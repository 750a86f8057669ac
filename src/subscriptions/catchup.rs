//! Catch-up protocol: replay persisted history up to a fixed boundary, then
//! hand the subscriber over to live delivery.

use super::types::Subscriber;
use crate::error::{ConnectionError, Result, SyncError};
use crate::log::HistoryLog;
use crate::types::{DetachReason, Event, Sequence};
use std::sync::Arc;

/// How a catch-up run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CatchUpOutcome {
    /// Replay reached the boundary; `replayed` counts events read from storage.
    Completed { replayed: u64 },
    /// The subscriber was detached while replaying.
    Cancelled,
    /// Replay failed and the subscriber must be detached.
    Failed(DetachReason),
}

/// Replays `(cursor, headAtStart]` from the store in ascending batches.
///
/// Events appended after `headAtStart` are never read here; they reach the
/// subscriber through its broadcast queue, which is drained only after
/// replay completes.
pub struct CatchUpProtocol {
    log: Arc<HistoryLog>,
    batch_size: u64,
}

impl CatchUpProtocol {
    pub fn new(log: Arc<HistoryLog>, batch_size: usize) -> Self {
        Self {
            log,
            batch_size: batch_size.max(1) as u64,
        }
    }

    /// Capture the replay boundary for a client resuming after `from`.
    pub fn boundary(&self, from: Sequence) -> Result<Sequence> {
        if self.log.is_closed() {
            return Err(SyncError::Closed);
        }
        let head = self.log.current_head();
        if from > head {
            return Err(SyncError::InvalidResumePoint {
                requested: from,
                head,
            });
        }
        Ok(head)
    }

    /// Whether the log has stopped accepting appends and subscriptions.
    pub(crate) fn is_closed(&self) -> bool {
        self.log.is_closed()
    }

    pub(crate) fn run(&self, subscriber: &Subscriber, head_at_start: Sequence) -> CatchUpOutcome {
        let mut replayed = 0u64;
        let mut cursor = subscriber.cursor();

        while cursor < head_at_start {
            if subscriber.is_detached() {
                return CatchUpOutcome::Cancelled;
            }

            let to = Sequence((cursor.0 + self.batch_size).min(head_at_start.0));
            let events = match self.log.read_range(cursor, to) {
                Ok(events) => events,
                Err(e) => {
                    tracing::error!(
                        subscriber = %subscriber.id,
                        from = cursor.0,
                        to = to.0,
                        error = %e,
                        "catch-up read failed"
                    );
                    return CatchUpOutcome::Failed(DetachReason::StorageFailure(e.to_string()));
                }
            };

            if events.is_empty() {
                return CatchUpOutcome::Failed(DetachReason::StorageFailure(format!(
                    "store returned nothing for ({}, {}]",
                    cursor, to
                )));
            }

            for event in &events {
                if subscriber.is_detached() {
                    return CatchUpOutcome::Cancelled;
                }
                if let Err(reason) = self.deliver(subscriber, event) {
                    return CatchUpOutcome::Failed(reason);
                }
                replayed += 1;
            }

            cursor = subscriber.cursor();
        }

        if subscriber.is_detached() {
            CatchUpOutcome::Cancelled
        } else {
            CatchUpOutcome::Completed { replayed }
        }
    }

    /// Deliver one event in cursor order.
    ///
    /// Events at or below the cursor were already delivered (they can be
    /// both replayed and queued when appended during registration) and are
    /// skipped. Anything past `cursor + 1` is a gap.
    pub(crate) fn deliver(&self, subscriber: &Subscriber, event: &Event) -> std::result::Result<(), DetachReason> {
        let cursor = subscriber.cursor();
        if event.sequence <= cursor {
            return Ok(());
        }

        let expected = cursor.next();
        if event.sequence != expected {
            return Err(DetachReason::SequenceGap {
                expected,
                got: event.sequence,
            });
        }

        if subscriber.filter.matches(&event.kind) {
            subscriber.connection.send(event).map_err(|e| match e {
                ConnectionError::Closed => DetachReason::ConnectionClosed,
                ConnectionError::Failed(msg) => DetachReason::SendFailed(msg),
            })?;
        }

        subscriber.advance(event.sequence);
        Ok(())
    }
}
