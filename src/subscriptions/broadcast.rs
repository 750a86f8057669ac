//! Fan-out of appended events to every attached subscriber.

use super::registry::SubscriberSet;
use crate::types::{DetachReason, Event, SubscriberId};
use crossbeam_channel::TrySendError;
use std::sync::Arc;

/// Pushes each appended event onto every subscriber's private queue.
///
/// `publish` never blocks: a full queue detaches its subscriber.
pub struct Broadcaster {
    subscribers: Arc<SubscriberSet>,
}

impl Broadcaster {
    pub(crate) fn new(subscribers: Arc<SubscriberSet>) -> Self {
        Self { subscribers }
    }

    /// Enqueue `event` for every subscriber, `CatchingUp` or `Live`.
    ///
    /// Returns the number of queues the event was placed on. Called by the
    /// history log under its write lock, so rounds never interleave.
    pub fn publish(&self, event: Arc<Event>) -> usize {
        let mut enqueued = 0;
        let mut dropped: Vec<(SubscriberId, DetachReason)> = Vec::new();

        {
            // Holding the read lock for the whole round gives a coherent
            // snapshot: nobody joins or leaves mid-round.
            let entries = self.subscribers.read();
            for (id, entry) in entries.iter() {
                match entry.sender.try_send(Arc::clone(&event)) {
                    Ok(()) => enqueued += 1,
                    Err(TrySendError::Full(_)) => {
                        dropped.push((*id, DetachReason::QueueOverflow));
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        dropped.push((*id, DetachReason::ConnectionClosed));
                    }
                }
            }
        }

        for (id, reason) in dropped {
            self.subscribers.detach(id, reason);
        }

        tracing::trace!(sequence = event.sequence.0, enqueued, "published event");
        enqueued
    }

    /// Number of subscribers the next round would visit.
    pub fn audience(&self) -> usize {
        self.subscribers.len()
    }
}
