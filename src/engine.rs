//! Engine tying the store, log, broadcaster and registry together.

use crate::error::Result;
use crate::kinds::KindRegistry;
use crate::log::HistoryLog;
use crate::storage::EventStore;
use crate::subscriptions::registry::SubscriberSet;
use crate::subscriptions::{
    Broadcaster, CatchUpProtocol, Connection, SubscribeRequest, SubscriptionConfig,
    SubscriptionRegistry,
};
use crate::types::{DetachReason, Event, EventInput, Sequence, SubscriberId, SubscriberState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Engine configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub subscription: SubscriptionConfig,

    /// Kinds allowed in the log (None = any kind).
    pub kinds: Option<KindRegistry>,
}

/// One explicitly-owned history engine.
///
/// Provides a unified interface for:
/// - Appending events to the log
/// - Attaching and detaching subscribers
/// - Orderly shutdown
pub struct Engine {
    log: Arc<HistoryLog>,
    registry: SubscriptionRegistry,
}

impl Engine {
    /// Start an engine over `store`.
    pub fn start(store: Arc<dyn EventStore>, config: EngineConfig) -> Result<Self> {
        let subscribers = Arc::new(SubscriberSet::new());
        let broadcaster = Broadcaster::new(Arc::clone(&subscribers));
        let log = Arc::new(HistoryLog::open(store, broadcaster, config.kinds)?);
        let catch_up = Arc::new(CatchUpProtocol::new(
            Arc::clone(&log),
            config.subscription.replay_batch_size,
        ));
        let registry = SubscriptionRegistry::new(subscribers, catch_up, config.subscription);

        tracing::info!(head = log.current_head().0, "engine started");
        Ok(Self { log, registry })
    }

    // --- Log Operations ---

    /// Append an event to the log.
    pub fn append(&self, input: EventInput) -> Result<Arc<Event>> {
        self.log.append(input)
    }

    /// Append several events with consecutive sequences.
    pub fn append_batch(&self, inputs: Vec<EventInput>) -> Result<Vec<Arc<Event>>> {
        self.log.append_batch(inputs)
    }

    /// Encode a value for `kind` and append it.
    pub fn append_value<T: Serialize>(&self, kind: &str, value: &T) -> Result<Arc<Event>> {
        self.log.append_value(kind, value)
    }

    /// Get the current head sequence.
    pub fn head(&self) -> Sequence {
        self.log.current_head()
    }

    /// Get the underlying history log.
    pub fn log(&self) -> &Arc<HistoryLog> {
        &self.log
    }

    // --- Subscription Operations ---

    /// Attach a connection, resuming after `request.last_known`.
    pub fn subscribe(
        &self,
        connection: Arc<dyn Connection>,
        request: SubscribeRequest,
    ) -> Result<SubscriberId> {
        self.registry.subscribe(connection, request)
    }

    /// Detach a subscriber.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.registry.unsubscribe(id)
    }

    /// Get the number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.registry.subscriber_count()
    }

    /// Get a subscriber's state, if still attached.
    pub fn subscriber_state(&self, id: SubscriberId) -> Option<SubscriberState> {
        self.registry.state(id)
    }

    /// Get a subscriber's cursor, if still attached.
    pub fn subscriber_cursor(&self, id: SubscriberId) -> Option<Sequence> {
        self.registry.cursor(id)
    }

    /// Get the subscription registry.
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Stop accepting appends and subscriptions, sync the store, detach
    /// everyone and wait for their delivery workers to exit.
    ///
    /// Subscribers are released even when the final sync fails; that error
    /// is returned afterwards.
    pub fn shutdown(&self) -> Result<()> {
        let closed = self.log.close();
        let detached = self.registry.detach_all(DetachReason::Shutdown);
        self.registry.join_workers();

        match &closed {
            Ok(()) => tracing::info!(detached, head = self.head().0, "engine stopped"),
            Err(e) => tracing::error!(detached, error = %e, "engine stopped with unsynced store"),
        }
        closed
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.log.is_closed() {
            let _ = self.shutdown();
        }
    }
}
