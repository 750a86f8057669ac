//! Subscriber registry: the single source of truth for who is attached.

use super::catchup::{CatchUpOutcome, CatchUpProtocol};
use super::connection::Connection;
use super::types::{SubscribeRequest, Subscriber, SubscriptionConfig};
use crate::error::{Result, SyncError};
use crate::types::{DetachReason, Event, Sequence, SubscriberId, SubscriberState};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

pub(crate) struct Entry {
    pub(crate) subscriber: Arc<Subscriber>,
    /// Producer side of the subscriber's private queue.
    pub(crate) sender: Sender<Arc<Event>>,
}

/// The set of attached subscribers, shared by the registry and the
/// broadcaster.
pub(crate) struct SubscriberSet {
    entries: RwLock<HashMap<SubscriberId, Entry>>,
}

impl SubscriberSet {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, subscriber: Arc<Subscriber>, sender: Sender<Arc<Event>>) {
        self.entries
            .write()
            .insert(subscriber.id, Entry { subscriber, sender });
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, HashMap<SubscriberId, Entry>> {
        self.entries.read()
    }

    pub(crate) fn get(&self, id: SubscriberId) -> Option<Arc<Subscriber>> {
        self.entries.read().get(&id).map(|e| Arc::clone(&e.subscriber))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Remove a subscriber from every delivery path and close its connection.
    ///
    /// Idempotent: returns false if `id` is unknown or already detached.
    pub(crate) fn detach(&self, id: SubscriberId, reason: DetachReason) -> bool {
        let removed = self.entries.write().remove(&id);
        let Some(entry) = removed else {
            return false;
        };

        if !entry.subscriber.mark_detached() {
            return false;
        }
        // Dropping the sender wakes the worker if it is waiting on the queue.
        drop(entry.sender);

        match &reason {
            DetachReason::Unsubscribed | DetachReason::Shutdown => {
                tracing::debug!(subscriber = %id, reason = ?reason, "detached subscriber");
            }
            _ => {
                tracing::warn!(
                    subscriber = %id,
                    cursor = entry.subscriber.cursor().0,
                    reason = ?reason,
                    "detached subscriber"
                );
            }
        }

        entry.subscriber.connection.close();
        true
    }

    pub(crate) fn detach_all(&self, reason: DetachReason) -> usize {
        let ids: Vec<SubscriberId> = self.entries.read().keys().copied().collect();
        ids.into_iter()
            .filter(|id| self.detach(*id, reason.clone()))
            .count()
    }
}

/// Attaches and detaches subscribers.
///
/// Each attached subscriber gets its own delivery worker thread which first
/// replays the gap from storage and then drains the subscriber's bounded
/// queue, so a slow connection never holds up the writer or other
/// subscribers.
pub struct SubscriptionRegistry {
    subscribers: Arc<SubscriberSet>,
    catch_up: Arc<CatchUpProtocol>,
    config: SubscriptionConfig,
    next_id: AtomicU64,
    /// Delivery worker threads not yet known to have exited.
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SubscriptionRegistry {
    pub(crate) fn new(
        subscribers: Arc<SubscriberSet>,
        catch_up: Arc<CatchUpProtocol>,
        config: SubscriptionConfig,
    ) -> Self {
        Self {
            subscribers,
            catch_up,
            config,
            next_id: AtomicU64::new(1),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Attach a connection, resuming after `request.last_known`.
    ///
    /// The subscriber is registered as a broadcast target before the replay
    /// boundary is captured, so every event is either replayed or queued.
    /// Fails with `InvalidResumePoint` (leaving no registration behind and
    /// the connection open) if the client claims a position beyond the head,
    /// and with `Closed` once the engine is shutting down.
    pub fn subscribe(
        &self,
        connection: Arc<dyn Connection>,
        request: SubscribeRequest,
    ) -> Result<SubscriberId> {
        // The head only grows, so a request rejected here never becomes a
        // broadcast target.
        self.catch_up.boundary(request.last_known)?;

        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(self.config.queue_capacity.max(1));

        let subscriber = Arc::new(Subscriber::new(
            id,
            connection,
            request.filter,
            request.last_known,
        ));
        self.subscribers.insert(Arc::clone(&subscriber), sender);

        let head_at_start = match self.catch_up.boundary(request.last_known) {
            Ok(head) => head,
            Err(e) => {
                self.discard(id);
                return Err(e);
            }
        };

        let worker = Worker {
            subscriber: Arc::clone(&subscriber),
            queue: receiver,
            catch_up: Arc::clone(&self.catch_up),
            subscribers: Arc::clone(&self.subscribers),
            head_at_start,
        };

        let handle = match thread::Builder::new()
            .name(id.to_string())
            .spawn(move || worker.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                self.discard(id);
                return Err(SyncError::Io(e));
            }
        };

        {
            // Checked under the workers lock so a concurrent shutdown either
            // sees this handle in `join_workers` or we see it closed here.
            let mut workers = self.workers.lock();
            if !self.catch_up.is_closed() {
                workers.retain(|h| !h.is_finished());
                workers.push(handle);
            } else {
                drop(workers);
                self.subscribers.detach(id, DetachReason::Shutdown);
                if handle.join().is_err() {
                    tracing::error!(subscriber = %id, "delivery worker panicked");
                }
                return Err(SyncError::Closed);
            }
        }

        let weak: Weak<SubscriberSet> = Arc::downgrade(&self.subscribers);
        subscriber.connection.on_close(Box::new(move || {
            if let Some(set) = weak.upgrade() {
                set.detach(id, DetachReason::ConnectionClosed);
            }
        }));

        tracing::debug!(
            subscriber = %id,
            connection = %subscriber.connection.describe(),
            from = request.last_known.0,
            head = head_at_start.0,
            "subscribed"
        );

        Ok(id)
    }

    /// Detach a subscriber. Unknown or already-detached ids are a no-op.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers.detach(id, DetachReason::Unsubscribed);
    }

    /// Detach every subscriber, returning how many were attached.
    pub fn detach_all(&self, reason: DetachReason) -> usize {
        self.subscribers.detach_all(reason)
    }

    /// Wait for every delivery worker to exit.
    ///
    /// Workers exit once their subscriber is detached, so call this after
    /// [`detach_all`](Self::detach_all). Must not be called from a worker.
    pub fn join_workers(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                tracing::error!("delivery worker panicked");
            }
        }
    }

    /// Number of attached subscribers (`CatchingUp` or `Live`).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// State of an attached subscriber; `None` once it has been detached.
    pub fn state(&self, id: SubscriberId) -> Option<SubscriberState> {
        self.subscribers.get(id).map(|s| s.state())
    }

    /// Last log position processed for an attached subscriber.
    pub fn cursor(&self, id: SubscriberId) -> Option<Sequence> {
        self.subscribers.get(id).map(|s| s.cursor())
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    /// Remove a registration that never got to run. The connection is left
    /// open so the caller can report the error on it.
    fn discard(&self, id: SubscriberId) {
        let removed = self.subscribers.entries.write().remove(&id);
        if let Some(entry) = removed {
            entry.subscriber.mark_detached();
        }
    }
}

/// Per-subscriber delivery task: catch-up, then live queue drain.
struct Worker {
    subscriber: Arc<Subscriber>,
    queue: Receiver<Arc<Event>>,
    catch_up: Arc<CatchUpProtocol>,
    subscribers: Arc<SubscriberSet>,
    head_at_start: Sequence,
}

impl Worker {
    fn run(self) {
        let id = self.subscriber.id;

        match self.catch_up.run(&self.subscriber, self.head_at_start) {
            CatchUpOutcome::Completed { replayed } => {
                if !self.subscriber.go_live() {
                    return;
                }
                tracing::info!(
                    subscriber = %id,
                    replayed,
                    cursor = self.subscriber.cursor().0,
                    "subscriber live"
                );
            }
            CatchUpOutcome::Cancelled => return,
            CatchUpOutcome::Failed(reason) => {
                self.subscribers.detach(id, reason);
                return;
            }
        }

        // Ends when the registry drops our sender on detach.
        for event in self.queue.iter() {
            if self.subscriber.is_detached() {
                return;
            }
            if let Err(reason) = self.catch_up.deliver(&self.subscriber, &event) {
                self.subscribers.detach(id, reason);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::HistoryLog;
    use crate::storage::MemoryStore;
    use crate::subscriptions::{Broadcaster, ChannelConnection, KindFilter};
    use crate::types::EventInput;
    use std::time::{Duration, Instant};

    struct Fixture {
        log: Arc<HistoryLog>,
        registry: SubscriptionRegistry,
    }

    fn fixture(config: SubscriptionConfig) -> Fixture {
        let set = Arc::new(SubscriberSet::new());
        let log = Arc::new(
            HistoryLog::open(
                Arc::new(MemoryStore::new()),
                Broadcaster::new(Arc::clone(&set)),
                None,
            )
            .unwrap(),
        );
        let catch_up = Arc::new(CatchUpProtocol::new(
            Arc::clone(&log),
            config.replay_batch_size,
        ));
        Fixture {
            log,
            registry: SubscriptionRegistry::new(set, catch_up, config),
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let f = fixture(SubscriptionConfig::default());
        let (conn, client) = ChannelConnection::unbounded();

        let id = f
            .registry
            .subscribe(Arc::new(conn), SubscribeRequest::from_start())
            .unwrap();
        assert_eq!(f.registry.subscriber_count(), 1);

        f.registry.unsubscribe(id);
        assert_eq!(f.registry.subscriber_count(), 0);
        assert_eq!(f.registry.state(id), None);
        assert!(!client.is_open());

        // Idempotent.
        f.registry.unsubscribe(id);
        f.registry.unsubscribe(SubscriberId(999));
        assert_eq!(f.registry.subscriber_count(), 0);
    }

    #[test]
    fn test_resume_ahead_of_head_rejected() {
        let f = fixture(SubscriptionConfig::default());
        f.log.append(EventInput::raw("a", vec![])).unwrap();
        let (conn, client) = ChannelConnection::unbounded();

        let result = f
            .registry
            .subscribe(Arc::new(conn), SubscribeRequest::resume(Sequence(10)));
        assert!(matches!(
            result,
            Err(SyncError::InvalidResumePoint { requested: Sequence(10), head: Sequence(1) })
        ));
        assert_eq!(f.registry.subscriber_count(), 0);
        assert!(client.is_open());
    }

    #[test]
    fn test_goes_live_after_catch_up() {
        let f = fixture(SubscriptionConfig::default());
        for _ in 0..3 {
            f.log.append(EventInput::raw("a", vec![])).unwrap();
        }
        let (conn, client) = ChannelConnection::unbounded();
        let id = f
            .registry
            .subscribe(Arc::new(conn), SubscribeRequest::from_start())
            .unwrap();

        assert!(wait_for(|| f.registry.state(id) == Some(SubscriberState::Live)));
        assert_eq!(f.registry.cursor(id), Some(Sequence(3)));
        assert_eq!(client.drain().len(), 3);
    }

    #[test]
    fn test_filtered_events_advance_cursor() {
        let f = fixture(SubscriptionConfig::default());
        f.log.append(EventInput::raw("text", b"1".to_vec())).unwrap();
        f.log.append(EventInput::raw("noise", b"2".to_vec())).unwrap();
        f.log.append(EventInput::raw("text", b"3".to_vec())).unwrap();

        let (conn, client) = ChannelConnection::unbounded();
        let id = f
            .registry
            .subscribe(
                Arc::new(conn),
                SubscribeRequest::from_start().with_filter(KindFilter::only(["text"])),
            )
            .unwrap();

        f.log.append(EventInput::raw("noise", b"4".to_vec())).unwrap();
        f.log.append(EventInput::raw("text", b"5".to_vec())).unwrap();

        assert!(wait_for(|| f.registry.cursor(id) == Some(Sequence(5))));
        let seqs: Vec<u64> = client.drain().iter().map(|e| e.sequence.0).collect();
        assert_eq!(seqs, vec![1, 3, 5]);
    }

    #[test]
    fn test_client_close_detaches() {
        let f = fixture(SubscriptionConfig::default());
        let (conn, client) = ChannelConnection::unbounded();
        f.registry
            .subscribe(Arc::new(conn), SubscribeRequest::from_start())
            .unwrap();

        client.close();
        assert_eq!(f.registry.subscriber_count(), 0);
    }

    #[test]
    fn test_rejected_resume_never_joins_broadcast() {
        let f = fixture(SubscriptionConfig {
            queue_capacity: 1,
            ..Default::default()
        });
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let writer = {
            let log = Arc::clone(&f.log);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    log.append(EventInput::raw("a", vec![])).unwrap();
                }
            })
        };

        for _ in 0..200 {
            let (conn, client) = ChannelConnection::unbounded();
            let result = f
                .registry
                .subscribe(Arc::new(conn), SubscribeRequest::resume(Sequence(u64::MAX / 2)));
            assert!(matches!(result, Err(SyncError::InvalidResumePoint { .. })));
            // Still open, so the caller can send the refusal on it.
            assert!(client.is_open());
        }

        stop.store(true, Ordering::SeqCst);
        writer.join().unwrap();
        assert_eq!(f.registry.subscriber_count(), 0);
    }

    #[test]
    fn test_subscribe_after_close_is_refused() {
        let f = fixture(SubscriptionConfig::default());
        f.log.close().unwrap();

        let (conn, client) = ChannelConnection::unbounded();
        let result = f
            .registry
            .subscribe(Arc::new(conn), SubscribeRequest::from_start());
        assert!(matches!(result, Err(SyncError::Closed)));
        assert_eq!(f.registry.subscriber_count(), 0);
        assert!(client.is_open());
    }
}
