//! Connection abstraction and an in-process channel implementation.

use crate::error::ConnectionError;
use crate::types::Event;
use crossbeam_channel::{bounded, select, unbounded, Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Callback fired once when a connection closes or errors.
pub type CloseHook = Box<dyn FnOnce() + Send + 'static>;

/// Externally-owned duplex channel to one client.
///
/// The engine holds a handle but never owns the connection's lifecycle; it
/// only calls [`Connection::close`] when it detaches the subscriber.
pub trait Connection: Send + Sync {
    /// Push one event to the client.
    fn send(&self, event: &Event) -> Result<(), ConnectionError>;

    /// Close from the engine's side. Must be idempotent.
    ///
    /// Called while detaching, which can happen on the writer's path when a
    /// queue overflows, so it must not block. It must also wake a `send`
    /// that is blocked on this connection.
    fn close(&self);

    /// Register a hook to run when the connection closes for any reason.
    /// If already closed, the hook runs immediately.
    ///
    /// Hooks may run from inside `close` and may re-enter the registry.
    fn on_close(&self, hook: CloseHook);

    /// Short description for logs.
    fn describe(&self) -> String {
        "connection".to_string()
    }
}

struct Shared {
    open: AtomicBool,
    hooks: Mutex<Vec<CloseHook>>,
    /// Dropped on close to wake a blocked `send`.
    closed_tx: Mutex<Option<Sender<()>>>,
    closed_rx: Receiver<()>,
    sent: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        let (closed_tx, closed_rx) = bounded(0);
        Self {
            open: AtomicBool::new(true),
            hooks: Mutex::new(Vec::new()),
            closed_tx: Mutex::new(Some(closed_tx)),
            closed_rx,
            sent: AtomicU64::new(0),
        }
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        self.closed_tx.lock().take();
        let hooks = std::mem::take(&mut *self.hooks.lock());
        for hook in hooks {
            hook();
        }
    }
}

/// In-process connection delivering events over a crossbeam channel.
///
/// With a bounded channel, `send` blocks while the client is not reading,
/// which models a slow consumer. Closing either end fails further sends.
pub struct ChannelConnection {
    sender: Sender<Event>,
    shared: Arc<Shared>,
    label: String,
}

/// Client end of a [`ChannelConnection`].
pub struct ChannelReceiver {
    receiver: Receiver<Event>,
    shared: Arc<Shared>,
}

impl ChannelConnection {
    /// Connection whose client buffers without limit.
    pub fn unbounded() -> (Self, ChannelReceiver) {
        Self::from_channel(unbounded())
    }

    /// Connection whose client buffers at most `capacity` events.
    pub fn bounded(capacity: usize) -> (Self, ChannelReceiver) {
        Self::from_channel(bounded(capacity))
    }

    fn from_channel((sender, receiver): (Sender<Event>, Receiver<Event>)) -> (Self, ChannelReceiver) {
        let shared = Arc::new(Shared::new());
        (
            Self {
                sender,
                shared: Arc::clone(&shared),
                label: "channel".to_string(),
            },
            ChannelReceiver { receiver, shared },
        )
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Number of successful sends.
    pub fn sent_count(&self) -> u64 {
        self.shared.sent.load(Ordering::Acquire)
    }
}

impl Connection for ChannelConnection {
    fn send(&self, event: &Event) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed);
        }

        select! {
            send(self.sender, event.clone()) -> res => match res {
                Ok(()) => {
                    self.shared.sent.fetch_add(1, Ordering::AcqRel);
                    Ok(())
                }
                Err(_) => {
                    self.shared.close();
                    Err(ConnectionError::Closed)
                }
            },
            recv(self.shared.closed_rx) -> _ => Err(ConnectionError::Closed),
        }
    }

    fn close(&self) {
        self.shared.close();
    }

    fn on_close(&self, hook: CloseHook) {
        {
            let mut hooks = self.shared.hooks.lock();
            if self.is_open() {
                hooks.push(hook);
                return;
            }
        }
        hook();
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

impl ChannelReceiver {
    pub fn recv(&self) -> Result<Event, RecvError> {
        self.receiver.recv()
    }

    pub fn try_recv(&self) -> Result<Event, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Event, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything currently buffered, without blocking.
    pub fn drain(&self) -> Vec<Event> {
        self.receiver.try_iter().collect()
    }

    /// Whether the connection is still open.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Close from the client's side, firing the close hooks.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for ChannelReceiver {
    fn drop(&mut self) {
        self.shared.close();
    }
}
