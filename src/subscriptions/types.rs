//! Subscription types.

use super::connection::Connection;
use crate::types::{Sequence, SubscriberId, SubscriberState};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Configuration shared by every subscription.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Max queued live events per subscriber before it is detached.
    /// Default: 1024
    pub queue_capacity: usize,

    /// Max events read from the store per catch-up batch.
    /// Default: 256
    pub replay_batch_size: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            replay_batch_size: 256,
        }
    }
}

/// Which event kinds a subscriber wants delivered.
///
/// Filtered-out events still advance the subscriber's cursor, so a resume
/// point is always a log position.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KindFilter {
    #[default]
    All,
    Only(Vec<String>),
}

impl KindFilter {
    pub fn only<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KindFilter::Only(kinds.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, kind: &str) -> bool {
        match self {
            KindFilter::All => true,
            KindFilter::Only(kinds) => kinds.iter().any(|k| k == kind),
        }
    }
}

/// An already-authorized request to attach a connection.
#[derive(Clone, Debug, Default)]
pub struct SubscribeRequest {
    /// Last sequence the client has seen (0 = from the beginning).
    pub last_known: Sequence,
    pub filter: KindFilter,
}

impl SubscribeRequest {
    pub fn from_start() -> Self {
        Self::default()
    }

    pub fn resume(last_known: Sequence) -> Self {
        Self {
            last_known,
            filter: KindFilter::All,
        }
    }

    pub fn with_filter(mut self, filter: KindFilter) -> Self {
        self.filter = filter;
        self
    }
}

/// Registry-side view of one attached connection.
///
/// State and cursor are atomics: the delivery worker writes them, the
/// registry and broadcaster only read or detach.
pub(crate) struct Subscriber {
    pub(crate) id: SubscriberId,
    pub(crate) connection: Arc<dyn Connection>,
    pub(crate) filter: KindFilter,
    state: AtomicU8,
    cursor: AtomicU64,
}

impl Subscriber {
    pub(crate) fn new(
        id: SubscriberId,
        connection: Arc<dyn Connection>,
        filter: KindFilter,
        cursor: Sequence,
    ) -> Self {
        Self {
            id,
            connection,
            filter,
            state: AtomicU8::new(SubscriberState::CatchingUp.as_u8()),
            cursor: AtomicU64::new(cursor.0),
        }
    }

    pub(crate) fn state(&self) -> SubscriberState {
        SubscriberState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.state() == SubscriberState::Detached
    }

    pub(crate) fn cursor(&self) -> Sequence {
        Sequence(self.cursor.load(Ordering::Acquire))
    }

    /// Cursor only moves forward.
    pub(crate) fn advance(&self, to: Sequence) {
        self.cursor.fetch_max(to.0, Ordering::AcqRel);
    }

    /// `CatchingUp -> Live`. Fails if the subscriber was detached meanwhile.
    pub(crate) fn go_live(&self) -> bool {
        self.state
            .compare_exchange(
                SubscriberState::CatchingUp.as_u8(),
                SubscriberState::Live.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Returns true only for the call that performed the transition.
    pub(crate) fn mark_detached(&self) -> bool {
        self.state
            .swap(SubscriberState::Detached.as_u8(), Ordering::AcqRel)
            != SubscriberState::Detached.as_u8()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::ChannelConnection;

    fn subscriber() -> Subscriber {
        let (conn, _rx) = ChannelConnection::unbounded();
        Subscriber::new(SubscriberId(1), Arc::new(conn), KindFilter::All, Sequence(3))
    }

    #[test]
    fn test_state_transitions() {
        let sub = subscriber();
        assert_eq!(sub.state(), SubscriberState::CatchingUp);
        assert!(sub.go_live());
        assert_eq!(sub.state(), SubscriberState::Live);
        assert!(!sub.go_live());

        assert!(sub.mark_detached());
        assert!(!sub.mark_detached());
        assert!(sub.is_detached());
    }

    #[test]
    fn test_detached_cannot_go_live() {
        let sub = subscriber();
        assert!(sub.mark_detached());
        assert!(!sub.go_live());
        assert_eq!(sub.state(), SubscriberState::Detached);
    }

    #[test]
    fn test_cursor_never_moves_back() {
        let sub = subscriber();
        sub.advance(Sequence(7));
        sub.advance(Sequence(5));
        assert_eq!(sub.cursor(), Sequence(7));
    }

    #[test]
    fn test_kind_filter() {
        assert!(KindFilter::All.matches("anything"));
        let only = KindFilter::only(["text", "state"]);
        assert!(only.matches("text"));
        assert!(!only.matches("other"));
    }
}
