//! Ordering guarantees under concurrent appends and joins.

use history_sync::{
    ChannelConnection, ChannelReceiver, CloseHook, Connection, ConnectionError, Engine,
    EngineConfig, Event, EventInput, MemoryStore, Sequence, SubscribeRequest, SubscriptionConfig,
    SyncError,
};
use proptest::prelude::*;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn test_engine() -> Arc<Engine> {
    Arc::new(
        Engine::start(
            Arc::new(MemoryStore::new()),
            EngineConfig {
                subscription: SubscriptionConfig {
                    queue_capacity: 100_000,
                    replay_batch_size: 7,
                },
                ..Default::default()
            },
        )
        .unwrap(),
    )
}

fn append_n(engine: &Engine, n: u64) {
    for _ in 0..n {
        engine.append(EventInput::raw("tick", vec![])).unwrap();
    }
}

fn receive(client: &ChannelReceiver, n: usize) -> Vec<u64> {
    let mut seqs = Vec::with_capacity(n);
    while seqs.len() < n {
        match client.recv_timeout(Duration::from_secs(10)) {
            Ok(event) => seqs.push(event.sequence.0),
            Err(_) => break,
        }
    }
    seqs
}

#[test]
fn test_concurrent_writers_and_late_joiners() {
    const WRITERS: u64 = 4;
    const PER_WRITER: u64 = 250;
    const TOTAL: u64 = WRITERS * PER_WRITER;

    let engine = test_engine();
    append_n(&engine, 20);

    let barrier = Arc::new(Barrier::new((WRITERS + 1) as usize));
    let writers: Vec<_> = (0..WRITERS)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                append_n(&engine, PER_WRITER);
            })
        })
        .collect();

    // Join at staggered resume points while the writers are running.
    barrier.wait();
    let mut clients = Vec::new();
    for resume in [0u64, 5, 20] {
        let (conn, client) = ChannelConnection::unbounded();
        engine
            .subscribe(Arc::new(conn), SubscribeRequest::resume(Sequence(resume)))
            .unwrap();
        clients.push((resume, client));
        thread::yield_now();
    }

    for w in writers {
        w.join().unwrap();
    }
    let head = 20 + TOTAL;
    assert_eq!(engine.head(), Sequence(head));

    for (resume, client) in clients {
        let expected: Vec<u64> = (resume + 1..=head).collect();
        assert_eq!(receive(&client, expected.len()), expected);
        assert!(client.recv_timeout(Duration::from_millis(20)).is_err());
    }
}

#[test]
fn test_subscribe_churn_does_not_disturb_others() {
    let engine = test_engine();
    let (conn, steady) = ChannelConnection::unbounded();
    engine
        .subscribe(Arc::new(conn), SubscribeRequest::from_start())
        .unwrap();

    let churn = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            for _ in 0..50 {
                let (conn, _client) = ChannelConnection::unbounded();
                let id = engine
                    .subscribe(Arc::new(conn), SubscribeRequest::from_start())
                    .unwrap();
                engine.unsubscribe(id);
            }
        })
    };

    append_n(&engine, 300);
    churn.join().unwrap();

    assert_eq!(receive(&steady, 300), (1..=300).collect::<Vec<_>>());
    assert_eq!(engine.subscriber_count(), 1);
}

/// Connection that accepts everything and holds a shared token, so the test
/// can tell when the engine has let go of every connection.
struct TokenConnection {
    _token: Arc<()>,
}

impl Connection for TokenConnection {
    fn send(&self, _event: &Event) -> Result<(), ConnectionError> {
        Ok(())
    }

    fn close(&self) {}

    fn on_close(&self, _hook: CloseHook) {}
}

#[test]
fn test_subscribe_racing_shutdown_leaves_no_workers() {
    let engine = test_engine();
    append_n(&engine, 50);
    let token = Arc::new(());

    let subscribers: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let token = Arc::clone(&token);
            thread::spawn(move || {
                for i in 0..500 {
                    let conn = TokenConnection {
                        _token: Arc::clone(&token),
                    };
                    match engine.subscribe(Arc::new(conn), SubscribeRequest::from_start()) {
                        // Keep every tenth attached until shutdown.
                        Ok(id) if i % 10 != 0 => engine.unsubscribe(id),
                        Ok(_) => {}
                        Err(SyncError::Closed) => break,
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    engine.shutdown().unwrap();
    for s in subscribers {
        s.join().unwrap();
    }

    // Every accepted subscriber was detached and its worker joined.
    assert_eq!(engine.subscriber_count(), 0);
    assert_eq!(Arc::strong_count(&token), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_resume_delivers_exact_suffix(
        before in 0u64..40,
        resume_frac in 0.0f64..=1.0,
        after in 0u64..40,
    ) {
        let engine = test_engine();
        append_n(&engine, before);
        let resume = (before as f64 * resume_frac).floor() as u64;

        let (conn, client) = ChannelConnection::unbounded();
        engine
            .subscribe(Arc::new(conn), SubscribeRequest::resume(Sequence(resume)))
            .unwrap();
        append_n(&engine, after);

        let expected: Vec<u64> = (resume + 1..=before + after).collect();
        prop_assert_eq!(receive(&client, expected.len()), expected);
        prop_assert!(client.recv_timeout(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn prop_head_counts_appends(n in 0u64..100) {
        let engine = test_engine();
        for i in 1..=n {
            let event = engine.append(EventInput::raw("tick", vec![])).unwrap();
            prop_assert_eq!(event.sequence, Sequence(i));
        }
        prop_assert_eq!(engine.head(), Sequence(n));
    }
}
