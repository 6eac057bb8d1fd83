use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use realtime_mux::{
    ConnectionStatus, ListenerCallbacks, RealtimeMux, ReconnectPolicy, ReconnectSnapshot,
    SubscribeOptions, SubscriptionHandle, SubscriptionRegistry,
};
use realtime_transport::{ChangeKind, ConnectionId, LocalTransport, TransportStatus};
use test_timeout::paused_timeout_test;

const TICKETS: &str = "tickets";
const P1: &str = "project_id=eq.P1";

async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

fn setup() -> (LocalTransport, Arc<RealtimeMux>) {
    let transport = LocalTransport::new();
    let mux = RealtimeMux::create(
        SubscriptionRegistry::create(),
        Arc::new(transport.clone()),
        ReconnectPolicy::default(),
    );
    (transport, mux)
}

fn tickets_p1(mux: &Arc<RealtimeMux>, callbacks: ListenerCallbacks) -> SubscriptionHandle {
    mux.subscribe(
        SubscribeOptions::new(TICKETS)
            .with_filter(P1)
            .with_callbacks(callbacks),
    )
}

fn current_connection(mux: &RealtimeMux, table: &str, filter: Option<&str>) -> ConnectionId {
    mux.channel(table, filter)
        .and_then(|entry| entry.connection_id())
        .expect("channel has a live connection")
}

fn counter_on_update(counter: &Arc<AtomicUsize>) -> ListenerCallbacks {
    let counter = counter.clone();
    ListenerCallbacks::new().on_update(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

#[paused_timeout_test]
async fn identical_subscriptions_share_one_connection() {
    let (transport, mux) = setup();
    let handles: Vec<_> = (0..5)
        .map(|_| tickets_p1(&mux, ListenerCallbacks::new()))
        .collect();

    assert_eq!(mux.registry().len(), 1);
    let entry = mux.channel(TICKETS, Some(P1)).expect("entry");
    assert_eq!(entry.listener_count(), handles.len());
    assert_eq!(transport.open_count(), 1);
    assert_eq!(transport.live_connections().len(), 1);

    let other = mux.subscribe(SubscribeOptions::new(TICKETS));
    assert_eq!(mux.registry().len(), 2);
    assert_eq!(transport.open_count(), 2);
    drop(other);
}

#[paused_timeout_test]
async fn connection_closes_exactly_when_last_listener_leaves() {
    let (transport, mux) = setup();
    let handles: Vec<_> = (0..3)
        .map(|_| tickets_p1(&mux, ListenerCallbacks::new()))
        .collect();
    let entry = mux.channel(TICKETS, Some(P1)).expect("entry");

    for (index, handle) in handles.iter().enumerate() {
        handle.unsubscribe();
        let remaining = handles.len() - index - 1;
        if remaining > 0 {
            assert_eq!(entry.listener_count(), remaining);
            assert_eq!(transport.close_count(), 0);
            assert_eq!(mux.registry().len(), 1);
        }
    }
    assert_eq!(transport.close_count(), 1);
    assert!(mux.registry().is_empty());
    assert!(entry.is_torn_down());

    for handle in &handles {
        handle.unsubscribe();
    }
    assert!(!entry.teardown());
    assert_eq!(transport.close_count(), 1);
}

#[paused_timeout_test]
async fn callback_hot_swap_keeps_the_connection() {
    let (transport, mux) = setup();
    let old_calls = Arc::new(AtomicUsize::new(0));
    let new_calls = Arc::new(AtomicUsize::new(0));
    let handle = tickets_p1(&mux, counter_on_update(&old_calls));
    let conn = current_connection(&mux, TICKETS, Some(P1));
    transport.acknowledge(conn).expect("ack");
    settle().await;

    for _ in 0..10 {
        handle.set_callbacks(counter_on_update(&new_calls));
    }
    transport
        .emit_change(conn, ChangeKind::Update, serde_json::json!({"id": "T-3"}))
        .expect("change");
    settle().await;

    assert_eq!(transport.open_count(), 1);
    assert_eq!(old_calls.load(Ordering::SeqCst), 0);
    assert_eq!(new_calls.load(Ordering::SeqCst), 1);
    assert_eq!(handle.status(), ConnectionStatus::Connected);
}

#[paused_timeout_test]
async fn backoff_doubles_and_stops_after_five_retries() {
    let (transport, mux) = setup();
    let handle = mux.subscribe(SubscribeOptions::new("projects"));

    let mut expected_opens = 1;
    for expected_ms in [1_000u64, 2_000, 4_000, 8_000, 16_000] {
        let conn = current_connection(&mux, "projects", None);
        transport
            .emit_status(conn, TransportStatus::ChannelError)
            .expect("fail");
        settle().await;

        let entry = mux.channel("projects", None).expect("entry survives failures");
        assert_eq!(
            entry.reconnect_snapshot().pending_delay,
            Some(Duration::from_millis(expected_ms))
        );
        assert_eq!(handle.status(), ConnectionStatus::Error);

        tokio::time::advance(Duration::from_millis(expected_ms - 1)).await;
        settle().await;
        assert_eq!(transport.open_count(), expected_opens, "retry fired early");

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        expected_opens += 1;
        assert_eq!(transport.open_count(), expected_opens);
        assert_eq!(handle.status(), ConnectionStatus::Connecting);
    }

    let conn = current_connection(&mux, "projects", None);
    transport
        .emit_status(conn, TransportStatus::TimedOut)
        .expect("fail");
    settle().await;
    let entry = mux.channel("projects", None).expect("entry");
    let snapshot = entry.reconnect_snapshot();
    assert!(snapshot.exhausted);
    assert_eq!(snapshot.pending_delay, None);
    assert_eq!(handle.status(), ConnectionStatus::Error);

    tokio::time::advance(Duration::from_secs(120)).await;
    settle().await;
    assert_eq!(transport.open_count(), 6);
}

#[paused_timeout_test]
async fn disabling_during_backoff_cancels_the_retry() {
    let (transport, mux) = setup();
    let handle = mux.subscribe(SubscribeOptions::new("projects"));
    let conn = current_connection(&mux, "projects", None);
    transport
        .emit_status(conn, TransportStatus::ChannelError)
        .expect("fail");
    settle().await;

    tokio::time::advance(Duration::from_millis(500)).await;
    handle.set_enabled(false);
    tokio::time::advance(Duration::from_secs(5)).await;
    settle().await;

    assert_eq!(transport.open_count(), 1);
    assert_eq!(transport.close_count(), 1);
    assert!(mux.registry().is_empty());
    assert_eq!(handle.status(), ConnectionStatus::Disconnected);
}

#[paused_timeout_test]
async fn failing_listener_does_not_starve_others() {
    let (transport, mux) = setup();
    let seen = Arc::new(AtomicUsize::new(0));
    let _broken = tickets_p1(
        &mux,
        ListenerCallbacks::new().on_update(|_| panic!("stale cache row")),
    );
    let _erroring = tickets_p1(
        &mux,
        ListenerCallbacks::new().on_update(|_| anyhow::bail!("cache miss")),
    );
    let _healthy = tickets_p1(&mux, counter_on_update(&seen));
    let conn = current_connection(&mux, TICKETS, Some(P1));

    for id in 0..3 {
        transport
            .emit_change(conn, ChangeKind::Update, serde_json::json!({"id": id}))
            .expect("change");
    }
    settle().await;
    assert_eq!(seen.load(Ordering::SeqCst), 3);
}

#[paused_timeout_test]
async fn events_arrive_in_order() {
    let (transport, mux) = setup();
    let seen: Arc<Mutex<Vec<(ChangeKind, i64)>>> = Arc::new(Mutex::new(Vec::new()));
    let record = |seen: &Arc<Mutex<Vec<(ChangeKind, i64)>>>| {
        let seen = seen.clone();
        move |event: &realtime_transport::ChangeEvent| {
            let id = event.payload["id"].as_i64().unwrap_or_default();
            seen.lock().push((event.kind, id));
            Ok::<(), anyhow::Error>(())
        }
    };
    let _handle = tickets_p1(
        &mux,
        ListenerCallbacks::new()
            .on_insert(record(&seen))
            .on_update(record(&seen))
            .on_delete(record(&seen)),
    );
    let conn = current_connection(&mux, TICKETS, Some(P1));
    let sequence = [
        (ChangeKind::Insert, 1),
        (ChangeKind::Update, 1),
        (ChangeKind::Insert, 2),
        (ChangeKind::Delete, 1),
    ];
    for (kind, id) in sequence {
        transport
            .emit_change(conn, kind, serde_json::json!({"id": id}))
            .expect("change");
    }
    settle().await;
    assert_eq!(seen.lock().as_slice(), sequence);
}

#[paused_timeout_test]
async fn transport_close_shares_the_retry_budget() {
    let (transport, mux) = setup();
    let handle = mux.subscribe(SubscribeOptions::new("projects"));
    let conn = current_connection(&mux, "projects", None);
    transport
        .emit_status(conn, TransportStatus::ChannelError)
        .expect("fail");
    settle().await;
    tokio::time::advance(Duration::from_millis(1_000)).await;
    settle().await;

    let conn = current_connection(&mux, "projects", None);
    transport
        .emit_status(conn, TransportStatus::Closed)
        .expect("close");
    settle().await;
    let snapshot = mux
        .channel("projects", None)
        .expect("entry")
        .reconnect_snapshot();
    assert_eq!(snapshot.attempts, 2);
    assert_eq!(snapshot.pending_delay, Some(Duration::from_millis(2_000)));
    assert_eq!(handle.status(), ConnectionStatus::Disconnected);

    tokio::time::advance(Duration::from_millis(2_000)).await;
    settle().await;
    let conn = current_connection(&mux, "projects", None);
    transport.acknowledge(conn).expect("ack");
    settle().await;
    assert_eq!(handle.status(), ConnectionStatus::Connected);
    assert_eq!(
        mux.channel("projects", None)
            .expect("entry")
            .reconnect_snapshot()
            .attempts,
        0
    );
}

async fn exhaust(transport: &LocalTransport, mux: &Arc<RealtimeMux>, table: &str) {
    for delay_ms in [1_000u64, 2_000, 4_000, 8_000, 16_000] {
        let conn = current_connection(mux, table, None);
        transport
            .emit_status(conn, TransportStatus::ChannelError)
            .expect("fail");
        settle().await;
        tokio::time::advance(Duration::from_millis(delay_ms)).await;
        settle().await;
    }
    let conn = current_connection(mux, table, None);
    transport
        .emit_status(conn, TransportStatus::ChannelError)
        .expect("fail");
    settle().await;
}

#[paused_timeout_test]
async fn re_enabling_after_exhaustion_starts_over() {
    let (transport, mux) = setup();
    let handle = mux.subscribe(SubscribeOptions::new("projects"));
    exhaust(&transport, &mux, "projects").await;
    assert_eq!(handle.status(), ConnectionStatus::Error);
    assert_eq!(transport.open_count(), 6);

    handle.set_enabled(false);
    handle.set_enabled(true);
    assert_eq!(transport.open_count(), 7);
    assert_eq!(handle.status(), ConnectionStatus::Connecting);
    let entry = mux.channel("projects", None).expect("fresh entry");
    assert_eq!(entry.reconnect_snapshot().attempts, 0);
    assert!(!entry.reconnect_snapshot().exhausted);
}

#[paused_timeout_test]
async fn rejoining_an_exhausted_shared_channel_resets_it() {
    let (transport, mux) = setup();
    let first = mux.subscribe(SubscribeOptions::new("projects"));
    let second = mux.subscribe(SubscribeOptions::new("projects"));
    exhaust(&transport, &mux, "projects").await;
    assert_eq!(second.status(), ConnectionStatus::Error);

    first.set_enabled(false);
    first.set_enabled(true);
    let entry = mux.channel("projects", None).expect("entry");
    assert_eq!(entry.listener_count(), 2);
    assert!(!entry.reconnect_snapshot().exhausted);
    assert_eq!(transport.open_count(), 7);
    assert_eq!(first.status(), ConnectionStatus::Connecting);
    assert_eq!(second.status(), ConnectionStatus::Connecting);
}

#[paused_timeout_test]
async fn listener_may_unsubscribe_from_its_own_callback() {
    let (transport, mux) = setup();
    let slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
    let calls = Arc::new(AtomicUsize::new(0));
    let handle = {
        let slot = slot.clone();
        let calls = calls.clone();
        tickets_p1(
            &mux,
            ListenerCallbacks::new().on_delete(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(handle) = slot.lock().as_ref() {
                    handle.unsubscribe();
                }
                Ok(())
            }),
        )
    };
    *slot.lock() = Some(handle);
    let conn = current_connection(&mux, TICKETS, Some(P1));
    transport
        .emit_change(conn, ChangeKind::Delete, serde_json::json!({"id": 9}))
        .expect("change");
    settle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(mux.registry().is_empty());
    assert_eq!(transport.close_count(), 1);
    slot.lock().take();
}

#[paused_timeout_test]
async fn listener_removed_mid_pass_misses_the_event() {
    let (transport, mux) = setup();
    let later_slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
    let later_calls = Arc::new(AtomicUsize::new(0));
    let _earlier = {
        let slot = later_slot.clone();
        tickets_p1(
            &mux,
            ListenerCallbacks::new().on_update(move |_| {
                if let Some(handle) = slot.lock().as_ref() {
                    handle.unsubscribe();
                }
                Ok(())
            }),
        )
    };
    let later = tickets_p1(&mux, counter_on_update(&later_calls));
    *later_slot.lock() = Some(later);

    let conn = current_connection(&mux, TICKETS, Some(P1));
    transport
        .emit_change(conn, ChangeKind::Update, serde_json::json!({"id": "T-4"}))
        .expect("change");
    settle().await;

    assert_eq!(later_calls.load(Ordering::SeqCst), 0);
    let entry = mux.channel(TICKETS, Some(P1)).expect("entry");
    assert_eq!(entry.listener_count(), 1);
    assert_eq!(transport.close_count(), 0);
    later_slot.lock().take();
}

#[paused_timeout_test]
async fn failure_queued_behind_last_unsubscribe_is_ignored() {
    let (transport, mux) = setup();
    let slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
    let handle = {
        let slot = slot.clone();
        tickets_p1(
            &mux,
            ListenerCallbacks::new().on_update(move |_| {
                if let Some(handle) = slot.lock().as_ref() {
                    handle.unsubscribe();
                }
                Ok(())
            }),
        )
    };
    *slot.lock() = Some(handle);
    let conn = current_connection(&mux, TICKETS, Some(P1));
    let entry = mux.channel(TICKETS, Some(P1)).expect("entry");
    transport.acknowledge(conn).expect("ack");
    settle().await;

    transport
        .emit_change(conn, ChangeKind::Update, serde_json::json!({"id": "T-5"}))
        .expect("change");
    transport
        .emit_status(conn, TransportStatus::ChannelError)
        .expect("fail");
    settle().await;
    tokio::time::advance(Duration::from_secs(60)).await;
    settle().await;

    assert!(entry.is_torn_down());
    assert_eq!(
        entry.reconnect_snapshot(),
        ReconnectSnapshot {
            attempts: 0,
            pending_delay: None,
            exhausted: false
        }
    );
    assert_eq!(entry.status(), ConnectionStatus::Connected);
    assert_eq!(transport.open_count(), 1);
    assert_eq!(transport.close_count(), 1);
    assert!(mux.registry().is_empty());
    slot.lock().take();
}

#[paused_timeout_test]
async fn vanished_stream_reconnects_with_backoff() {
    let (transport, mux) = setup();
    let handle = mux.subscribe(SubscribeOptions::new("projects"));
    let conn = current_connection(&mux, "projects", None);
    transport.acknowledge(conn).expect("ack");
    settle().await;
    assert_eq!(handle.status(), ConnectionStatus::Connected);

    transport.drop_stream(conn).expect("drop");
    settle().await;
    assert_eq!(handle.status(), ConnectionStatus::Disconnected);
    let entry = mux.channel("projects", None).expect("entry kept for retry");
    assert_eq!(
        entry.reconnect_snapshot().pending_delay,
        Some(Duration::from_millis(1_000))
    );

    tokio::time::advance(Duration::from_millis(1_000)).await;
    settle().await;
    assert_eq!(transport.open_count(), 2);
    let next = current_connection(&mux, "projects", None);
    assert_ne!(next, conn);
    transport.acknowledge(next).expect("ack");
    settle().await;
    assert_eq!(handle.status(), ConnectionStatus::Connected);
    assert_eq!(entry.reconnect_snapshot().attempts, 0);
}

#[paused_timeout_test]
async fn handles_can_be_created_and_dropped_off_the_runtime() {
    let (transport, mux) = setup();
    let worker_mux = mux.clone();
    let handle = std::thread::spawn(move || worker_mux.subscribe(SubscribeOptions::new("projects")))
        .join()
        .expect("subscriber thread");
    let conn = current_connection(&mux, "projects", None);
    transport.acknowledge(conn).expect("ack");
    settle().await;
    assert_eq!(handle.status(), ConnectionStatus::Connected);

    std::thread::spawn(move || drop(handle))
        .join()
        .expect("drop thread");
    assert_eq!(transport.close_count(), 1);
    assert!(mux.registry().is_empty());
}

#[paused_timeout_test]
async fn separator_in_table_name_gets_its_own_channel() {
    let (transport, mux) = setup();
    let _colon = mux.subscribe(SubscribeOptions::new("a:b"));
    let _filtered = mux.subscribe(SubscribeOptions::new("a").with_filter("b:all"));
    assert_eq!(transport.open_count(), 2);
    assert_eq!(mux.registry().len(), 2);
    assert_eq!(transport.opens_for("a:b", None), 1);
    assert_eq!(transport.opens_for("a", Some("b:all")), 1);
}

#[paused_timeout_test]
async fn dispose_all_disconnects_handles() {
    let (transport, mux) = setup();
    let tickets = tickets_p1(&mux, ListenerCallbacks::new());
    let projects = mux.subscribe(SubscribeOptions::new("projects"));
    assert_eq!(mux.registry().dispose_all(), 2);
    assert_eq!(transport.close_count(), 2);
    assert_eq!(tickets.status(), ConnectionStatus::Disconnected);
    assert_eq!(projects.status(), ConnectionStatus::Disconnected);

    drop(tickets);
    drop(projects);
    assert_eq!(transport.close_count(), 2);
}

#[paused_timeout_test]
async fn shared_tickets_scenario() {
    let (transport, mux) = setup();
    let caller_a = tickets_p1(&mux, ListenerCallbacks::new());
    let caller_b = tickets_p1(&mux, ListenerCallbacks::new());
    assert_eq!(mux.registry().len(), 1);
    let entry = mux.channel(TICKETS, Some(P1)).expect("entry");
    assert_eq!(entry.listener_count(), 2);
    assert_eq!(transport.open_count(), 1);

    caller_a.set_enabled(false);
    assert_eq!(mux.registry().len(), 1);
    assert_eq!(entry.listener_count(), 1);
    assert_eq!(transport.live_connections().len(), 1);

    caller_b.set_enabled(false);
    assert!(mux.registry().is_empty());
    assert_eq!(transport.close_count(), 1);

    let projects = mux.subscribe(SubscribeOptions::new("projects"));
    let conn = current_connection(&mux, "projects", None);
    transport
        .emit_status(conn, TransportStatus::ChannelError)
        .expect("fail");
    settle().await;
    assert_eq!(
        mux.channel("projects", None)
            .expect("entry")
            .reconnect_snapshot()
            .pending_delay,
        Some(Duration::from_millis(1_000))
    );
    tokio::time::advance(Duration::from_millis(1_000)).await;
    settle().await;

    for delay_ms in [2_000u64, 4_000, 8_000, 16_000] {
        let conn = current_connection(&mux, "projects", None);
        transport
            .emit_status(conn, TransportStatus::ChannelError)
            .expect("fail");
        settle().await;
        tokio::time::advance(Duration::from_millis(delay_ms)).await;
        settle().await;
    }
    let conn = current_connection(&mux, "projects", None);
    transport
        .emit_status(conn, TransportStatus::ChannelError)
        .expect("fail");
    settle().await;

    assert_eq!(projects.status(), ConnectionStatus::Error);
    assert_eq!(
        mux.channel("projects", None)
            .expect("entry")
            .reconnect_snapshot()
            .pending_delay,
        None
    );
    assert_eq!(transport.opens_for("projects", None), 6);
}
