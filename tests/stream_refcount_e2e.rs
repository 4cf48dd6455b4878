//! Private stream sharing: reference counting, filtering and debounced triggers.

mod common;

use async_trait::async_trait;
use common::*;
use futures_util::future::join_all;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tradebot_sync::application::private_stream_manager::{PrivateStreamManager, StreamEventSink};
use tradebot_sync::domain::entities::platform::Platform;
use tradebot_sync::domain::entities::robot::RobotStatus;
use tradebot_sync::domain::repositories::private_stream::{
    PrivateEvent, PrivateEventKind, PrivateStream,
};

#[derive(Default)]
struct RecordingSink {
    orders: AtomicUsize,
    snapshots: Mutex<Vec<Vec<i64>>>,
    triggers: Mutex<Vec<i64>>,
}

#[async_trait]
impl StreamEventSink for RecordingSink {
    async fn apply_order_event(&self, _event: &PrivateEvent) {
        self.orders.fetch_add(1, Ordering::SeqCst);
    }

    async fn apply_snapshot(&self, robot_ids: &[i64], _event: &PrivateEvent) {
        self.snapshots.lock().unwrap().push(robot_ids.to_vec());
    }

    async fn trigger_reconcile(&self, robot_id: i64) {
        self.triggers.lock().unwrap().push(robot_id);
    }
}

fn manager(
    factory: Arc<MockStreamFactory>,
    sink: Arc<RecordingSink>,
) -> Arc<PrivateStreamManager> {
    PrivateStreamManager::new(factory, sink, fast_config())
}

#[tokio::test]
async fn test_sequential_acquire_release_shares_one_connection() {
    let h = harness(Platform::Okx).await;
    let credential = h.credential().await;

    for n in [1usize, 2, 10, 100] {
        for robot_id in 0..n as i64 {
            assert!(h.ctx.streams.acquire(&credential, "BTCUSDT", robot_id).await);
        }
        assert_eq!(h.ctx.streams.ref_count(Platform::Okx, h.credential_id).await, n);
        assert_eq!(h.streams.live_count(), 1);

        for robot_id in 0..n as i64 {
            h.ctx
                .streams
                .release(Platform::Okx, h.credential_id, "BTCUSDT", robot_id)
                .await;
        }
        assert_eq!(h.ctx.streams.ref_count(Platform::Okx, h.credential_id).await, 0);
        assert_eq!(h.ctx.streams.live_subscriptions().await, 0);
        assert_eq!(h.streams.live_count(), 0);
    }

    let latest = h.streams.latest().unwrap();
    assert!(latest.stopped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_concurrent_acquire_release_leaves_nothing_running() {
    let h = harness(Platform::Okx).await;
    let credential = h.credential().await;
    let streams = h.ctx.streams.clone();

    let mut tasks = Vec::new();
    for robot_id in 0..100i64 {
        let streams = streams.clone();
        let credential = credential.clone();
        tasks.push(tokio::spawn(async move {
            let symbol = if robot_id % 2 == 0 { "BTCUSDT" } else { "ETHUSDT" };
            streams.acquire(&credential, symbol, robot_id).await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap());
    }

    assert_eq!(streams.ref_count(Platform::Okx, h.credential_id).await, 100);
    assert_eq!(h.streams.live_count(), 1);
    let live = h
        .streams
        .created
        .lock()
        .unwrap()
        .iter()
        .find(|s| s.started.load(Ordering::SeqCst) && !s.stopped.load(Ordering::SeqCst))
        .cloned()
        .unwrap();
    let symbols = live.symbols();
    assert!(symbols.contains("BTCUSDT"));
    assert!(symbols.contains("ETHUSDT"));

    let credential_id = h.credential_id;
    let mut tasks = Vec::new();
    for robot_id in 0..100i64 {
        let streams = streams.clone();
        tasks.push(tokio::spawn(async move {
            let symbol = if robot_id % 2 == 0 { "BTCUSDT" } else { "ETHUSDT" };
            streams
                .release(Platform::Okx, credential_id, symbol, robot_id)
                .await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(streams.ref_count(Platform::Okx, h.credential_id).await, 0);
    assert_eq!(streams.live_subscriptions().await, 0);
    assert_eq!(h.streams.live_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_acquire_release_never_leaks_or_double_stops() {
    let h = harness(Platform::Okx).await;
    let credential = h.credential().await;
    let streams = h.ctx.streams.clone();

    let tasks = (0..100i64).map(|robot_id| {
        let streams = streams.clone();
        let credential = credential.clone();
        tokio::spawn(async move {
            let acquired = streams.acquire(&credential, "BTCUSDT", robot_id).await;
            tokio::task::yield_now().await;
            streams
                .release(Platform::Okx, credential.id, "BTCUSDT", robot_id)
                .await;
            acquired
        })
    });
    for joined in join_all(tasks).await {
        assert!(joined.unwrap());
    }

    assert_eq!(streams.ref_count(Platform::Okx, h.credential_id).await, 0);
    assert_eq!(streams.live_subscriptions().await, 0);
    assert_eq!(h.streams.live_count(), 0);

    let created = h.streams.created.lock().unwrap().clone();
    assert_eq!(created.len(), h.streams.creations.load(Ordering::SeqCst));
    assert!(!created.is_empty());
    for stream in &created {
        assert!(stream.started.load(Ordering::SeqCst));
        assert_eq!(stream.stops.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn test_reconnect_swaps_connection_and_keeps_subscribers() {
    let h = harness(Platform::Okx).await;
    let credential = h.credential().await;
    let streams = h.ctx.streams.clone();

    streams.acquire(&credential, "BTCUSDT", 1).await;
    streams.acquire(&credential, "ETHUSDT", 2).await;
    let before = h.streams.latest().unwrap();
    assert_eq!(before.secret, "test-secret");

    assert!(h
        .ctx
        .credentials
        .rotate(h.credential_id, "key-2", "secret-2", None)
        .await
        .unwrap());
    let rotated = h.credential().await;
    assert!(streams.reconnect(&rotated).await);

    let after = h.streams.latest().unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(after.secret, "secret-2");
    assert_eq!(before.stops.load(Ordering::SeqCst), 1);
    assert!(after.is_running());
    let symbols = after.symbols();
    assert!(symbols.contains("BTCUSDT"));
    assert!(symbols.contains("ETHUSDT"));
    assert_eq!(streams.ref_count(Platform::Okx, h.credential_id).await, 2);
    assert_eq!(h.streams.live_count(), 1);

    streams.release(Platform::Okx, h.credential_id, "BTCUSDT", 1).await;
    streams.release(Platform::Okx, h.credential_id, "ETHUSDT", 2).await;
    assert_eq!(after.stops.load(Ordering::SeqCst), 1);
    assert_eq!(h.streams.live_count(), 0);

    // Nothing subscribed, nothing to reconnect
    assert!(!streams.reconnect(&rotated).await);
}

#[tokio::test]
async fn test_release_keeps_symbol_while_another_robot_needs_it() {
    let h = harness(Platform::Okx).await;
    let credential = h.credential().await;

    h.ctx.streams.acquire(&credential, "BTCUSDT", 1).await;
    h.ctx.streams.acquire(&credential, "BTCUSDT", 2).await;
    h.ctx.streams.acquire(&credential, "ETHUSDT", 3).await;

    h.ctx
        .streams
        .release(Platform::Okx, h.credential_id, "BTCUSDT", 1)
        .await;
    let stream = h.streams.latest().unwrap();
    assert!(stream.symbols().contains("BTCUSDT"));

    h.ctx
        .streams
        .release(Platform::Okx, h.credential_id, "BTC-USDT-SWAP", 2)
        .await;
    assert!(!stream.symbols().contains("BTCUSDT"));
    assert!(stream.symbols().contains("ETHUSDT"));
    assert!(stream.is_running());
}

#[tokio::test]
async fn test_disabled_platform_falls_back_to_polling() {
    let mut config = fast_config();
    config.platform_stream_enabled.insert(Platform::Okx, false);
    let h = harness_with(Platform::Okx, config).await;
    let credential = h.credential().await;

    assert!(!h.ctx.streams.acquire(&credential, "BTCUSDT", 1).await);
    assert_eq!(h.streams.creations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_events_for_unsubscribed_symbols_are_filtered() {
    let h = harness(Platform::Okx).await;
    let credential = h.credential().await;
    let factory = h.streams.clone();
    let sink = Arc::new(RecordingSink::default());
    let manager = manager(factory.clone(), sink.clone());
    manager.start().await;

    assert!(manager.acquire(&credential, "BTCUSDT", 5).await);
    let stream = factory.latest().unwrap();

    stream.emit(PrivateEventKind::Position, "ETH-USDT-SWAP", json!({"data": []}));
    stream.emit(PrivateEventKind::Position, "BTC-USDT-SWAP", json!({"data": []}));
    stream.emit(PrivateEventKind::Account, "", json!({"data": []}));

    let snapshots = &sink.snapshots;
    let seen = eventually(Duration::from_secs(2), || async move {
        snapshots.lock().unwrap().len() == 2
    })
    .await;
    assert!(seen);
    assert!(sink.snapshots.lock().unwrap().iter().all(|ids| ids == &vec![5]));

    let stats = manager.stats().await;
    assert_eq!(stats.events_received, 3);
    assert_eq!(stats.events_filtered, 1);
    assert_eq!(stats.live_subscriptions, 1);

    manager.shutdown().await;
    assert!(stream.stopped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_event_burst_coalesces_into_one_trigger_per_robot() {
    let h = harness(Platform::Okx).await;
    let credential = h.credential().await;
    let factory = h.streams.clone();
    let sink = Arc::new(RecordingSink::default());
    let manager = manager(factory.clone(), sink.clone());
    manager.start().await;

    manager.acquire(&credential, "BTCUSDT", 1).await;
    manager.acquire(&credential, "BTCUSDT", 2).await;
    let stream = factory.latest().unwrap();

    for i in 0..20 {
        stream.emit(
            PrivateEventKind::Order,
            "BTCUSDT",
            okx_order_push(&format!("B{}", i), "filled", "0.01", "50000"),
        );
    }

    let orders = &sink.orders;
    let all_orders = eventually(Duration::from_secs(2), || async move {
        orders.load(Ordering::SeqCst) == 20
    })
    .await;
    assert!(all_orders);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut triggers = sink.triggers.lock().unwrap().clone();
    triggers.sort_unstable();
    assert_eq!(triggers, vec![1, 2]);

    // Outside the window: a second trigger
    stream.emit(PrivateEventKind::Order, "BTCUSDT", okx_order_push("B99", "filled", "0.01", "50000"));
    tokio::time::sleep(Duration::from_millis(300)).await;
    let count_for_one = sink.triggers.lock().unwrap().iter().filter(|id| **id == 1).count();
    assert_eq!(count_for_one, 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_streamed_order_reaches_the_ledger() {
    let h = harness(Platform::Okx).await;
    let robot_id = h.add_robot("BTCUSDT", RobotStatus::Running).await;
    let credential = h.credential().await;
    h.ctx.streams.start().await;
    assert!(h.ctx.streams.acquire(&credential, "BTCUSDT", robot_id).await);

    let stream = h.streams.latest().unwrap();
    let push = okx_order_push("E1", "filled", "0.01", "50000");
    stream.emit(PrivateEventKind::Order, "BTC-USDT-SWAP", push.clone());
    stream.emit(PrivateEventKind::Order, "BTC-USDT-SWAP", push);

    let orders = h.ctx.orders.clone();
    let recorded = eventually(Duration::from_secs(2), || {
        let orders = orders.clone();
        async move {
            orders
                .find_open(robot_id, tradebot_sync::domain::entities::order::PositionSide::Long)
                .await
                .unwrap()
                .is_some()
        }
    })
    .await;
    assert!(recorded);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.ctx.orders.list_by_robot(robot_id).await.unwrap().len(), 1);

    h.ctx.streams.shutdown().await;
    assert_eq!(h.streams.live_count(), 0);
}
