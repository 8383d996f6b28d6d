use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;

use crate::{
    BitIndex, BitStore, Broadcast, CapacityCap, FanoutCoordinator, FanoutOptions, LocalBitStore,
    LocalBitStoreOptions, ToggleBatch, ToggleEvent, TotalBits, fanout::drain,
};

fn bits() -> TotalBits {
    TotalBits::try_from(100u64).unwrap()
}

fn local_store() -> Arc<LocalBitStore> {
    Arc::new(LocalBitStore::new(LocalBitStoreOptions {
        total_bits: bits(),
        capacity: CapacityCap::from(100),
        subscription_capacity: 1024,
    }))
}

fn coordinator(store: Arc<LocalBitStore>) -> FanoutCoordinator {
    FanoutCoordinator::new(
        store,
        bits(),
        FanoutOptions {
            drain_interval: Duration::from_millis(100),
            max_batch_events: 400,
            snapshot_interval: Duration::from_secs(50),
            client_buffer: 64,
        },
    )
}

fn event(index: u64, new_value: bool, timestamp_ms: u64) -> ToggleEvent {
    ToggleEvent {
        index,
        new_value,
        timestamp_ms,
    }
}

async fn next(receiver: &mut tokio::sync::broadcast::Receiver<Broadcast>) -> Broadcast {
    tokio::time::timeout(Duration::from_secs(120), receiver.recv())
        .await
        .expect("no broadcast in time")
        .unwrap()
}

#[tokio::test]
async fn drain_reduces_each_index_to_its_final_state() {
    let (tx, mut rx) = mpsc::channel(16);
    tx.send(event(3, true, 1).encode()).await.unwrap();
    tx.send(event(7, false, 2).encode()).await.unwrap();
    tx.send(event(3, false, 3).encode()).await.unwrap();

    let drained = drain(&mut rx, 400, bits());

    assert_eq!(
        drained.batch.unwrap(),
        ToggleBatch {
            true_indices: vec![],
            false_indices: vec![3, 7],
            timestamp: 3,
        }
    );
    assert_eq!(drained.malformed, 0);
    assert!(!drained.disconnected);
}

#[tokio::test]
async fn drain_takes_at_most_max_events_per_tick() {
    let (tx, mut rx) = mpsc::channel(16);
    for i in 0..10 {
        tx.send(event(i, true, i).encode()).await.unwrap();
    }

    let first = drain(&mut rx, 4, bits()).batch.unwrap();
    assert_eq!(first.true_indices, vec![0, 1, 2, 3]);

    let rest = drain(&mut rx, 400, bits()).batch.unwrap();
    assert_eq!(rest.true_indices, vec![4, 5, 6, 7, 8, 9]);

    assert!(drain(&mut rx, 400, bits()).batch.is_none());
}

#[tokio::test]
async fn drain_skips_malformed_payloads() {
    let (tx, mut rx) = mpsc::channel(16);
    tx.send("garbage".to_string()).await.unwrap();
    tx.send(event(500, true, 1).encode()).await.unwrap();
    tx.send(event(5, true, 2).encode()).await.unwrap();

    let drained = drain(&mut rx, 400, bits());

    assert_eq!(drained.malformed, 2);
    assert_eq!(drained.batch.unwrap().true_indices, vec![5]);
}

#[tokio::test]
async fn drain_reports_lost_subscription() {
    let (tx, mut rx) = mpsc::channel(16);
    tx.send(event(1, true, 1).encode()).await.unwrap();
    drop(tx);

    let drained = drain(&mut rx, 400, bits());

    assert!(drained.disconnected);
    assert_eq!(drained.batch.unwrap().true_indices, vec![1]);
}

#[tokio::test(start_paused = true)]
async fn client_gets_snapshot_then_batches() {
    let store = local_store();
    let fanout = coordinator(store.clone());
    let _handle = fanout.start().await.unwrap();

    let index = BitIndex::new(4, bits()).unwrap();
    store.toggle(index).await.unwrap();

    let mut feed = fanout.connect_client().await.unwrap();
    assert_eq!(feed.snapshot.count, 1);
    assert!(feed.snapshot.decode(bits()).unwrap().get(4));
    assert_eq!(fanout.client_count(), 1);

    store.toggle(index).await.unwrap();
    store.publish(&event(4, false, 10)).await.unwrap();
    store.publish(&event(9, true, 11)).await.unwrap();

    match next(&mut feed.receiver).await {
        Broadcast::BatchedBitToggles(batch) => {
            assert_eq!(batch.true_indices, vec![9]);
            assert_eq!(batch.false_indices, vec![4]);
            assert_eq!(batch.timestamp, 11);
        }
        other => panic!("expected a batch, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn quiet_ticks_broadcast_nothing() {
    let store = local_store();
    let fanout = coordinator(store.clone());
    let _handle = fanout.start().await.unwrap();
    let mut receiver = fanout.subscribe();

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(matches!(
        receiver.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test(start_paused = true)]
async fn periodic_snapshot_is_broadcast_without_toggles() {
    let store = local_store();
    let fanout = coordinator(store.clone());
    let _handle = fanout.start().await.unwrap();
    let mut receiver = fanout.subscribe();

    tokio::time::sleep(Duration::from_secs(49)).await;
    assert!(receiver.try_recv().is_err());

    match next(&mut receiver).await {
        Broadcast::FullState(snapshot) => assert_eq!(snapshot.count, 0),
        other => panic!("expected a snapshot, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn stopping_the_handle_stops_broadcasts() {
    let store = local_store();
    let fanout = coordinator(store.clone());
    let handle = fanout.start().await.unwrap();
    let mut receiver = fanout.subscribe();

    handle.stop();
    tokio::task::yield_now().await;

    store.publish(&event(1, true, 1)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(receiver.try_recv().is_err());
}
