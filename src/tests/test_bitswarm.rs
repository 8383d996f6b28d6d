use std::{str::FromStr, sync::Arc, time::Duration};

use crate::{
    AbuseGuardOptions, BackendOptions, Bitswarm, BitswarmError, BitswarmOptions, Broadcast,
    CapacityCap, ClientKey, FanoutOptions, LocalBitStore, LocalBitStoreOptions,
    LocalTicketLedger, RateLimitWindows, ToggleDecision, ToggleLogOptions, TotalBits,
};

fn origin(ip: &str) -> ClientKey {
    ClientKey::from_ip(ip.parse().unwrap())
}

fn options(total_bits: u64) -> BitswarmOptions {
    BitswarmOptions {
        backend: BackendOptions::Local,
        total_bits: TotalBits::try_from(total_bits).unwrap(),
        capacity: None,
        rate_limit: RateLimitWindows::from_str("1000/1").unwrap(),
        fanout: FanoutOptions::default(),
        abuse: AbuseGuardOptions::default(),
        toggle_log: None,
        ledger_cleanup_interval: Duration::from_secs(60),
        subscription_capacity: 1024,
    }
}

#[tokio::test(start_paused = true)]
async fn applied_toggle_is_visible_in_snapshot() {
    let swarm = Bitswarm::new(options(100)).await.unwrap();
    let client = origin("203.0.113.7");

    let decision = swarm.toggle(&client, 5).await.unwrap();
    let ToggleDecision::Applied(event) = decision else {
        panic!("expected the toggle to apply, got {decision:?}");
    };
    assert_eq!(event.index, 5);
    assert!(event.new_value);

    let snapshot = swarm.snapshot().await.unwrap();
    assert_eq!(snapshot.count, 1);
    assert!(snapshot.decode(swarm.total_bits()).unwrap().get(5));
    assert!(swarm.get_bit(5).await.unwrap());

    assert!(matches!(
        swarm.toggle(&client, 5).await.unwrap(),
        ToggleDecision::Applied(event) if !event.new_value
    ));
    assert_eq!(swarm.count().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn out_of_range_index_is_an_error() {
    let swarm = Bitswarm::new(options(100)).await.unwrap();
    let client = origin("203.0.113.7");

    assert!(matches!(
        swarm.toggle(&client, 100).await,
        Err(BitswarmError::IndexOutOfRange { index: 100, .. })
    ));
    assert!(matches!(
        swarm.toggle(&client, -1).await,
        Err(BitswarmError::IndexOutOfRange { .. })
    ));
    assert_eq!(swarm.count().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn capacity_cap_is_reported() {
    let swarm = Bitswarm::new(BitswarmOptions {
        capacity: Some(CapacityCap::from(1)),
        ..options(10)
    })
    .await
    .unwrap();
    let client = origin("203.0.113.7");

    assert!(matches!(
        swarm.toggle(&client, 0).await.unwrap(),
        ToggleDecision::Applied(_)
    ));
    assert_eq!(
        swarm.toggle(&client, 1).await.unwrap(),
        ToggleDecision::CapacityReached {
            index: 1,
            value: false
        }
    );
}

#[tokio::test(start_paused = true)]
async fn rate_limited_origin_is_dropped() {
    let swarm = Bitswarm::new(BitswarmOptions {
        rate_limit: RateLimitWindows::default(),
        ..options(100)
    })
    .await
    .unwrap();
    let noisy = origin("203.0.113.7");

    for i in 0..7 {
        assert!(matches!(
            swarm.toggle(&noisy, i).await.unwrap(),
            ToggleDecision::Applied(_)
        ));
    }

    assert_eq!(
        swarm.toggle(&noisy, 50).await.unwrap(),
        ToggleDecision::RateLimited {
            window_size_seconds: 1,
            limit: 7
        }
    );
    assert!(!swarm.get_bit(50).await.unwrap());

    // other origins are unaffected
    assert!(matches!(
        swarm.toggle(&origin("203.0.113.8"), 50).await.unwrap(),
        ToggleDecision::Applied(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn abusive_origin_is_suppressed() {
    let swarm = Bitswarm::new(BitswarmOptions {
        abuse: AbuseGuardOptions {
            max_requests: 1,
            decay_scale: 1,
            ..Default::default()
        },
        ..options(100)
    })
    .await
    .unwrap();
    let client = origin("203.0.113.7");

    for _ in 0..100 {
        swarm.admit_connection(&client);
    }

    assert_eq!(
        swarm.toggle(&client, 1).await.unwrap(),
        ToggleDecision::Suppressed
    );
    assert!(!swarm.admit_connection(&client));
    assert_eq!(swarm.count().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn connected_clients_receive_applied_toggles() {
    let swarm = Bitswarm::new(options(100)).await.unwrap();
    let _handle = swarm.start().await.unwrap();
    let mut feed = swarm.connect_client().await.unwrap();
    assert_eq!(feed.snapshot.count, 0);

    let client = origin("203.0.113.7");
    swarm.toggle(&client, 3).await.unwrap();
    swarm.toggle(&client, 7).await.unwrap();
    swarm.toggle(&client, 3).await.unwrap();

    let broadcast = tokio::time::timeout(Duration::from_secs(1), feed.receiver.recv())
        .await
        .unwrap()
        .unwrap();

    match broadcast {
        Broadcast::BatchedBitToggles(batch) => {
            assert_eq!(batch.true_indices, vec![7]);
            assert_eq!(batch.false_indices, vec![3]);
        }
        other => panic!("expected a batch, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn applied_toggles_are_logged() {
    let store = Arc::new(LocalBitStore::new(LocalBitStoreOptions {
        total_bits: TotalBits::try_from(100u64).unwrap(),
        capacity: CapacityCap::from(100),
        subscription_capacity: 1024,
    }));

    let swarm = Bitswarm::with_parts(
        store.clone(),
        Arc::new(LocalTicketLedger::new()),
        BitswarmOptions {
            toggle_log: Some(ToggleLogOptions {
                max_batch: 2,
                ..Default::default()
            }),
            ..options(100)
        },
    );
    let _handle = swarm.start().await.unwrap();

    let client = origin("203.0.113.7");
    let ToggleDecision::Applied(first) = swarm.toggle(&client, 1).await.unwrap() else {
        panic!("expected the toggle to apply");
    };
    swarm.toggle(&client, 2).await.unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;

    let bucket = crate::ToggleLogEntry {
        origin: client.to_string(),
        index: 1,
        new_value: true,
        timestamp_ms: first.timestamp_ms,
    }
    .bucket();
    let records = store.toggle_log(&bucket);

    assert_eq!(records.len(), 2);
    assert!(records[0].ends_with("|203.0.113.7|1|1"));
    assert!(records[1].ends_with("|203.0.113.7|2|1"));
}
