use std::{str::FromStr, sync::Arc, time::Duration};

use crate::{
    LocalTicketLedger, RateLimitDecision, RateLimitWindow, RateLimitWindows, RateLimiter,
    TicketLedger,
};

fn limiter(windows: &str) -> (RateLimiter, Arc<LocalTicketLedger>) {
    let ledger = Arc::new(LocalTicketLedger::new());
    let limiter = RateLimiter::new(ledger.clone(), RateLimitWindows::from_str(windows).unwrap());

    (limiter, ledger)
}

#[tokio::test(start_paused = true)]
async fn unknown_key_is_allowed() {
    let (limiter, _) = limiter("7/1");

    assert!(matches!(
        limiter.is_allowed("missing").await.unwrap(),
        RateLimitDecision::Allowed
    ));
}

#[tokio::test(start_paused = true)]
async fn rejects_the_call_after_the_limit() {
    let (limiter, _) = limiter("7/1");

    for _ in 0..7 {
        assert!(matches!(
            limiter.is_allowed("k").await.unwrap(),
            RateLimitDecision::Allowed
        ));
    }

    assert!(matches!(
        limiter.is_allowed("k").await.unwrap(),
        RateLimitDecision::Rejected {
            window_size_seconds: 1,
            limit: 7,
            observed: 8
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn window_slides_after_its_duration() {
    let (limiter, _) = limiter("7/1");

    for _ in 0..8 {
        limiter.is_allowed("k").await.unwrap();
    }

    // a ticket exactly one window old still counts
    tokio::time::advance(Duration::from_millis(1000)).await;
    assert!(matches!(
        limiter.is_allowed("k").await.unwrap(),
        RateLimitDecision::Rejected { .. }
    ));

    tokio::time::advance(Duration::from_millis(1)).await;
    assert!(matches!(
        limiter.is_allowed("k").await.unwrap(),
        RateLimitDecision::Allowed
    ));
}

#[tokio::test(start_paused = true)]
async fn rejected_calls_keep_the_window_full() {
    let (limiter, _) = limiter("2/1");

    // 0ms, 0ms allowed; 600ms rejected
    limiter.is_allowed("k").await.unwrap();
    limiter.is_allowed("k").await.unwrap();
    tokio::time::advance(Duration::from_millis(600)).await;
    assert!(matches!(
        limiter.is_allowed("k").await.unwrap(),
        RateLimitDecision::Rejected { .. }
    ));

    // the two 0ms tickets expire, the rejected 600ms ticket remains
    tokio::time::advance(Duration::from_millis(500)).await;
    assert!(matches!(
        limiter.is_allowed("k").await.unwrap(),
        RateLimitDecision::Allowed
    ));
    assert!(matches!(
        limiter.is_allowed("k").await.unwrap(),
        RateLimitDecision::Rejected { observed: 3, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn every_window_must_admit() {
    let (limiter, _) = limiter("3/1,5/10");

    for second in 0..2u64 {
        for _ in 0..3 {
            let decision = limiter.is_allowed("k").await.unwrap();
            if second == 0 {
                assert!(matches!(decision, RateLimitDecision::Allowed));
            }
        }
        tokio::time::advance(Duration::from_millis(1001)).await;
    }

    // burst window is empty again, the 10s window holds six tickets
    assert!(matches!(
        limiter.is_allowed("k").await.unwrap(),
        RateLimitDecision::Rejected {
            window_size_seconds: 10,
            limit: 5,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn keys_are_independent() {
    let (limiter, _) = limiter("1/1");

    assert!(matches!(
        limiter.is_allowed("a").await.unwrap(),
        RateLimitDecision::Allowed
    ));
    assert!(matches!(
        limiter.is_allowed("a").await.unwrap(),
        RateLimitDecision::Rejected { .. }
    ));
    assert!(matches!(
        limiter.is_allowed("b").await.unwrap(),
        RateLimitDecision::Allowed
    ));
}

#[tokio::test(start_paused = true)]
async fn empty_windows_admit_everything() {
    let ledger = Arc::new(LocalTicketLedger::new());
    let limiter = RateLimiter::new(ledger.clone(), RateLimitWindows::new(vec![]));

    for _ in 0..100 {
        assert!(matches!(
            limiter.is_allowed("k").await.unwrap(),
            RateLimitDecision::Allowed
        ));
    }
    assert!(ledger.is_empty());
}

#[tokio::test(start_paused = true)]
async fn ticket_memory_is_bounded_under_flood() {
    let window = RateLimitWindow::new(7, 1).unwrap();
    let windows = RateLimitWindows::new(vec![window]);
    let ledger = LocalTicketLedger::new();

    let mut last = Vec::new();
    for _ in 0..1000 {
        last = ledger.record("k", &windows).await.unwrap();
    }

    assert_eq!(last, vec![window.retained_tickets()]);
}

#[tokio::test(start_paused = true)]
async fn cleanup_evicts_only_idle_keys() {
    let (limiter, ledger) = limiter("7/1");

    limiter.is_allowed("idle").await.unwrap();
    tokio::time::advance(Duration::from_millis(800)).await;
    limiter.is_allowed("active").await.unwrap();
    tokio::time::advance(Duration::from_millis(400)).await;

    ledger.cleanup(1000).await.unwrap();

    assert_eq!(ledger.len(), 1);
    assert!(matches!(
        limiter.is_allowed("active").await.unwrap(),
        RateLimitDecision::Allowed
    ));
}
