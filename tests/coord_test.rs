//! Concurrency tests for the coordination primitives.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use docflow::clock::{ManualClock, SystemClock};
use docflow::coord::{Coordination, RetryWithBackoff};
use docflow::error::{Error, Result};
use docflow::store::{KeyValueStore, MemoryCache};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_one_winner() {
    let coord = Coordination::default();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let claims = coord.claims();
        handles.push(tokio::spawn(async move {
            claims.claim("claim:sync:row:A7", 600).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert!(coord.claims().is_claimed("claim:sync:row:A7").await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mutex_never_admits_two_holders() {
    let cache: Arc<dyn KeyValueStore> = Arc::new(MemoryCache::new(Arc::new(SystemClock)));
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let entries = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for n in 0..4 {
        let lock = docflow::coord::MutexLock::new(cache.clone())
            .label(format!("worker-{n}"))
            .poll_interval(Duration::from_millis(5), Duration::from_millis(15));
        let inside = inside.clone();
        let peak = peak.clone();
        let entries = entries.clone();
        handles.push(tokio::spawn(async move {
            lock.acquire("sheet:ledger", 5_000, 30, move || async move {
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                entries.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, Error>(())
            })
            .await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(entries.load(Ordering::SeqCst), 4);
    assert!(cache.get("lock:sheet:ledger").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn retry_backoff_grows_between_attempts() {
    let stamps = std::sync::Mutex::new(Vec::new());

    let result: Result<()> = RetryWithBackoff::default()
        .run(
            || {
                stamps.lock().unwrap().push(tokio::time::Instant::now());
                async { Err(Error::Store("sheet busy".into())) }
            },
            "sheet.write",
            3,
        )
        .await;

    match result {
        Err(Error::RetriesExhausted { attempts, last_error, .. }) => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last_error, Error::Store(_)));
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }

    let stamps = stamps.into_inner().unwrap();
    assert_eq!(stamps.len(), 3);
    let before_second = stamps[1] - stamps[0];
    let before_third = stamps[2] - stamps[1];
    assert!(before_third >= before_second * 2);
}

#[tokio::test(start_paused = true)]
async fn retry_returns_first_success() {
    let attempts = std::sync::atomic::AtomicU32::new(0);

    let value = RetryWithBackoff::default()
        .run(
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(Error::Store(format!("attempt {n} failed")))
                    } else {
                        Ok(n)
                    }
                }
            },
            "sheet.read",
            5,
        )
        .await
        .unwrap();

    assert_eq!(value, 3);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn debounce_and_reentrancy_share_one_clock() {
    let clock = Arc::new(ManualClock::at_epoch());
    let coord = Coordination::in_memory(clock.clone());

    let debounce = coord.debounce();
    assert!(debounce.should_proceed("onEdit", "A1", 1_000).await.unwrap());
    clock.advance_ms(500);
    assert!(!debounce.should_proceed("onEdit", "A1", 1_000).await.unwrap());
    clock.advance_ms(1_000);
    assert!(debounce.should_proceed("onEdit", "A1", 1_000).await.unwrap());

    // A flag left behind by a crashed run stops counting once stale.
    let guard = coord.reentrancy();
    guard.begin().await.unwrap();
    assert!(guard.is_active().await.unwrap());
    clock.advance_ms(301_000);
    assert!(!guard.is_active().await.unwrap());
    assert_eq!(guard.begin().await.unwrap(), 1);
}

#[tokio::test]
async fn reentrancy_lock_uses_configured_timeout() {
    let mut coord = Coordination::in_memory(Arc::new(ManualClock::at_epoch()));
    coord.config.lock_timeout = Duration::from_millis(50);
    let _held = coord
        .mutex()
        .try_acquire("programmatic_edit", 30)
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(
        coord.reentrancy().begin().await,
        Err(Error::AcquisitionTimeout { .. })
    ));
}

#[tokio::test]
async fn rate_limit_window_resets() {
    let clock = Arc::new(ManualClock::at_epoch());
    let coord = Coordination::in_memory(clock.clone());
    let limiter = coord.rate_limiter();

    for _ in 0..3 {
        assert!(limiter.allow("export", 3, 60).await.unwrap());
    }
    assert!(!limiter.allow("export", 3, 60).await.unwrap());

    clock.advance_ms(61_000);
    assert!(limiter.allow("export", 3, 60).await.unwrap());
}
