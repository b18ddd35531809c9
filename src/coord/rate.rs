//! Fixed-window call limiter and short-TTL memoization on the shared cache.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as TimeDelta;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::lock::MutexLock;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::model::RateCounter;
use crate::store::KeyValueStore;

/// Allows at most `max_calls` per window for a key.
#[derive(Clone)]
pub struct RateLimiter {
    cache: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    lock: MutexLock,
    brief_timeout: Duration,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            lock: MutexLock::new(cache.clone()).label("rate"),
            cache,
            clock,
            brief_timeout: Duration::from_millis(500),
        }
    }

    pub fn brief_timeout(mut self, timeout: Duration) -> Self {
        self.brief_timeout = timeout;
        self
    }

    pub fn with_lock(mut self, lock: MutexLock) -> Self {
        self.lock = lock.label("rate");
        self
    }

    /// Count one call against `key` and report whether it is allowed.
    ///
    /// If the counter lock is contended the call is allowed unless the
    /// current count already meets the limit; nothing is counted then.
    pub async fn allow(&self, key: &str, max_calls: u32, window_seconds: u64) -> Result<bool> {
        let counter_key = format!("rate:{key}");
        let counter_key = &counter_key;
        let window = TimeDelta::seconds(window_seconds as i64);

        let outcome = self
            .lock
            .acquire(
                counter_key,
                self.brief_timeout.as_millis() as u64,
                5,
                move || async move {
                    let now = self.clock.now();
                    let current = self
                        .read(counter_key)
                        .await?
                        .filter(|c| now - c.window_start < window);

                    let next = match current {
                        Some(c) if c.count >= max_calls => return Ok(false),
                        Some(c) => RateCounter {
                            count: c.count + 1,
                            window_start: c.window_start,
                        },
                        None => RateCounter {
                            count: 1,
                            window_start: now,
                        },
                    };
                    if next.count > max_calls {
                        return Ok(false);
                    }

                    // Expire with the window, not with the latest write.
                    // Round up so the counter never expires before its window ends.
                    let remaining_ms = (next.window_start + window - now).num_milliseconds().max(1);
                    let remaining = (remaining_ms as u64).div_ceil(1000);
                    self.cache
                        .put(counter_key, &serde_json::to_string(&next)?, remaining)
                        .await?;
                    Ok(true)
                },
            )
            .await;

        match outcome {
            Ok(allowed) => {
                debug!(key, allowed, max_calls, "rate check");
                Ok(allowed)
            }
            Err(Error::AcquisitionTimeout { .. }) => {
                let count = self.read(counter_key).await?.map_or(0, |c| c.count);
                let allowed = count < max_calls;
                warn!(key, count, allowed, "rate lock contended, using unguarded read");
                Ok(allowed)
            }
            Err(e) => Err(e),
        }
    }

    async fn read(&self, counter_key: &str) -> Result<Option<RateCounter>> {
        Ok(self
            .cache
            .get(counter_key)
            .await?
            .and_then(|raw| serde_json::from_str(&raw).ok()))
    }
}

/// Caches producer results for a short TTL.
///
/// Concurrent misses may each call the producer; producers must be
/// read-only or idempotent.
#[derive(Clone)]
pub struct Memoizer {
    cache: Arc<dyn KeyValueStore>,
}

impl Memoizer {
    pub fn new(cache: Arc<dyn KeyValueStore>) -> Self {
        Self { cache }
    }

    pub async fn remember<T, F, Fut>(&self, key: &str, ttl_seconds: u64, producer: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let memo_key = format!("memo:{key}");
        if let Some(raw) = self.cache.get(&memo_key).await? {
            match serde_json::from_str(&raw) {
                Ok(value) => return Ok(value),
                Err(e) => debug!(key, error = %e, "memoized value unreadable, recomputing"),
            }
        }

        let value = producer().await?;
        self.cache
            .put(&memo_key, &serde_json::to_string(&value)?, ttl_seconds)
            .await?;
        Ok(value)
    }

    pub async fn forget(&self, key: &str) -> Result<()> {
        self.cache.remove(&format!("memo:{key}")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryCache;

    fn setup() -> (Arc<ManualClock>, Arc<MemoryCache>) {
        let clock = Arc::new(ManualClock::at_epoch());
        let cache = Arc::new(MemoryCache::new(clock.clone()));
        (clock, cache)
    }

    #[tokio::test]
    async fn limits_calls_per_window() {
        let (clock, cache) = setup();
        let limiter = RateLimiter::new(cache, clock.clone());

        for _ in 0..3 {
            assert!(limiter.allow("mail", 3, 60).await.unwrap());
        }
        assert!(!limiter.allow("mail", 3, 60).await.unwrap());
        assert!(limiter.allow("other", 3, 60).await.unwrap());

        clock.advance_ms(60_000);
        assert!(limiter.allow("mail", 3, 60).await.unwrap());
    }

    #[tokio::test]
    async fn counter_outlives_sub_second_offsets() {
        let (clock, cache) = setup();
        let limiter = RateLimiter::new(cache, clock.clone());

        assert!(limiter.allow("mail", 2, 2).await.unwrap());
        clock.advance_ms(500);
        assert!(limiter.allow("mail", 2, 2).await.unwrap());
        clock.advance_ms(1_100);
        assert!(!limiter.allow("mail", 2, 2).await.unwrap());

        clock.advance_ms(400);
        assert!(limiter.allow("mail", 2, 2).await.unwrap());
    }

    #[tokio::test]
    async fn contended_lock_falls_back_to_read() {
        let (clock, cache) = setup();
        let lock = MutexLock::new(cache.clone())
            .poll_interval(Duration::from_millis(1), Duration::from_millis(2));
        let limiter = RateLimiter::new(cache.clone(), clock.clone())
            .with_lock(lock.clone())
            .brief_timeout(Duration::from_millis(10));

        assert!(limiter.allow("mail", 1, 60).await.unwrap());

        let _held = lock.try_acquire("rate:mail", 30).await.unwrap().unwrap();
        assert!(!limiter.allow("mail", 1, 60).await.unwrap());
        assert!(limiter.allow("fresh", 1, 60).await.unwrap());
    }

    #[tokio::test]
    async fn remember_reuses_until_expiry() {
        let (clock, cache) = setup();
        let memo = Memoizer::new(cache);
        let mut calls = 0;

        for _ in 0..2 {
            let v: u32 = memo
                .remember("total", 30, || {
                    calls += 1;
                    async { Ok(42) }
                })
                .await
                .unwrap();
            assert_eq!(v, 42);
        }
        assert_eq!(calls, 1);

        clock.advance_ms(30_000);
        let _: u32 = memo
            .remember("total", 30, || {
                calls += 1;
                async { Ok(43) }
            })
            .await
            .unwrap();
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn forget_drops_memoized_value() {
        let (_clock, cache) = setup();
        let memo = Memoizer::new(cache.clone());

        let first: u32 = memo.remember("total", 30, || async { Ok(1) }).await.unwrap();
        memo.forget("total").await.unwrap();
        assert!(cache.is_empty());
        let second: u32 = memo.remember("total", 30, || async { Ok(2) }).await.unwrap();
        assert_eq!((first, second), (1, 2));
    }

    #[tokio::test]
    async fn producer_error_is_not_cached() {
        let (_clock, cache) = setup();
        let memo = Memoizer::new(cache.clone());
        let result: Result<u32> = memo
            .remember("x", 30, || async { Err(Error::Other("api down".into())) })
            .await;
        assert!(result.is_err());
        assert!(cache.is_empty());
    }
}
