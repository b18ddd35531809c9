//! Lease-based mutex over the shared cache.
//!
//! Ownership is proven by value equality: the lock key holds a random token,
//! and only a caller presenting that same token may delete it. The lease TTL
//! bounds how long a crashed holder can block everyone else.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use rand::Rng;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::LeaseToken;
use crate::store::KeyValueStore;
use crate::telemetry::metrics;

const DEFAULT_POLL_MIN: Duration = Duration::from_millis(50);
const DEFAULT_POLL_MAX: Duration = Duration::from_millis(250);

/// Distributed lock keyed by resource id.
#[derive(Clone)]
pub struct MutexLock {
    cache: Arc<dyn KeyValueStore>,
    label: String,
    poll_min: Duration,
    poll_max: Duration,
}

impl MutexLock {
    pub fn new(cache: Arc<dyn KeyValueStore>) -> Self {
        Self {
            cache,
            label: "mutex".to_string(),
            poll_min: DEFAULT_POLL_MIN,
            poll_max: DEFAULT_POLL_MAX,
        }
    }

    /// Name reported in logs and in [`Error::AcquisitionTimeout`].
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Bounds of the randomized sleep between acquisition attempts.
    pub fn poll_interval(mut self, min: Duration, max: Duration) -> Self {
        self.poll_min = min;
        self.poll_max = max.max(min);
        self
    }

    pub fn lock_key(resource: &str) -> String {
        format!("lock:{resource}")
    }

    /// Single non-blocking attempt.
    pub async fn try_acquire(&self, resource: &str, lease_seconds: u64) -> Result<Option<LeaseToken>> {
        let lease = LeaseToken {
            key: Self::lock_key(resource),
            token: Uuid::new_v4().to_string(),
            lease_seconds,
        };
        if self
            .cache
            .add_if_absent(&lease.key, &lease.token, lease_seconds)
            .await?
        {
            Ok(Some(lease))
        } else {
            Ok(None)
        }
    }

    /// Poll with jittered sleeps until the lease is taken or `timeout` passes.
    pub async fn acquire_lease(
        &self,
        resource: &str,
        timeout: Duration,
        lease_seconds: u64,
    ) -> Result<LeaseToken> {
        let started = tokio::time::Instant::now();
        // An unrepresentable deadline means "wait as long as it takes".
        let deadline = started
            .checked_add(timeout)
            .unwrap_or_else(|| started + Duration::from_secs(100 * 365 * 24 * 3600));
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if let Some(lease) = self.try_acquire(resource, lease_seconds).await? {
                debug!(resource, label = %self.label, attempts, "lease acquired");
                self.count("acquired");
                return Ok(lease);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            let pause = self.jitter().min(deadline - now);
            tokio::time::sleep(pause).await;
        }

        warn!(resource, label = %self.label, attempts, "lease acquisition timed out");
        self.count("timeout");
        Err(Error::AcquisitionTimeout {
            resource: resource.to_string(),
            label: self.label.clone(),
        })
    }

    /// Release only if the stored token still matches ours. Returns false if
    /// the lease had already expired (and perhaps been taken by someone else).
    pub async fn release(&self, lease: &LeaseToken) -> Result<bool> {
        let released = self.cache.remove_if_equals(&lease.key, &lease.token).await?;
        if !released {
            warn!(key = %lease.key, label = %self.label, "lease lost before release");
        }
        Ok(released)
    }

    /// Run `f` while holding the lock on `resource`.
    ///
    /// The lease is released whether `f` succeeds or fails. A failed release
    /// is logged, not returned: the TTL reclaims the key regardless.
    pub async fn acquire<F, Fut, T>(
        &self,
        resource: &str,
        timeout_ms: u64,
        lease_seconds: u64,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = self
            .acquire_lease(resource, Duration::from_millis(timeout_ms), lease_seconds)
            .await?;

        let result = f().await;

        if let Err(e) = self.release(&lease).await {
            warn!(resource, label = %self.label, error = %e, "lease release failed");
        }
        result
    }

    fn jitter(&self) -> Duration {
        let min = self.poll_min.as_millis() as u64;
        let max = self.poll_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    fn count(&self, result: &'static str) {
        metrics::lock_acquisitions().add(
            1,
            &[
                KeyValue::new("label", self.label.clone()),
                KeyValue::new("result", result),
            ],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryCache;

    fn setup() -> (Arc<ManualClock>, Arc<MemoryCache>, MutexLock) {
        let clock = Arc::new(ManualClock::at_epoch());
        let cache = Arc::new(MemoryCache::new(clock.clone()));
        let lock = MutexLock::new(cache.clone())
            .poll_interval(Duration::from_millis(1), Duration::from_millis(5));
        (clock, cache, lock)
    }

    #[tokio::test]
    async fn second_try_acquire_fails_while_held() {
        let (_clock, _cache, lock) = setup();
        let first = lock.try_acquire("sheet", 30).await.unwrap();
        assert!(first.is_some());
        assert!(lock.try_acquire("sheet", 30).await.unwrap().is_none());
        assert!(lock.try_acquire("other", 30).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn times_out_with_resource_and_label() {
        let (_clock, _cache, lock) = setup();
        let lock = lock.label("balances");
        let _held = lock.try_acquire("sheet", 30).await.unwrap().unwrap();

        let err = lock
            .acquire("sheet", 20, 30, || async { Ok(()) })
            .await
            .unwrap_err();
        match err {
            Error::AcquisitionTimeout { resource, label } => {
                assert_eq!(resource, "sheet");
                assert_eq!(label, "balances");
            }
            other => panic!("expected AcquisitionTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_release_leaves_new_holder_intact() {
        let (clock, cache, lock) = setup();

        let a = lock.try_acquire("sheet", 10).await.unwrap().unwrap();
        clock.advance_ms(10_001);
        let b = lock.try_acquire("sheet", 10).await.unwrap().unwrap();

        assert!(!lock.release(&a).await.unwrap());
        assert_eq!(
            cache.get(&b.key).await.unwrap().as_deref(),
            Some(b.token.as_str())
        );

        assert!(lock.release(&b).await.unwrap());
        assert!(cache.get(&b.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_is_released_when_body_fails() {
        let (_clock, cache, lock) = setup();
        let result: Result<()> = lock
            .acquire("sheet", 100, 30, || async { Err(Error::Other("boom".into())) })
            .await;
        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn unbounded_timeout_does_not_overflow() {
        let (_clock, cache, lock) = setup();
        let value = lock
            .acquire("sheet", u64::MAX, 30, || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(cache.is_empty());
    }
}
