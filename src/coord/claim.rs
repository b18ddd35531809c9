//! One-shot idempotency claims.
//!
//! A claim marks a unit of work as started. Only TTL expiry removes it, so a
//! duplicate dispatch inside the window is a no-op on the second attempt.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tracing::{debug, warn};

use super::lock::MutexLock;
use crate::error::{Error, Result};
use crate::model::ClaimKey;
use crate::store::KeyValueStore;
use crate::telemetry::metrics;

const CLAIMED: &str = "1";

/// Guards (workflow, step, target) keys against duplicate execution.
#[derive(Clone)]
pub struct IdempotencyGuard {
    cache: Arc<dyn KeyValueStore>,
    lock: MutexLock,
    brief_timeout: Duration,
    brief_lease_seconds: u64,
}

impl IdempotencyGuard {
    pub fn new(cache: Arc<dyn KeyValueStore>) -> Self {
        Self {
            lock: MutexLock::new(cache.clone()).label("claim"),
            cache,
            brief_timeout: Duration::from_millis(500),
            brief_lease_seconds: 5,
        }
    }

    /// How long to wait for the internal check-and-set lock before giving up.
    pub fn brief_timeout(mut self, timeout: Duration) -> Self {
        self.brief_timeout = timeout;
        self
    }

    pub fn with_lock(mut self, lock: MutexLock) -> Self {
        self.lock = lock.label("claim");
        self
    }

    /// Try to claim `key` for `ttl_seconds`.
    ///
    /// Returns `false` if the key is already claimed, and also if the internal
    /// lock could not be taken in time: under contention a missed claim is
    /// preferred over a duplicate run.
    pub async fn claim(&self, key: &str, ttl_seconds: u64) -> Result<bool> {
        let cache = &self.cache;
        let outcome = self
            .lock
            .acquire(
                &format!("claim:{key}"),
                self.brief_timeout.as_millis() as u64,
                self.brief_lease_seconds,
                move || async move {
                    if cache.get(key).await?.is_some() {
                        return Ok(false);
                    }
                    cache.put(key, CLAIMED, ttl_seconds).await?;
                    Ok(true)
                },
            )
            .await;

        let (claimed, result) = match outcome {
            Ok(true) => (true, "claimed"),
            Ok(false) => (false, "duplicate"),
            Err(Error::AcquisitionTimeout { .. }) => {
                warn!(key, "claim lock contended, treating as already claimed");
                (false, "contended")
            }
            Err(e) => return Err(e),
        };

        debug!(key, ttl_seconds, result, "claim");
        metrics::claim_attempts().add(1, &[KeyValue::new("result", result)]);
        Ok(claimed)
    }

    pub async fn claim_key(&self, key: &ClaimKey) -> Result<bool> {
        self.claim(&key.key, key.ttl_seconds).await
    }

    /// Whether `key` is currently claimed. Read-only.
    pub async fn is_claimed(&self, key: &str) -> Result<bool> {
        Ok(self.cache.get(key).await?.is_some())
    }
}
