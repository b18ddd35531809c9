//! "Programmatic edit in progress" flag that survives across invocations.
//!
//! Edit-triggered handlers check [`ReentrancyGuard::is_active`] to tell
//! writes made by the automation itself apart from user edits. The flag is a
//! nesting counter in the durable property store. A flag older than the
//! staleness window is treated as reset, which recovers from a holder that
//! crashed between `begin` and `end`.

use std::future::Future;
use std::sync::Arc;

use chrono::Duration;
use opentelemetry::KeyValue;
use tracing::{debug, warn};

use super::lock::MutexLock;
use crate::clock::Clock;
use crate::error::Result;
use crate::model::ReentrancyFlag;
use crate::store::PropertyStore;
use crate::telemetry::metrics;

pub const DEFAULT_FLAG_KEY: &str = "programmatic_edit";

#[derive(Clone)]
pub struct ReentrancyGuard {
    props: Arc<dyn PropertyStore>,
    clock: Arc<dyn Clock>,
    key: String,
    stale_after: Duration,
    /// Serializes read-modify-write of the counter across invocations.
    lock: Option<MutexLock>,
    lock_timeout: std::time::Duration,
    lock_lease_seconds: u64,
}

impl ReentrancyGuard {
    pub fn new(props: Arc<dyn PropertyStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            props,
            clock,
            key: DEFAULT_FLAG_KEY.to_string(),
            stale_after: Duration::minutes(5),
            lock: None,
            lock_timeout: std::time::Duration::from_secs(2),
            lock_lease_seconds: 10,
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn stale_after(mut self, window: Duration) -> Self {
        self.stale_after = window;
        self
    }

    pub fn with_lock(mut self, lock: MutexLock) -> Self {
        self.lock = Some(lock.label("reentrancy"));
        self
    }

    /// Wait and lease used for the counter lock.
    pub fn lock_timing(mut self, timeout: std::time::Duration, lease_seconds: u64) -> Self {
        self.lock_timeout = timeout;
        self.lock_lease_seconds = lease_seconds;
        self
    }

    /// Enter a programmatic edit. Returns the new nesting depth.
    pub async fn begin(&self) -> Result<u32> {
        self.locked(move || async move {
            let count = self.current().await?.map_or(0, |f| f.count) + 1;
            self.write(count).await?;
            debug!(key = %self.key, count, "programmatic edit begin");
            Ok(count)
        })
        .await
    }

    /// Leave a programmatic edit. Returns the remaining depth; the property
    /// is deleted once it reaches zero.
    pub async fn end(&self) -> Result<u32> {
        self.locked(move || async move {
            let count = self
                .current()
                .await?
                .map_or(0, |f| f.count)
                .saturating_sub(1);
            if count == 0 {
                self.props.delete(&self.key).await?;
            } else {
                self.write(count).await?;
            }
            debug!(key = %self.key, count, "programmatic edit end");
            Ok(count)
        })
        .await
    }

    pub async fn is_active(&self) -> Result<bool> {
        Ok(self.current().await?.is_some_and(|f| f.count > 0))
    }

    /// `begin`, run `f`, then `end` on every exit path of `f`.
    ///
    /// An error from `end` is logged; `f`'s own result is returned.
    pub async fn run_guarded<F, Fut, T>(&self, label: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let depth = self.begin().await?;
        debug!(label, depth, "guarded section entered");

        let result = f().await;

        if let Err(e) = self.end().await {
            warn!(label, error = %e, "failed to clear programmatic edit flag");
        }
        result
    }

    /// Live flag, or `None` if absent, unreadable or stale.
    async fn current(&self) -> Result<Option<ReentrancyFlag>> {
        let Some(raw) = self.props.get(&self.key).await? else {
            return Ok(None);
        };
        let flag: ReentrancyFlag = match serde_json::from_str(&raw) {
            Ok(flag) => flag,
            Err(e) => {
                warn!(key = %self.key, error = %e, "unreadable reentrancy flag, treating as reset");
                self.recovered();
                return Ok(None);
            }
        };
        if self.clock.now() - flag.timestamp > self.stale_after {
            warn!(
                key = %self.key,
                count = flag.count,
                since = %flag.timestamp,
                "stale reentrancy flag recovered"
            );
            self.recovered();
            return Ok(None);
        }
        Ok(Some(flag))
    }

    async fn write(&self, count: u32) -> Result<()> {
        let flag = ReentrancyFlag {
            count,
            timestamp: self.clock.now(),
        };
        self.props
            .set(&self.key, &serde_json::to_string(&flag)?)
            .await
    }

    async fn locked<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match &self.lock {
            Some(lock) => {
                let timeout_ms = u64::try_from(self.lock_timeout.as_millis()).unwrap_or(u64::MAX);
                lock.acquire(&self.key, timeout_ms, self.lock_lease_seconds, f)
                    .await
            }
            None => f().await,
        }
    }

    fn recovered(&self) {
        metrics::state_recovered().add(1, &[KeyValue::new("kind", "reentrancy_flag")]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::Error;
    use crate::store::MemoryProperties;

    fn guard() -> (Arc<ManualClock>, Arc<MemoryProperties>, ReentrancyGuard) {
        let clock = Arc::new(ManualClock::at_epoch());
        let props = Arc::new(MemoryProperties::new());
        let guard = ReentrancyGuard::new(props.clone(), clock.clone());
        (clock, props, guard)
    }

    #[tokio::test]
    async fn nested_begin_end_counts() {
        let (_clock, props, guard) = guard();
        guard.begin().await.unwrap();
        guard.begin().await.unwrap();
        guard.end().await.unwrap();
        assert!(guard.is_active().await.unwrap());

        guard.end().await.unwrap();
        assert!(!guard.is_active().await.unwrap());
        assert!(!props.contains(DEFAULT_FLAG_KEY));
    }

    #[tokio::test]
    async fn end_without_begin_stays_at_zero() {
        let (_clock, _props, guard) = guard();
        assert_eq!(guard.end().await.unwrap(), 0);
        assert_eq!(guard.begin().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stale_flag_is_reset() {
        let (clock, _props, guard) = guard();
        guard.begin().await.unwrap();
        guard.begin().await.unwrap();

        clock.advance(Duration::minutes(6));
        assert!(!guard.is_active().await.unwrap());
        assert_eq!(guard.begin().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn run_guarded_clears_flag_on_error() {
        let (_clock, props, guard) = guard();
        let inner = guard.clone();
        let result: Result<()> = guard
            .run_guarded("reformat", || async move {
                assert!(inner.is_active().await?);
                Err(Error::Other("write failed".into()))
            })
            .await;

        assert!(result.is_err());
        assert!(!guard.is_active().await.unwrap());
        assert!(!props.contains(DEFAULT_FLAG_KEY));
    }
}
