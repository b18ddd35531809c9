//! Coordination primitives shared by overlapping invocations.
//!
//! Every primitive keeps its state in the injected stores; nothing here is
//! assumed to survive in process memory between dispatches.

pub mod claim;
pub mod debounce;
pub mod lock;
pub mod rate;
pub mod reentrancy;
pub mod retry;

pub use claim::IdempotencyGuard;
pub use debounce::DebounceFilter;
pub use lock::MutexLock;
pub use rate::{Memoizer, RateLimiter};
pub use reentrancy::ReentrancyGuard;
pub use retry::RetryWithBackoff;

use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::CoordinationConfig;
use crate::store::{KeyValueStore, MemoryCache, MemoryProperties, PropertyStore};

/// The shared stores plus tunables, from which every primitive is built.
///
/// Cheap to clone; step handlers receive one in their context.
#[derive(Clone)]
pub struct Coordination {
    pub cache: Arc<dyn KeyValueStore>,
    pub props: Arc<dyn PropertyStore>,
    pub clock: Arc<dyn Clock>,
    pub config: CoordinationConfig,
}

impl Coordination {
    pub fn new(
        cache: Arc<dyn KeyValueStore>,
        props: Arc<dyn PropertyStore>,
        clock: Arc<dyn Clock>,
        config: CoordinationConfig,
    ) -> Self {
        Self {
            cache,
            props,
            clock,
            config,
        }
    }

    /// Fresh in-memory stores sharing `clock`.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::new(
            Arc::new(MemoryCache::new(clock.clone())),
            Arc::new(MemoryProperties::new()),
            clock,
            CoordinationConfig::default(),
        )
    }

    pub fn mutex(&self) -> MutexLock {
        MutexLock::new(self.cache.clone())
    }

    pub fn claims(&self) -> IdempotencyGuard {
        IdempotencyGuard::new(self.cache.clone())
    }

    pub fn reentrancy(&self) -> ReentrancyGuard {
        let stale_after = chrono::Duration::from_std(self.config.reentrancy_stale_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        ReentrancyGuard::new(self.props.clone(), self.clock.clone())
            .stale_after(stale_after)
            .with_lock(self.mutex())
            .lock_timing(self.config.lock_timeout, self.config.lease_seconds)
    }

    pub fn debounce(&self) -> DebounceFilter {
        DebounceFilter::new(self.cache.clone(), self.clock.clone())
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(self.cache.clone(), self.clock.clone())
    }

    pub fn memoizer(&self) -> Memoizer {
        Memoizer::new(self.cache.clone())
    }

    pub fn retry(&self) -> RetryWithBackoff {
        RetryWithBackoff::default()
    }
}

impl Default for Coordination {
    fn default() -> Self {
        Self::in_memory(Arc::new(SystemClock))
    }
}
