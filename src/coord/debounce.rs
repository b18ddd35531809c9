//! Suppresses repeat triggers inside a minimum interval.
//!
//! Read, decide and write are not atomic. Two overlapping checks may both
//! proceed; that only costs a redundant (idempotent) run downstream.

use std::sync::Arc;

use tracing::debug;

use crate::clock::Clock;
use crate::error::Result;
use crate::model::DebounceRecord;
use crate::store::KeyValueStore;

#[derive(Clone)]
pub struct DebounceFilter {
    cache: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl DebounceFilter {
    pub fn new(cache: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { cache, clock }
    }

    /// True if there is no prior record for `domain`, the discriminator
    /// changed, or at least `min_interval_ms` passed since the last check.
    /// The record is rewritten on every call, whatever the answer.
    pub async fn should_proceed(
        &self,
        domain: &str,
        discriminator: &str,
        min_interval_ms: u64,
    ) -> Result<bool> {
        let key = format!("debounce:{domain}");
        let now = self.clock.now();

        let previous: Option<DebounceRecord> = self
            .cache
            .get(&key)
            .await?
            .and_then(|raw| serde_json::from_str(&raw).ok());

        let proceed = match &previous {
            None => true,
            Some(prev) if prev.discriminator != discriminator => true,
            Some(prev) => {
                (now - prev.last_timestamp).num_milliseconds()
                    >= i64::try_from(min_interval_ms).unwrap_or(i64::MAX)
            }
        };

        let record = DebounceRecord {
            last_timestamp: now,
            discriminator: discriminator.to_string(),
        };
        // Keep the record at least one interval; past that, absence means "proceed" anyway.
        let ttl_seconds = min_interval_ms.div_ceil(1000).max(1) + 1;
        self.cache
            .put(&key, &serde_json::to_string(&record)?, ttl_seconds)
            .await?;

        debug!(domain, discriminator, proceed, "debounce check");
        Ok(proceed)
    }
}
