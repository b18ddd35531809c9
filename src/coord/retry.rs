//! Bounded exponential backoff for flaky, repeat-safe operations.

use std::future::Future;
use std::time::Duration;

use opentelemetry::KeyValue;
use tracing::warn;

use crate::error::{Error, Result};
use crate::telemetry::metrics;

#[derive(Debug, Clone, Copy)]
pub struct RetryWithBackoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryWithBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryWithBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Delay slept after the `attempt`-th failure (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `f` up to `max_attempts` times (at least once).
    ///
    /// Only wrap operations that are safe to repeat. Once attempts run out,
    /// the last error comes back wrapped in [`Error::RetriesExhausted`].
    pub async fn run<F, Fut, T>(&self, mut f: F, label: &str, max_attempts: u32) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match f().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            warn!(label, attempt, max_attempts, error = %error, "attempt failed");
            metrics::retry_failures().add(1, &[KeyValue::new("label", label.to_string())]);

            if attempt >= max_attempts {
                return Err(Error::RetriesExhausted {
                    label: label.to_string(),
                    attempts: attempt,
                    last_error: Box::new(error),
                });
            }
            tokio::time::sleep(self.delay_after(attempt)).await;
        }
    }
}
