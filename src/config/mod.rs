//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast on missing or unparsable values.
//! The database URL is wrapped in `secrecy::SecretString` to keep it out of logs.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub coordination: CoordinationConfig,
}

/// Tunables for the coordination primitives and the dispatcher.
#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    /// How long a step waits for its workflow lock.
    pub lock_timeout: Duration,
    /// Lease TTL for step locks.
    pub lease_seconds: u64,
    /// Default TTL for idempotency claims.
    pub claim_ttl_seconds: u64,
    /// Age after which a reentrancy flag is treated as abandoned.
    pub reentrancy_stale_after: Duration,
    /// Poll interval of the dispatcher loop when the queue is empty.
    pub poll_interval: Duration,
    /// pgmq visibility timeout for read messages.
    pub visibility_timeout_seconds: i32,
    /// pgmq queue name.
    pub queue_name: String,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(10),
            lease_seconds: 30,
            claim_ttl_seconds: 600,
            reentrancy_stale_after: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
            visibility_timeout_seconds: 60,
            queue_name: "workflow_steps".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            coordination: CoordinationConfig::from_env()?,
        })
    }
}

impl CoordinationConfig {
    /// Defaults overridden by any `DOCFLOW_*` variables that are set.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            lock_timeout: Duration::from_millis(optional_var(
                "DOCFLOW_LOCK_TIMEOUT_MS",
                defaults.lock_timeout.as_millis() as u64,
            )?),
            lease_seconds: optional_var("DOCFLOW_LEASE_SECONDS", defaults.lease_seconds)?,
            claim_ttl_seconds: optional_var("DOCFLOW_CLAIM_TTL_SECONDS", defaults.claim_ttl_seconds)?,
            reentrancy_stale_after: Duration::from_secs(optional_var(
                "DOCFLOW_REENTRANCY_STALE_SECONDS",
                defaults.reentrancy_stale_after.as_secs(),
            )?),
            poll_interval: Duration::from_millis(optional_var(
                "DOCFLOW_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            visibility_timeout_seconds: optional_var(
                "DOCFLOW_VISIBILITY_TIMEOUT_SECONDS",
                defaults.visibility_timeout_seconds,
            )?,
            queue_name: std::env::var("DOCFLOW_QUEUE").unwrap_or(defaults.queue_name),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid {name}={raw:?}: {e}"))),
        Err(_) => Ok(default),
    }
}
