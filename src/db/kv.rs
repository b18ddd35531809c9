//! Cache and property tables via direct SQLx.
//!
//! Expiry is evaluated against the database clock (`now()`), so every
//! invocation agrees on whether an entry is live.

use async_trait::async_trait;

use super::Db;
use crate::error::Result;
use crate::store::{KeyValueStore, PropertyStore, clamp_ttl};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

impl Db {
    /// Delete cache rows whose TTL has passed. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= now()")
            .execute(self.pool())
            .await?
            .rows_affected();
        metrics::store_purged().add(removed, &[KeyValue::new("table", "cache_entries")]);
        Ok(removed)
    }
}

#[async_trait]
impl KeyValueStore for Db {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM cache_entries WHERE key = $1 AND expires_at > now()")
                .bind(key)
                .fetch_optional(self.pool())
                .await?;
        Ok(row.map(|r| r.0))
    }

    async fn put(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        sqlx::query(
            "INSERT INTO cache_entries (key, value, expires_at)
             VALUES ($1, $2, now() + make_interval(secs => $3))
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(clamp_ttl(ttl_seconds) as f64)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries WHERE key = $1")
            .bind(key)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn add_if_absent(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<bool> {
        // An expired row counts as absent: the conflict branch only
        // overwrites when the existing entry is dead.
        let row: Option<(String,)> = sqlx::query_as(
            "INSERT INTO cache_entries (key, value, expires_at)
             VALUES ($1, $2, now() + make_interval(secs => $3))
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
             WHERE cache_entries.expires_at <= now()
             RETURNING key",
        )
        .bind(key)
        .bind(value)
        .bind(clamp_ttl(ttl_seconds) as f64)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.is_some())
    }

    async fn remove_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let rows_affected = sqlx::query(
            "DELETE FROM cache_entries WHERE key = $1 AND value = $2 AND expires_at > now()",
        )
        .bind(key)
        .bind(expected)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(rows_affected > 0)
    }
}

#[async_trait]
impl PropertyStore for Db {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM properties WHERE key = $1")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|r| r.0))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO properties (key, value, updated_at) VALUES ($1, $2, now())
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        )
        .bind(key)
        .bind(value)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM properties WHERE key = $1")
            .bind(key)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
