//! Storage capabilities the coordination layer is built on.
//!
//! Two stores, both shared by every concurrent invocation:
//! - a cache ([`KeyValueStore`]) with per-key TTL and an atomic add-if-absent,
//! - a durable property store ([`PropertyStore`]) with no expiry.
//!
//! Anything that must survive from one dispatch to the next lives in one of
//! these. Values are opaque strings; callers serialize with serde_json.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::{MemoryCache, MemoryProperties};

/// Upper bound applied to every cache TTL (six hours).
pub const MAX_TTL_SECONDS: u64 = 21_600;

/// TTL-bearing cache shared across invocations.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Current value, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Unconditional write.
    async fn put(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Atomically store `value` only if no live entry exists. Returns whether
    /// this call wrote it.
    async fn add_if_absent(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<bool>;

    /// Delete `key` only while it still holds `expected`. Returns whether
    /// anything was deleted.
    ///
    /// The default is a read followed by a delete; backends that can do the
    /// comparison atomically should override it.
    async fn remove_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        match self.get(key).await? {
            Some(current) if current == expected => {
                self.remove(key).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Durable key/value properties. No TTL.
#[async_trait]
pub trait PropertyStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

pub(crate) fn clamp_ttl(ttl_seconds: u64) -> u64 {
    ttl_seconds.min(MAX_TTL_SECONDS)
}
