//! Ephemeral, TTL-based key-value store used as the authority on lock ownership.
//!
//! Implementations must make each of the three lease primitives atomic for a
//! single key. There is no ordering guarantee across keys.

use std::time::Duration;

use async_trait::async_trait;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryLeaseStore;
#[cfg(feature = "redis")]
pub use redis::RedisLeaseStore;

/// Lease store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LeaseStoreError {
    /// The store could not be reached (connection refused, timeout, closed).
    #[error("lease store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with an error or an unexpected reply.
    #[error("lease store command failed: {0}")]
    Command(String),
}

/// Atomic single-key lease primitives.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Create `key = value` with `ttl` only if `key` is absent.
    ///
    /// Returns `true` iff this call created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LeaseStoreError>;

    /// Delete `key` only if it currently holds `value`.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, LeaseStoreError>;

    /// Reset the TTL of `key` only if it currently holds `value`.
    async fn expire_if_equals(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LeaseStoreError>;

    /// Health probe.
    async fn ping(&self) -> Result<(), LeaseStoreError>;
}
