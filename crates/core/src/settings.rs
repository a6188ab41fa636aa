//! Lease timing and retry settings.
//!
//! Passed to the lease manager at construction; there is no global config.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lock TTL in the lease store.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

/// Age of a durable `locked_at` after which the lock counts as abandoned.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

/// Failed attempts before a job becomes terminally `failed`.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Jobs fetched per claim batch.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// TTL of short-lived resource-creation dedup locks.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(10);

/// Settings for the job leasing protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseSettings {
    /// TTL applied on acquire and on every extend.
    pub lock_ttl: Duration,
    /// Staleness threshold for durable lock hand-off and reclamation.
    pub stale_after: Duration,
    /// Retry ceiling.
    pub max_attempts: u32,
    /// Default claim batch size.
    pub batch_size: usize,
    /// TTL of resource-creation dedup locks.
    pub dedup_ttl: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            lock_ttl: DEFAULT_LOCK_TTL,
            stale_after: DEFAULT_STALE_AFTER,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            batch_size: DEFAULT_BATCH_SIZE,
            dedup_ttl: DEFAULT_DEDUP_TTL,
        }
    }
}

impl LeaseSettings {
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = ttl;
        self
    }

    /// Locks taken before this instant are stale.
    pub fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let window = chrono::Duration::from_std(self.stale_after).unwrap_or(chrono::Duration::MAX);
        now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let s = LeaseSettings::default();
        assert_eq!(s.lock_ttl, Duration::from_secs(300));
        assert_eq!(s.stale_after, Duration::from_secs(300));
        assert_eq!(s.max_attempts, 3);
        assert_eq!(s.batch_size, 50);
        assert_eq!(s.dedup_ttl, Duration::from_secs(10));
        assert_eq!(s.with_dedup_ttl(Duration::from_secs(3)).dedup_ttl, Duration::from_secs(3));
    }

    #[test]
    fn stale_before_subtracts_threshold() {
        let now = Utc::now();
        let s = LeaseSettings::default();
        assert_eq!(now - s.stale_before(now), chrono::Duration::minutes(5));
    }
}
