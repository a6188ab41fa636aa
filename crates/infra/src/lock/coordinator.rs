//! Distributed mutual exclusion over a lease store.
//!
//! Every operation fails closed: if the lease store cannot be reached, acquire,
//! release and extend all report `false` instead of returning an error. Callers
//! then skip the work for this round rather than proceed without exclusion.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use mailrelay_core::WorkerId;

use super::key::LockKey;
use crate::lease_store::LeaseStore;

/// Acquire / release / extend for arbitrary keys, keyed by owner token.
#[derive(Clone)]
pub struct LockCoordinator {
    store: Arc<dyn LeaseStore>,
}

impl LockCoordinator {
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self { store }
    }

    /// Take the lock if nobody holds it. `true` iff this call now owns it.
    #[instrument(level = "debug", skip(self, key, owner), fields(key = %key, owner = %owner))]
    pub async fn acquire(&self, key: &LockKey, owner: &WorkerId, ttl: Duration) -> bool {
        match self.store.set_if_absent(key.as_str(), owner.as_str(), ttl).await {
            Ok(acquired) => {
                debug!(acquired, "lock acquire");
                acquired
            }
            Err(e) => {
                warn!(error = %e, "lease store error; lock acquisition failed");
                false
            }
        }
    }

    /// Drop the lock if `owner` still holds it. A non-owner release is a no-op.
    #[instrument(level = "debug", skip(self, key, owner), fields(key = %key, owner = %owner))]
    pub async fn release(&self, key: &LockKey, owner: &WorkerId) -> bool {
        match self.store.delete_if_equals(key.as_str(), owner.as_str()).await {
            Ok(released) => {
                if !released {
                    debug!("lock not held by owner; release skipped");
                }
                released
            }
            Err(e) => {
                warn!(error = %e, "lease store error; lock release failed");
                false
            }
        }
    }

    /// Re-arm the TTL if `owner` still holds the lock. A non-owner extend is a no-op.
    #[instrument(level = "debug", skip(self, key, owner), fields(key = %key, owner = %owner))]
    pub async fn extend(&self, key: &LockKey, owner: &WorkerId, ttl: Duration) -> bool {
        match self.store.expire_if_equals(key.as_str(), owner.as_str(), ttl).await {
            Ok(extended) => extended,
            Err(e) => {
                warn!(error = %e, "lease store error; lock extension failed");
                false
            }
        }
    }

    /// Run `work` only while holding `key`, releasing afterwards.
    ///
    /// Returns `None` without polling `work` when the lock is held elsewhere.
    pub async fn with_lock<F, T>(&self, key: &LockKey, owner: &WorkerId, ttl: Duration, work: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        if !self.acquire(key, owner, ttl).await {
            return None;
        }
        let out = work.await;
        self.release(key, owner).await;
        Some(out)
    }

    /// Whether the lease store answers a health probe.
    pub async fn is_available(&self) -> bool {
        self.store.ping().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use mailrelay_core::ManualClock;

    use super::*;
    use crate::lease_store::InMemoryLeaseStore;

    const TTL: Duration = Duration::from_secs(300);

    fn setup() -> (LockCoordinator, Arc<InMemoryLeaseStore>, ManualClock) {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryLeaseStore::with_clock(Arc::new(clock.clone())));
        (LockCoordinator::new(store.clone()), store, clock)
    }

    #[tokio::test]
    async fn only_one_owner_at_a_time() {
        let (locks, _, _) = setup();
        let key = LockKey::new("k");
        let a = WorkerId::from_token("worker-a");
        let b = WorkerId::from_token("worker-b");

        assert!(locks.acquire(&key, &a, TTL).await);
        assert!(!locks.acquire(&key, &b, TTL).await);
        assert!(locks.release(&key, &a).await);
        assert!(locks.acquire(&key, &b, TTL).await);
    }

    #[tokio::test]
    async fn stale_owner_cannot_touch_new_holder() {
        let (locks, store, clock) = setup();
        let key = LockKey::new("k");
        let a = WorkerId::from_token("worker-a");
        let b = WorkerId::from_token("worker-b");

        assert!(locks.acquire(&key, &a, TTL).await);
        clock.advance(chrono::Duration::seconds(301));
        assert!(locks.acquire(&key, &b, TTL).await);

        assert!(!locks.release(&key, &a).await);
        assert!(!locks.extend(&key, &a, TTL).await);
        assert_eq!(store.value_of("k").as_deref(), Some("worker-b"));
        assert!(locks.extend(&key, &b, TTL).await);
    }

    #[tokio::test]
    async fn unavailable_store_fails_closed() {
        let (locks, store, _) = setup();
        let key = LockKey::new("k");
        let a = WorkerId::from_token("worker-a");
        store.set_available(false);

        assert!(!locks.acquire(&key, &a, TTL).await);
        assert!(!locks.release(&key, &a).await);
        assert!(!locks.extend(&key, &a, TTL).await);
        assert!(!locks.is_available().await);
    }

    #[tokio::test]
    async fn with_lock_skips_work_when_contended() {
        let (locks, store, _) = setup();
        let key = LockKey::resource_create("project", "user-1");
        let holder = WorkerId::random();
        let other = WorkerId::random();

        assert!(locks.acquire(&key, &holder, Duration::from_secs(10)).await);
        let skipped = locks
            .with_lock(&key, &other, Duration::from_secs(10), async { 1 })
            .await;
        assert_eq!(skipped, None);

        locks.release(&key, &holder).await;
        let ran = locks
            .with_lock(&key, &other, Duration::from_secs(10), async { 2 })
            .await;
        assert_eq!(ran, Some(2));
        assert!(store.value_of(key.as_str()).is_none());
    }
}
