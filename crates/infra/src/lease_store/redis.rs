//! Redis-backed lease store (optional).
//!
//! - acquire: `SET key value NX PX ttl`
//! - release: Lua compare-then-`DEL`
//! - extend: Lua compare-then-`PEXPIRE`
//!
//! The compare-then-act scripts run atomically on the server, so a worker whose
//! lease expired and was re-taken by someone else can never delete or extend
//! the new holder's key.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{ErrorKind, RedisError, Script};
use tracing::instrument;

use super::{LeaseStore, LeaseStoreError};

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Redis lease store over an auto-reconnecting multiplexed connection.
#[derive(Clone)]
pub struct RedisLeaseStore {
    conn: ConnectionManager,
    release: Script,
    extend: Script,
}

impl RedisLeaseStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, LeaseStoreError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(map_redis_error)?;
        let conn = ConnectionManager::new(client).await.map_err(map_redis_error)?;

        Ok(Self {
            conn,
            release: Script::new(RELEASE_SCRIPT),
            extend: Script::new(EXTEND_SCRIPT),
        })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn map_redis_error(err: RedisError) -> LeaseStoreError {
    let unreachable = err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
        || matches!(err.kind(), ErrorKind::ClientError | ErrorKind::BusyLoadingError | ErrorKind::TryAgain);

    if unreachable {
        LeaseStoreError::Unavailable(err.to_string())
    } else {
        LeaseStoreError::Command(err.to_string())
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    #[instrument(level = "debug", skip(self, value), err)]
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LeaseStoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(reply.as_deref() == Some("OK"))
    }

    #[instrument(level = "debug", skip(self, value), err)]
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, LeaseStoreError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(deleted == 1)
    }

    #[instrument(level = "debug", skip(self, value), err)]
    async fn expire_if_equals(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LeaseStoreError> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .extend
            .key(key)
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(extended == 1)
    }

    async fn ping(&self) -> Result<(), LeaseStoreError> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        if pong == "PONG" {
            Ok(())
        } else {
            Err(LeaseStoreError::Command(format!("unexpected PING reply: {pong}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_is_sent_in_millis_and_never_zero() {
        assert_eq!(ttl_millis(Duration::from_secs(300)), 300_000);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
    }
}
