//! Process configuration read from the environment.

use std::time::Duration;

use mailrelay_infra::jobs::dispatcher::DEFAULT_POLL_INTERVAL;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_url: Option<String>,
    pub redis_url: String,
    pub poll_interval: Duration,
    /// Postgres + Redis instead of in-memory stores.
    pub use_persistent_stores: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            database_url: None,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            use_persistent_stores: false,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let poll_interval = match lookup("POLL_INTERVAL_SECS") {
            Some(raw) => match raw.parse::<u64>() {
                Ok(secs) => Duration::from_secs(secs),
                Err(_) => {
                    tracing::warn!(value = %raw, "invalid POLL_INTERVAL_SECS; using default");
                    defaults.poll_interval
                }
            },
            None => defaults.poll_interval,
        };

        Self {
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_url: lookup("DATABASE_URL").filter(|u| !u.trim().is_empty()),
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            poll_interval,
            use_persistent_stores: lookup("USE_PERSISTENT_STORES")
                .and_then(|v| v.parse::<bool>().ok())
                .unwrap_or(false),
        }
    }
}
