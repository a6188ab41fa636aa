//! Worker identity: the owner token written into every lock this process takes.
//!
//! The token is computed once at startup and handed to the lock coordinator and
//! lease manager explicitly; nothing reads it from ambient process state later.

use serde::{Deserialize, Serialize};

const WORKER_PREFIX: &str = "worker-";

/// Owner token identifying one worker process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    /// Detect the identity of the current process.
    ///
    /// Uses `$HOSTNAME` when set (container runtimes export it), then the OS
    /// hostname, and falls back to 16 random hex characters.
    pub fn detect() -> Self {
        let from_env = std::env::var("HOSTNAME").ok();
        let host = from_env.or_else(|| gethostname::gethostname().into_string().ok());
        let id = Self::from_host(host.as_deref());
        tracing::info!(worker_id = %id, "worker identity initialized");
        id
    }

    /// Build a token from a host identifier, or a random suffix if the host is
    /// missing or blank.
    pub fn from_host(host: Option<&str>) -> Self {
        match host.map(str::trim).filter(|h| !h.is_empty()) {
            Some(host) => Self(format!("{WORKER_PREFIX}{host}")),
            None => Self::random(),
        }
    }

    /// A token with a random suffix. Also used for short-lived per-call owners.
    pub fn random() -> Self {
        Self(format!("{WORKER_PREFIX}{:016x}", rand::random::<u64>()))
    }

    /// Wrap an existing token verbatim (e.g. one read back from the job table).
    pub fn from_token(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_derived_token() {
        assert_eq!(WorkerId::from_host(Some("mail-7f9c")).as_str(), "worker-mail-7f9c");
    }

    #[test]
    fn blank_host_falls_back_to_random() {
        let a = WorkerId::from_host(Some("  "));
        let b = WorkerId::from_host(None);

        assert!(a.as_str().starts_with(WORKER_PREFIX));
        assert_eq!(a.as_str().len(), WORKER_PREFIX.len() + 16);
        assert_ne!(a, b);
    }
}
