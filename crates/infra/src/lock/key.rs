//! Lock key namespaces.

use mailrelay_core::JobId;

const JOB_LOCK_PREFIX: &str = "email-job-lock:";

/// Key of one lease in the lease store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey(String);

impl LockKey {
    /// An arbitrary caller-chosen key.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// `email-job-lock:<job id>`
    pub fn job(job_id: &JobId) -> Self {
        Self(format!("{JOB_LOCK_PREFIX}{job_id}"))
    }

    /// `<resource>-create-lock:<actor id>`, the short-lived dedup lock that keeps
    /// one actor from creating the same kind of resource twice concurrently.
    pub fn resource_create(resource: &str, actor_id: &str) -> Self {
        Self(format!("{resource}-create-lock:{actor_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for LockKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
