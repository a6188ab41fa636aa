//! Email job record and its lifecycle state machine.
//!
//! ```text
//! pending ──┐
//!           ├─ claim ─> processing ─ send ok ─────────────> sent
//! scheduled ┘               │
//!                           ├─ send failed, retries left ─> pending
//!                           └─ send failed, exhausted ────> failed
//! ```
//!
//! `sent` and `failed` are terminal.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::worker::WorkerId;

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `scheduled_for` to pass.
    Scheduled,
    /// Ready to be claimed.
    Pending,
    /// Claimed by a worker, send in flight.
    Processing,
    /// Delivered.
    Sent,
    /// Retry ceiling reached.
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Scheduled,
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Sent,
        JobStatus::Failed,
    ];

    /// Statuses a job can still move out of.
    pub const ACTIVE: [JobStatus; 3] = [
        JobStatus::Scheduled,
        JobStatus::Pending,
        JobStatus::Processing,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Sent | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Sent => "sent",
            JobStatus::Failed => "failed",
        }
    }

    /// Status after a failed send that brings the job to `new_attempts`.
    pub fn after_failure(new_attempts: u32, max_attempts: u32) -> JobStatus {
        if new_attempts >= max_attempts {
            JobStatus::Failed
        } else {
            JobStatus::Pending
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(JobStatus::Scheduled),
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "sent" => Ok(JobStatus::Sent),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// Durable lock stamp: who holds the job and since when.
///
/// Advisory only; the lease store key is the authority on ownership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLock {
    pub locked_by: WorkerId,
    pub locked_at: DateTime<Utc>,
}

impl JobLock {
    pub fn new(locked_by: WorkerId, locked_at: DateTime<Utc>) -> Self {
        Self {
            locked_by,
            locked_at,
        }
    }

    pub fn is_stale(&self, stale_before: DateTime<Utc>) -> bool {
        self.locked_at < stale_before
    }
}

/// One outbound email job as stored in the job table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailJob {
    pub id: JobId,
    pub status: JobStatus,
    pub recipient: String,
    /// Opaque content for the mail transport.
    pub payload: serde_json::Value,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub lock: Option<JobLock>,
    pub sent_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl EmailJob {
    /// A job ready to send now.
    pub fn pending(
        id: JobId,
        recipient: impl Into<String>,
        payload: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            recipient: recipient.into(),
            payload,
            scheduled_for: None,
            attempts: 0,
            lock: None,
            sent_at: None,
            failed_at: None,
            error_message: None,
            created_at,
        }
    }

    /// A job that becomes due at `at`.
    pub fn scheduled(
        id: JobId,
        recipient: impl Into<String>,
        payload: serde_json::Value,
        at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: JobStatus::Scheduled,
            scheduled_for: Some(at),
            ..Self::pending(id, recipient, payload, created_at)
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for.is_none_or(|at| at <= now)
    }

    pub fn is_unlocked(&self) -> bool {
        self.lock.is_none()
    }

    pub fn has_stale_lock(&self, stale_before: DateTime<Utc>) -> bool {
        self.lock.as_ref().is_some_and(|l| l.is_stale(stale_before))
    }

    pub fn locked_by(&self) -> Option<&WorkerId> {
        self.lock.as_ref().map(|l| &l.locked_by)
    }

    /// Check the record-level invariants.
    pub fn validate(&self, max_attempts: u32) -> DomainResult<()> {
        if self.attempts >= max_attempts && self.status != JobStatus::Failed && self.status != JobStatus::Sent {
            return Err(DomainError::invariant(format!(
                "job {} has {} attempts but status {}",
                self.id, self.attempts, self.status
            )));
        }
        if self.status == JobStatus::Sent && self.sent_at.is_none() {
            return Err(DomainError::invariant(format!("job {} is sent without sent_at", self.id)));
        }
        if self.status == JobStatus::Failed && self.failed_at.is_none() {
            return Err(DomainError::invariant(format!("job {} is failed without failed_at", self.id)));
        }
        Ok(())
    }
}

/// Eligibility predicate and ordering for one claim batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableJobsQuery {
    pub now: DateTime<Utc>,
    pub stale_before: DateTime<Utc>,
    pub max_attempts: u32,
    pub limit: usize,
}

impl AvailableJobsQuery {
    /// Whether `job` may be handed to a claimer.
    ///
    /// - `pending`, unlocked;
    /// - `scheduled`, due, and unlocked or stale;
    /// - any active status with a stale lock (crash recovery, covers a worker
    ///   that died while the job was `processing`).
    ///
    /// In every case `attempts < max_attempts` and the job must be due.
    pub fn matches(&self, job: &EmailJob) -> bool {
        if job.status.is_terminal() || job.attempts >= self.max_attempts || !job.is_due(self.now) {
            return false;
        }

        let stale = job.has_stale_lock(self.stale_before);
        match job.status {
            JobStatus::Pending => job.is_unlocked() || stale,
            JobStatus::Scheduled => {
                let reached = job.scheduled_for.is_some_and(|at| at <= self.now);
                (reached && job.is_unlocked()) || stale
            }
            JobStatus::Processing => stale,
            JobStatus::Sent | JobStatus::Failed => false,
        }
    }

    /// Claim order: earliest `scheduled_for` first (unscheduled last), then FIFO.
    pub fn order(a: &EmailJob, b: &EmailJob) -> core::cmp::Ordering {
        let due = match (a.scheduled_for, b.scheduled_for) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => core::cmp::Ordering::Less,
            (None, Some(_)) => core::cmp::Ordering::Greater,
            (None, None) => core::cmp::Ordering::Equal,
        };
        due.then_with(|| a.created_at.cmp(&b.created_at))
    }
}
