use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mailrelay_core::{EmailJob, JobStatus};
use mailrelay_infra::jobs::JobOutcome;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct EnqueueJobRequest {
    /// Caller-chosen id; generated when absent.
    pub id: Option<String>,
    pub recipient: String,
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
    /// Defer the job until this instant.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Submitting user; concurrent submissions by the same actor are rejected.
    pub actor: Option<String>,
}

fn empty_payload() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Debug, Default, Deserialize)]
pub struct ProcessJobsQuery {
    pub limit: Option<usize>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: String,
    pub status: JobStatus,
    pub recipient: String,
    pub payload: serde_json::Value,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<EmailJob> for JobView {
    fn from(job: EmailJob) -> Self {
        let (locked_by, locked_at) = match job.lock {
            Some(lock) => (Some(lock.locked_by.as_str().to_string()), Some(lock.locked_at)),
            None => (None, None),
        };
        Self {
            id: job.id.into_string(),
            status: job.status,
            recipient: job.recipient,
            payload: job.payload,
            scheduled_for: job.scheduled_for,
            attempts: job.attempts,
            locked_by,
            locked_at,
            sent_at: job.sent_at,
            failed_at: job.failed_at,
            error_message: job.error_message,
            created_at: job.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SendJobResponse {
    pub job_id: String,
    #[serde(flatten)]
    pub outcome: JobOutcome,
}
