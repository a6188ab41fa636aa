//! Development mail transport.

use async_trait::async_trait;
use tracing::info;

use mailrelay_core::EmailJob;
use mailrelay_infra::jobs::{Mailer, SendError};

/// Logs each message instead of delivering it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, job: &EmailJob) -> Result<(), SendError> {
        if job.recipient.trim().is_empty() {
            return Err(SendError::new("recipient is empty"));
        }
        info!(job_id = %job.id, recipient = %job.recipient, payload = %job.payload, "email delivered (log transport)");
        Ok(())
    }
}
