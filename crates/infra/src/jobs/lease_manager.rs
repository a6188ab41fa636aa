//! Job lease manager: claim, resolve and reclaim email jobs across workers.
//!
//! ## Claim protocol
//!
//! 1. Take the ephemeral lock `email-job-lock:<id>` in the lease store.
//! 2. Stamp `locked_by`/`locked_at` on the durable row, but only where the row
//!    is active, due, and unlocked or holding a stale stamp.
//! 3. If the durable stamp loses (zero rows), drop the ephemeral lock and
//!    report "not claimed". If the write errors, drop the ephemeral lock and
//!    propagate the error.
//!
//! The ephemeral lock is authoritative; the durable stamp is what lets a job
//! held by a crashed worker become claimable again once it goes stale, even
//! while its status still reads `processing`.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use mailrelay_core::{AvailableJobsQuery, Clock, EmailJob, JobId, JobLock, JobStatus, LeaseSettings, WorkerId};

use super::repository::{JobFilter, JobPatch, JobRepository, LockUpdate, RepositoryError};
use crate::lock::{LockCoordinator, LockKey};

/// Lease manager error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LeaseError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("job {0} changed concurrently")]
    Conflict(JobId),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Result of resolving a job after a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Now `sent`.
    Sent,
    /// Back to `pending` for the next poll.
    Retrying { attempts: u32 },
    /// Retry ceiling reached; now `failed`.
    Failed { attempts: u32 },
    /// The job was already terminal; nothing changed.
    AlreadyTerminal(JobStatus),
}

/// Claims and resolves jobs on behalf of one worker.
pub struct JobLeaseManager {
    locks: LockCoordinator,
    jobs: Arc<dyn JobRepository>,
    clock: Arc<dyn Clock>,
    worker_id: WorkerId,
    settings: LeaseSettings,
}

impl JobLeaseManager {
    pub fn new(
        locks: LockCoordinator,
        jobs: Arc<dyn JobRepository>,
        clock: Arc<dyn Clock>,
        worker_id: WorkerId,
        settings: LeaseSettings,
    ) -> Self {
        info!(worker_id = %worker_id, "job lease manager initialized");
        Self {
            locks,
            jobs,
            clock,
            worker_id,
            settings,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn settings(&self) -> &LeaseSettings {
        &self.settings
    }

    pub fn locks(&self) -> &LockCoordinator {
        &self.locks
    }

    /// Point read of one job.
    pub async fn job(&self, job_id: &JobId) -> Result<Option<EmailJob>, LeaseError> {
        Ok(self.jobs.get(job_id).await?)
    }

    /// Up to `limit` claimable jobs, earliest due first, FIFO among equals.
    ///
    /// Jobs freshly held by other workers are excluded; stale ones are not.
    pub async fn get_available_jobs(&self, limit: usize) -> Result<Vec<EmailJob>, LeaseError> {
        let now = self.clock.now();
        let query = AvailableJobsQuery {
            now,
            stale_before: self.settings.stale_before(now),
            max_attempts: self.settings.max_attempts,
            limit,
        };
        Ok(self.jobs.find_available(&query).await?)
    }

    /// `get_available_jobs` with the configured batch size.
    pub async fn get_available_batch(&self) -> Result<Vec<EmailJob>, LeaseError> {
        self.get_available_jobs(self.settings.batch_size).await
    }

    /// Try to claim one job for this worker. `Ok(false)` means another worker has it.
    #[instrument(skip(self), fields(worker_id = %self.worker_id), err)]
    pub async fn acquire_job_lock(&self, job_id: &JobId) -> Result<bool, LeaseError> {
        let key = LockKey::job(job_id);
        if !self.locks.acquire(&key, &self.worker_id, self.settings.lock_ttl).await {
            debug!("job lock held elsewhere or lease store unavailable");
            return Ok(false);
        }

        let now = self.clock.now();
        let filter = JobFilter::unlocked_or_stale(self.settings.stale_before(now))
            .with_statuses(&JobStatus::ACTIVE)
            .with_due_by(now);
        let patch = JobPatch::lock(JobLock::new(self.worker_id.clone(), now));

        match self.jobs.update_where(job_id, &filter, &patch).await {
            Ok(0) => {
                self.locks.release(&key, &self.worker_id).await;
                debug!("durable hand-off lost; job lock released");
                Ok(false)
            }
            Ok(_) => {
                debug!("job claimed");
                Ok(true)
            }
            Err(e) => {
                self.locks.release(&key, &self.worker_id).await;
                warn!(error = %e, "durable hand-off failed; job lock released");
                Err(e.into())
            }
        }
    }

    /// Drop this worker's claim: ephemeral lock first, then the durable stamp
    /// where it still names this worker.
    #[instrument(skip(self), fields(worker_id = %self.worker_id), err)]
    pub async fn release_job_lock(&self, job_id: &JobId) -> Result<(), LeaseError> {
        self.locks.release(&LockKey::job(job_id), &self.worker_id).await;
        self.jobs
            .update_where(job_id, &JobFilter::held_by(self.worker_id.clone()), &JobPatch::unlock())
            .await?;
        Ok(())
    }

    /// Heartbeat during a slow send. Re-arms the ephemeral TTL only; the durable
    /// row is untouched. `false` if this worker no longer owns the lock.
    pub async fn extend_job_lock(&self, job_id: &JobId) -> bool {
        self.locks
            .extend(&LockKey::job(job_id), &self.worker_id, self.settings.lock_ttl)
            .await
    }

    /// Move a claimed job to `processing`. `false` if the job is terminal or no
    /// longer stamped with this worker.
    #[instrument(skip(self), fields(worker_id = %self.worker_id), err)]
    pub async fn mark_job_processing(&self, job_id: &JobId) -> Result<bool, LeaseError> {
        let filter = JobFilter::held_by(self.worker_id.clone()).with_statuses(&JobStatus::ACTIVE);
        let patch = JobPatch {
            status: Some(JobStatus::Processing),
            ..JobPatch::default()
        };
        Ok(self.jobs.update_where(job_id, &filter, &patch).await? == 1)
    }

    /// Resolve a successful send. Terminal jobs are left untouched.
    #[instrument(skip(self), err)]
    pub async fn mark_job_sent(&self, job_id: &JobId) -> Result<Resolution, LeaseError> {
        let patch = JobPatch {
            status: Some(JobStatus::Sent),
            sent_at: Some(self.clock.now()),
            lock: LockUpdate::Clear,
            ..JobPatch::default()
        };
        let filter = JobFilter::any().with_statuses(&JobStatus::ACTIVE);

        if self.jobs.update_where(job_id, &filter, &patch).await? == 1 {
            info!("job sent");
            return Ok(Resolution::Sent);
        }
        self.terminal_or_conflict(job_id).await
    }

    /// Resolve a failed send: count the attempt and either requeue the job as
    /// `pending` or, at the retry ceiling, fail it for good.
    #[instrument(skip(self), err)]
    pub async fn mark_job_failed(&self, job_id: &JobId, error_message: &str) -> Result<Resolution, LeaseError> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| LeaseError::JobNotFound(job_id.clone()))?;
        if job.status.is_terminal() {
            return Ok(Resolution::AlreadyTerminal(job.status));
        }

        let attempts = job.attempts + 1;
        let status = JobStatus::after_failure(attempts, self.settings.max_attempts);
        let exhausted = status == JobStatus::Failed;
        let patch = JobPatch {
            status: Some(status),
            attempts: Some(attempts),
            lock: LockUpdate::Clear,
            failed_at: exhausted.then(|| self.clock.now()),
            error_message: exhausted.then(|| error_message.to_string()),
            ..JobPatch::default()
        };
        let filter = JobFilter::any()
            .with_statuses(&JobStatus::ACTIVE)
            .with_attempts(job.attempts);

        if self.jobs.update_where(job_id, &filter, &patch).await? == 0 {
            return self.terminal_or_conflict(job_id).await;
        }

        if exhausted {
            warn!(attempts, error = error_message, "job failed permanently");
            Ok(Resolution::Failed { attempts })
        } else {
            info!(attempts, error = error_message, "job send failed; will retry");
            Ok(Resolution::Retrying { attempts })
        }
    }

    async fn terminal_or_conflict(&self, job_id: &JobId) -> Result<Resolution, LeaseError> {
        match self.jobs.get(job_id).await? {
            None => Err(LeaseError::JobNotFound(job_id.clone())),
            Some(job) if job.status.is_terminal() => {
                debug!(status = %job.status, "job already terminal; resolution skipped");
                Ok(Resolution::AlreadyTerminal(job.status))
            }
            Some(_) => Err(LeaseError::Conflict(job_id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mailrelay_core::ManualClock;

    use super::*;
    use crate::jobs::repository::InMemoryJobRepository;
    use crate::lease_store::{InMemoryLeaseStore, LeaseStore};

    struct Harness {
        clock: ManualClock,
        leases: Arc<InMemoryLeaseStore>,
        jobs: Arc<InMemoryJobRepository>,
    }

    impl Harness {
        fn new() -> Self {
            let clock = ManualClock::starting_now();
            Self {
                leases: Arc::new(InMemoryLeaseStore::with_clock(Arc::new(clock.clone()))),
                jobs: InMemoryJobRepository::arc(),
                clock,
            }
        }

        fn manager(&self, worker: &str) -> JobLeaseManager {
            JobLeaseManager::new(
                LockCoordinator::new(self.leases.clone()),
                self.jobs.clone(),
                Arc::new(self.clock.clone()),
                WorkerId::from_token(worker),
                LeaseSettings::default(),
            )
        }

        async fn pending(&self, id: &str) -> JobId {
            let id = JobId::from(id);
            let job = EmailJob::pending(id.clone(), "a@example.com", serde_json::json!({}), self.clock.now());
            self.jobs.insert(job).await.unwrap();
            id
        }

        async fn load(&self, id: &JobId) -> EmailJob {
            self.jobs.get(id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn two_workers_race_for_one_job() {
        let h = Harness::new();
        let id = h.pending("J1").await;
        let a = h.manager("worker-a");
        let b = h.manager("worker-b");

        let (ra, rb) = tokio::join!(a.acquire_job_lock(&id), b.acquire_job_lock(&id));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        assert!(ra ^ rb);
        let winner = if ra { &a } else { &b };
        assert_eq!(h.load(&id).await.locked_by(), Some(winner.worker_id()));
    }

    #[tokio::test]
    async fn many_concurrent_claimers_yield_one_winner() {
        let h = Harness::new();
        let id = h.pending("J1").await;
        let managers: Vec<_> = (0..8).map(|i| Arc::new(h.manager(&format!("worker-{i}")))).collect();

        let mut tasks = Vec::new();
        for m in &managers {
            let m = m.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move { m.acquire_job_lock(&id).await.unwrap() }));
        }
        let mut wins = 0;
        for t in tasks {
            if t.await.unwrap() {
                wins += 1;
            }
        }

        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn claimed_job_leaves_the_available_batch() {
        let h = Harness::new();
        let id = h.pending("J1").await;
        h.pending("J2").await;
        let a = h.manager("worker-a");

        assert!(a.acquire_job_lock(&id).await.unwrap());

        let batch = a.get_available_jobs(50).await.unwrap();
        let ids: Vec<_> = batch.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, ["J2"]);
    }

    #[tokio::test]
    async fn durable_race_loss_releases_ephemeral_lock() {
        let h = Harness::new();
        let id = h.pending("J1").await;
        let a = h.manager("worker-a");
        let b = h.manager("worker-b");

        // a holds the durable stamp, but its ephemeral lock was lost.
        assert!(a.acquire_job_lock(&id).await.unwrap());
        assert!(h.leases.delete_if_equals("email-job-lock:J1", "worker-a").await.unwrap());

        assert!(!b.acquire_job_lock(&id).await.unwrap());
        assert!(h.leases.value_of("email-job-lock:J1").is_none());
        assert_eq!(h.load(&id).await.locked_by(), Some(a.worker_id()));
    }

    #[tokio::test]
    async fn repository_failure_during_hand_off_releases_and_propagates() {
        let h = Harness::new();
        let id = h.pending("J1").await;
        let a = h.manager("worker-a");
        h.jobs.set_available(false);

        let err = a.acquire_job_lock(&id).await.unwrap_err();

        assert!(matches!(err, LeaseError::Repository(RepositoryError::Unavailable(_))));
        assert!(h.leases.value_of("email-job-lock:J1").is_none());
    }

    #[tokio::test]
    async fn lease_store_outage_means_no_claims() {
        let h = Harness::new();
        let id = h.pending("J1").await;
        let a = h.manager("worker-a");
        h.leases.set_available(false);

        assert!(!a.acquire_job_lock(&id).await.unwrap());
        assert!(h.load(&id).await.is_unlocked());
        assert!(!a.extend_job_lock(&id).await);
    }

    #[tokio::test]
    async fn crashed_worker_job_is_reclaimed_after_staleness() {
        let h = Harness::new();
        let id = h.pending("J1").await;
        let crashed = h.manager("worker-a");
        let rescuer = h.manager("worker-b");

        assert!(crashed.acquire_job_lock(&id).await.unwrap());
        assert!(crashed.mark_job_processing(&id).await.unwrap());

        assert!(rescuer.get_available_jobs(50).await.unwrap().is_empty());
        assert!(!rescuer.acquire_job_lock(&id).await.unwrap());

        h.clock.advance(chrono::Duration::seconds(301));

        let batch = rescuer.get_available_jobs(50).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].status, JobStatus::Processing);
        assert!(rescuer.acquire_job_lock(&id).await.unwrap());
        assert_eq!(h.load(&id).await.locked_by(), Some(rescuer.worker_id()));
    }

    #[tokio::test]
    async fn late_release_does_not_clobber_new_owner() {
        let h = Harness::new();
        let id = h.pending("J1").await;
        let a = h.manager("worker-a");
        let b = h.manager("worker-b");

        assert!(a.acquire_job_lock(&id).await.unwrap());
        h.clock.advance(chrono::Duration::seconds(301));
        assert!(b.acquire_job_lock(&id).await.unwrap());

        a.release_job_lock(&id).await.unwrap();
        assert!(!a.extend_job_lock(&id).await);

        assert_eq!(h.leases.value_of("email-job-lock:J1").as_deref(), Some("worker-b"));
        assert_eq!(h.load(&id).await.locked_by(), Some(b.worker_id()));
    }

    #[tokio::test]
    async fn release_clears_own_claim() {
        let h = Harness::new();
        let id = h.pending("J1").await;
        let a = h.manager("worker-a");

        assert!(a.acquire_job_lock(&id).await.unwrap());
        a.release_job_lock(&id).await.unwrap();

        assert!(h.load(&id).await.is_unlocked());
        assert!(h.leases.value_of("email-job-lock:J1").is_none());
    }

    #[tokio::test]
    async fn extend_keeps_slow_send_locked() {
        let h = Harness::new();
        let id = h.pending("J1").await;
        let a = h.manager("worker-a");
        let b = h.manager("worker-b");

        assert!(a.acquire_job_lock(&id).await.unwrap());
        h.clock.advance(chrono::Duration::seconds(250));
        assert!(a.extend_job_lock(&id).await);
        h.clock.advance(chrono::Duration::seconds(250));

        // Durable stamp is stale but the ephemeral lock still belongs to a.
        assert!(!b.acquire_job_lock(&id).await.unwrap());
        assert_eq!(h.leases.value_of("email-job-lock:J1").as_deref(), Some("worker-a"));
    }

    #[tokio::test]
    async fn scheduled_job_becomes_available_when_due() {
        let h = Harness::new();
        let id = JobId::from("J1");
        let due = h.clock.now() + chrono::Duration::hours(1);
        let job = EmailJob::scheduled(id.clone(), "a@example.com", serde_json::json!({}), due, h.clock.now());
        h.jobs.insert(job).await.unwrap();
        let a = h.manager("worker-a");

        assert!(a.get_available_jobs(50).await.unwrap().is_empty());

        h.clock.advance(chrono::Duration::hours(1));

        let batch = a.get_available_jobs(50).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);
        assert_eq!(batch[0].attempts, 0);
    }

    #[tokio::test]
    async fn future_scheduled_job_cannot_be_claimed_directly() {
        let h = Harness::new();
        let id = JobId::from("LATER");
        let due = h.clock.now() + chrono::Duration::hours(1);
        let job = EmailJob::scheduled(id.clone(), "a@example.com", serde_json::json!({}), due, h.clock.now());
        h.jobs.insert(job).await.unwrap();
        let a = h.manager("worker-a");

        assert!(!a.acquire_job_lock(&id).await.unwrap());
        let job = h.load(&id).await;
        assert_eq!(job.status, JobStatus::Scheduled);
        assert!(job.is_unlocked());
        assert!(h.leases.value_of("email-job-lock:LATER").is_none());

        h.clock.advance(chrono::Duration::hours(1));
        assert!(a.acquire_job_lock(&id).await.unwrap());
    }

    #[tokio::test]
    async fn fail_at_last_attempt_is_terminal() {
        let h = Harness::new();
        let id = h.pending("J1").await;
        h.jobs
            .update(
                &id,
                &JobPatch {
                    attempts: Some(2),
                    ..JobPatch::default()
                },
            )
            .await
            .unwrap();
        let a = h.manager("worker-a");

        let resolution = a.mark_job_failed(&id, "timeout").await.unwrap();

        assert_eq!(resolution, Resolution::Failed { attempts: 3 });
        let job = h.load(&id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.error_message.as_deref(), Some("timeout"));
        assert!(job.failed_at.is_some());
        assert!(job.is_unlocked());
    }

    #[tokio::test]
    async fn retry_ceiling_after_repeated_failures() {
        let h = Harness::new();
        let id = h.pending("J1").await;
        let a = h.manager("worker-a");

        for expected in 1..=3 {
            assert!(a.acquire_job_lock(&id).await.unwrap());
            assert!(a.mark_job_processing(&id).await.unwrap());
            let resolution = a.mark_job_failed(&id, "smtp 451").await.unwrap();
            a.release_job_lock(&id).await.unwrap();

            if expected < 3 {
                assert_eq!(resolution, Resolution::Retrying { attempts: expected });
                let job = h.load(&id).await;
                assert_eq!(job.status, JobStatus::Pending);
                assert!(job.error_message.is_none());
            } else {
                assert_eq!(resolution, Resolution::Failed { attempts: 3 });
            }
        }

        let job = h.load(&id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert!(job.validate(3).is_ok());

        h.clock.advance(chrono::Duration::hours(1));
        assert!(a.get_available_jobs(50).await.unwrap().is_empty());
        assert!(!a.acquire_job_lock(&id).await.unwrap());
    }

    #[tokio::test]
    async fn sent_clears_lock_and_is_idempotent() {
        let h = Harness::new();
        let id = h.pending("J1").await;
        let a = h.manager("worker-a");

        assert!(a.acquire_job_lock(&id).await.unwrap());
        assert_eq!(a.mark_job_sent(&id).await.unwrap(), Resolution::Sent);
        let first = h.load(&id).await;
        assert_eq!(first.status, JobStatus::Sent);
        assert!(first.is_unlocked());

        h.clock.advance(chrono::Duration::minutes(1));
        assert_eq!(
            a.mark_job_sent(&id).await.unwrap(),
            Resolution::AlreadyTerminal(JobStatus::Sent)
        );
        assert_eq!(
            a.mark_job_failed(&id, "late failure").await.unwrap(),
            Resolution::AlreadyTerminal(JobStatus::Sent)
        );
        assert_eq!(h.load(&id).await, first);
    }

    #[tokio::test]
    async fn failed_job_resolution_is_idempotent() {
        let h = Harness::new();
        let id = h.pending("J1").await;
        let a = JobLeaseManager::new(
            LockCoordinator::new(h.leases.clone()),
            h.jobs.clone(),
            Arc::new(h.clock.clone()),
            WorkerId::from_token("worker-a"),
            LeaseSettings::default().with_max_attempts(1),
        );

        assert_eq!(a.mark_job_failed(&id, "boom").await.unwrap(), Resolution::Failed { attempts: 1 });
        let failed = h.load(&id).await;

        assert_eq!(
            a.mark_job_failed(&id, "again").await.unwrap(),
            Resolution::AlreadyTerminal(JobStatus::Failed)
        );
        assert_eq!(
            a.mark_job_sent(&id).await.unwrap(),
            Resolution::AlreadyTerminal(JobStatus::Failed)
        );
        assert!(!a.mark_job_processing(&id).await.unwrap());
        assert_eq!(h.load(&id).await, failed);
    }

    #[tokio::test]
    async fn resolving_unknown_job_errors() {
        let h = Harness::new();
        let a = h.manager("worker-a");
        let missing = JobId::from("missing");

        assert!(matches!(a.mark_job_sent(&missing).await, Err(LeaseError::JobNotFound(_))));
        assert!(matches!(
            a.mark_job_failed(&missing, "x").await,
            Err(LeaseError::JobNotFound(_))
        ));
        assert!(!a.acquire_job_lock(&missing).await.unwrap());
    }

    #[tokio::test]
    async fn custom_settings_change_ttl_and_batch() {
        let h = Harness::new();
        for i in 0..5 {
            h.pending(&format!("J{i}")).await;
        }
        let a = JobLeaseManager::new(
            LockCoordinator::new(h.leases.clone()),
            h.jobs.clone(),
            Arc::new(h.clock.clone()),
            WorkerId::from_token("worker-a"),
            LeaseSettings::default()
                .with_batch_size(2)
                .with_lock_ttl(Duration::from_secs(30)),
        );

        assert_eq!(a.get_available_batch().await.unwrap().len(), 2);

        let id = JobId::from("J0");
        assert!(a.acquire_job_lock(&id).await.unwrap());
        h.clock.advance(chrono::Duration::seconds(31));
        assert!(h.leases.value_of("email-job-lock:J0").is_none());
    }
}
