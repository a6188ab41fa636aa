//! Durable job table abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mailrelay_core::{AvailableJobsQuery, EmailJob, JobId, JobLock, JobStatus, WorkerId};

/// Job repository error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("repository unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt job row: {0}")]
    Corrupt(String),
}

/// Condition on the durable lock columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockCondition {
    /// No condition.
    Any,
    /// `locked_by IS NULL OR locked_at < stale_before`
    UnlockedOrStale { stale_before: DateTime<Utc> },
    /// `locked_by = owner`
    HeldBy(WorkerId),
}

/// WHERE clause of a conditional update (the row id is always part of it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    pub lock: LockCondition,
    /// `status IN (..)`; `None` means any status.
    pub statuses: Option<Vec<JobStatus>>,
    /// `attempts = n`, guarding read-modify-write of the attempt counter.
    pub attempts: Option<u32>,
    /// `scheduled_for IS NULL OR scheduled_for <= t`
    pub due_by: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn any() -> Self {
        Self {
            lock: LockCondition::Any,
            statuses: None,
            attempts: None,
            due_by: None,
        }
    }

    pub fn unlocked_or_stale(stale_before: DateTime<Utc>) -> Self {
        Self {
            lock: LockCondition::UnlockedOrStale { stale_before },
            ..Self::any()
        }
    }

    pub fn held_by(owner: WorkerId) -> Self {
        Self {
            lock: LockCondition::HeldBy(owner),
            ..Self::any()
        }
    }

    pub fn with_statuses(mut self, statuses: &[JobStatus]) -> Self {
        self.statuses = Some(statuses.to_vec());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_due_by(mut self, now: DateTime<Utc>) -> Self {
        self.due_by = Some(now);
        self
    }

    pub fn matches(&self, job: &EmailJob) -> bool {
        let lock_ok = match &self.lock {
            LockCondition::Any => true,
            LockCondition::UnlockedOrStale { stale_before } => {
                job.is_unlocked() || job.has_stale_lock(*stale_before)
            }
            LockCondition::HeldBy(owner) => job.locked_by() == Some(owner),
        };
        let status_ok = self
            .statuses
            .as_ref()
            .is_none_or(|statuses| statuses.contains(&job.status));
        let attempts_ok = self.attempts.is_none_or(|n| job.attempts == n);
        let due_ok = self.due_by.is_none_or(|now| job.is_due(now));

        lock_ok && status_ok && attempts_ok && due_ok
    }
}

/// What to do with the lock columns in an update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LockUpdate {
    #[default]
    Keep,
    Set(JobLock),
    Clear,
}

/// SET clause of an update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub attempts: Option<u32>,
    pub lock: LockUpdate,
    pub sent_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl JobPatch {
    pub fn lock(lock: JobLock) -> Self {
        Self {
            lock: LockUpdate::Set(lock),
            ..Self::default()
        }
    }

    pub fn unlock() -> Self {
        Self {
            lock: LockUpdate::Clear,
            ..Self::default()
        }
    }

    pub fn apply(&self, job: &mut EmailJob) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(attempts) = self.attempts {
            job.attempts = attempts;
        }
        match &self.lock {
            LockUpdate::Keep => {}
            LockUpdate::Set(lock) => job.lock = Some(lock.clone()),
            LockUpdate::Clear => job.lock = None,
        }
        if let Some(at) = self.sent_at {
            job.sent_at = Some(at);
        }
        if let Some(at) = self.failed_at {
            job.failed_at = Some(at);
        }
        if let Some(msg) = &self.error_message {
            job.error_message = Some(msg.clone());
        }
    }
}

/// Durable job table.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a new job.
    async fn insert(&self, job: EmailJob) -> Result<(), RepositoryError>;

    /// Point read.
    async fn get(&self, id: &JobId) -> Result<Option<EmailJob>, RepositoryError>;

    /// Eligible jobs for one claim batch, in claim order, at most `query.limit`.
    async fn find_available(&self, query: &AvailableJobsQuery) -> Result<Vec<EmailJob>, RepositoryError>;

    /// Point write. Fails with `NotFound` if the row does not exist.
    async fn update(&self, id: &JobId, patch: &JobPatch) -> Result<(), RepositoryError>;

    /// Conditional update; returns the number of rows changed (0 or 1).
    async fn update_where(&self, id: &JobId, filter: &JobFilter, patch: &JobPatch) -> Result<u64, RepositoryError>;
}

/// In-memory job table for tests/dev.
///
/// `set_available(false)` makes every call fail with `Unavailable`.
#[derive(Debug)]
pub struct InMemoryJobRepository {
    jobs: RwLock<HashMap<JobId, EmailJob>>,
    available: AtomicBool,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), RepositoryError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RepositoryError::Unavailable("in-memory repository switched off".to_string()))
        }
    }
}

impl Default for InMemoryJobRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn insert(&self, job: EmailJob) -> Result<(), RepositoryError> {
        self.check_available()?;
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if jobs.contains_key(&job.id) {
            return Err(RepositoryError::AlreadyExists(job.id));
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<EmailJob>, RepositoryError> {
        self.check_available()?;
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        Ok(jobs.get(id).cloned())
    }

    async fn find_available(&self, query: &AvailableJobsQuery) -> Result<Vec<EmailJob>, RepositoryError> {
        self.check_available()?;
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let mut result: Vec<_> = jobs.values().filter(|j| query.matches(j)).cloned().collect();

        result.sort_by(AvailableJobsQuery::order);
        result.truncate(query.limit);
        Ok(result)
    }

    async fn update(&self, id: &JobId, patch: &JobPatch) -> Result<(), RepositoryError> {
        self.check_available()?;
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let job = jobs.get_mut(id).ok_or_else(|| RepositoryError::NotFound(id.clone()))?;
        patch.apply(job);
        Ok(())
    }

    async fn update_where(&self, id: &JobId, filter: &JobFilter, patch: &JobPatch) -> Result<u64, RepositoryError> {
        self.check_available()?;
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        match jobs.get_mut(id) {
            Some(job) if filter.matches(job) => {
                patch.apply(job);
                Ok(1)
            }
            _ => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn pending(id: &str, created_at: DateTime<Utc>) -> EmailJob {
        EmailJob::pending(JobId::from(id), "a@example.com", serde_json::json!({}), created_at)
    }

    #[tokio::test]
    async fn insert_rejects_duplicates() {
        let repo = InMemoryJobRepository::new();
        let now = Utc::now();

        repo.insert(pending("J1", now)).await.unwrap();
        assert!(matches!(
            repo.insert(pending("J1", now)).await,
            Err(RepositoryError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn conditional_update_counts_rows() {
        let repo = InMemoryJobRepository::new();
        let now = Utc::now();
        let id = JobId::from("J1");
        repo.insert(pending("J1", now)).await.unwrap();

        let a = WorkerId::from_token("worker-a");
        let b = WorkerId::from_token("worker-b");
        let stale_before = now - Duration::minutes(5);

        let claimed = repo
            .update_where(&id, &JobFilter::unlocked_or_stale(stale_before), &JobPatch::lock(JobLock::new(a.clone(), now)))
            .await
            .unwrap();
        assert_eq!(claimed, 1);

        let lost = repo
            .update_where(&id, &JobFilter::unlocked_or_stale(stale_before), &JobPatch::lock(JobLock::new(b.clone(), now)))
            .await
            .unwrap();
        assert_eq!(lost, 0);

        let not_owner = repo
            .update_where(&id, &JobFilter::held_by(b), &JobPatch::unlock())
            .await
            .unwrap();
        assert_eq!(not_owner, 0);
        assert_eq!(repo.get(&id).await.unwrap().unwrap().locked_by(), Some(&a));
    }

    #[tokio::test]
    async fn status_and_attempt_guards() {
        let repo = InMemoryJobRepository::new();
        let id = JobId::from("J1");
        repo.insert(pending("J1", Utc::now())).await.unwrap();

        let patch = JobPatch {
            attempts: Some(1),
            ..JobPatch::default()
        };
        let wrong_status = JobFilter::any().with_statuses(&[JobStatus::Sent]);
        assert_eq!(repo.update_where(&id, &wrong_status, &patch).await.unwrap(), 0);

        let wrong_attempts = JobFilter::any().with_attempts(2);
        assert_eq!(repo.update_where(&id, &wrong_attempts, &patch).await.unwrap(), 0);

        let ok = JobFilter::any().with_statuses(&JobStatus::ACTIVE).with_attempts(0);
        assert_eq!(repo.update_where(&id, &ok, &patch).await.unwrap(), 1);
        assert_eq!(repo.get(&id).await.unwrap().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn due_guard_skips_future_scheduled_rows() {
        let repo = InMemoryJobRepository::new();
        let now = Utc::now();
        let id = JobId::from("LATER");
        let job = EmailJob::scheduled(id.clone(), "a@example.com", serde_json::json!({}), now + Duration::hours(1), now);
        repo.insert(job).await.unwrap();

        let lock = JobPatch::lock(JobLock::new(WorkerId::from_token("worker-a"), now));
        let not_yet = JobFilter::any().with_due_by(now);
        assert_eq!(repo.update_where(&id, &not_yet, &lock).await.unwrap(), 0);

        let later = JobFilter::any().with_due_by(now + Duration::hours(1));
        assert_eq!(repo.update_where(&id, &later, &lock).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn point_update_of_missing_row_fails() {
        let repo = InMemoryJobRepository::new();
        assert!(matches!(
            repo.update(&JobId::from("nope"), &JobPatch::unlock()).await,
            Err(RepositoryError::NotFound(_))
        ));
        assert_eq!(
            repo.update_where(&JobId::from("nope"), &JobFilter::any(), &JobPatch::unlock())
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn find_available_orders_and_limits() {
        let repo = InMemoryJobRepository::new();
        let now = Utc::now();
        for (i, id) in ["J1", "J2", "J3"].iter().enumerate() {
            repo.insert(pending(id, now + Duration::seconds(i as i64))).await.unwrap();
        }

        let query = AvailableJobsQuery {
            now: now + Duration::minutes(1),
            stale_before: now - Duration::minutes(4),
            max_attempts: 3,
            limit: 2,
        };
        let jobs = repo.find_available(&query).await.unwrap();
        let ids: Vec<_> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, ["J1", "J2"]);
    }
}
