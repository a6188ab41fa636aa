//! Postgres-backed job repository.
//!
//! ## Error Mapping
//!
//! | SQLx Error | RepositoryError | Scenario |
//! |------------|-----------------|----------|
//! | Database `23505` on insert | `AlreadyExists` | duplicate job id |
//! | Io / PoolTimedOut / PoolClosed | `Unavailable` | database unreachable |
//! | Database (other), Protocol, etc. | `Storage` | everything else |
//!
//! Conditional updates are a single `UPDATE ... WHERE` statement, so the
//! lock hand-off is decided by the database row lock and `rows_affected()`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use mailrelay_core::{AvailableJobsQuery, EmailJob, JobId, JobLock, JobStatus, WorkerId};

use super::repository::{JobFilter, JobPatch, JobRepository, LockCondition, LockUpdate, RepositoryError};

const SCHEMA: &str = include_str!("../../migrations/0001_email_jobs.sql");

const JOB_COLUMNS: &str = r#"
    id,
    status,
    recipient,
    payload,
    scheduled_for,
    attempts,
    locked_by,
    locked_at,
    sent_at,
    failed_at,
    error_message,
    created_at
"#;

/// Postgres job table.
#[derive(Debug, Clone)]
pub struct PostgresJobRepository {
    pool: Arc<PgPool>,
}

impl PostgresJobRepository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `email_jobs` table and its indexes if missing.
    pub async fn migrate(&self) -> Result<(), RepositoryError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn execute_update(&self, id: &JobId, filter: &JobFilter, patch: &JobPatch) -> Result<u64, RepositoryError> {
        let (lock_mode, lock_owner, lock_at) = match &patch.lock {
            LockUpdate::Keep => ("keep", None, None),
            LockUpdate::Set(lock) => ("set", Some(lock.locked_by.as_str().to_string()), Some(lock.locked_at)),
            LockUpdate::Clear => ("clear", None, None),
        };
        let (cond_mode, stale_before, held_by) = match &filter.lock {
            LockCondition::Any => ("any", None, None),
            LockCondition::UnlockedOrStale { stale_before } => ("unlocked_or_stale", Some(*stale_before), None),
            LockCondition::HeldBy(owner) => ("held_by", None, Some(owner.as_str().to_string())),
        };
        let statuses: Option<Vec<String>> = filter
            .statuses
            .as_ref()
            .map(|s| s.iter().map(|st| st.as_str().to_string()).collect());

        let result = sqlx::query(
            r#"
            UPDATE email_jobs SET
                status = COALESCE($2::text, status),
                attempts = COALESCE($3::int4, attempts),
                locked_by = CASE $4::text WHEN 'set' THEN $5::text WHEN 'clear' THEN NULL ELSE locked_by END,
                locked_at = CASE $4::text WHEN 'set' THEN $6::timestamptz WHEN 'clear' THEN NULL ELSE locked_at END,
                sent_at = COALESCE($7::timestamptz, sent_at),
                failed_at = COALESCE($8::timestamptz, failed_at),
                error_message = COALESCE($9::text, error_message)
            WHERE id = $1
                AND ($10::text[] IS NULL OR status = ANY($10::text[]))
                AND ($11::int4 IS NULL OR attempts = $11::int4)
                AND ($15::timestamptz IS NULL OR scheduled_for IS NULL OR scheduled_for <= $15::timestamptz)
                AND (
                    $12::text = 'any'
                    OR ($12::text = 'unlocked_or_stale' AND (locked_by IS NULL OR locked_at < $13::timestamptz))
                    OR ($12::text = 'held_by' AND locked_by = $14::text)
                )
            "#,
        )
        .bind(id.as_str())
        .bind(patch.status.map(JobStatus::as_str))
        .bind(patch.attempts.map(to_db_attempts))
        .bind(lock_mode)
        .bind(lock_owner)
        .bind(lock_at)
        .bind(patch.sent_at)
        .bind(patch.failed_at)
        .bind(patch.error_message.as_deref())
        .bind(statuses)
        .bind(filter.attempts.map(to_db_attempts))
        .bind(cond_mode)
        .bind(stale_before)
        .bind(held_by)
        .bind(filter.due_by)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_where", e))?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl JobRepository for PostgresJobRepository {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn insert(&self, job: EmailJob) -> Result<(), RepositoryError> {
        let (locked_by, locked_at) = match &job.lock {
            Some(lock) => (Some(lock.locked_by.as_str().to_string()), Some(lock.locked_at)),
            None => (None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO email_jobs (
                id, status, recipient, payload, scheduled_for, attempts,
                locked_by, locked_at, sent_at, failed_at, error_message, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(job.id.as_str())
        .bind(job.status.as_str())
        .bind(&job.recipient)
        .bind(&job.payload)
        .bind(job.scheduled_for)
        .bind(to_db_attempts(job.attempts))
        .bind(locked_by)
        .bind(locked_at)
        .bind(job.sent_at)
        .bind(job.failed_at)
        .bind(job.error_message.as_deref())
        .bind(job.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::AlreadyExists(job.id.clone())
            } else {
                map_sqlx_error("insert", e)
            }
        })?;

        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: &JobId) -> Result<Option<EmailJob>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM email_jobs WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(skip(self, query), fields(limit = query.limit), err)]
    async fn find_available(&self, query: &AvailableJobsQuery) -> Result<Vec<EmailJob>, RepositoryError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM email_jobs
            WHERE attempts < $1
                AND (scheduled_for IS NULL OR scheduled_for <= $2)
                AND (
                    (status = 'pending' AND locked_by IS NULL)
                    OR (status = 'scheduled' AND scheduled_for <= $2 AND (locked_by IS NULL OR locked_at < $3))
                    OR (status IN ('pending', 'scheduled', 'processing') AND locked_at < $3)
                )
            ORDER BY scheduled_for ASC NULLS LAST, created_at ASC
            LIMIT $4
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(to_db_attempts(query.max_attempts))
            .bind(query.now)
            .bind(query.stale_before)
            .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_available", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self, patch), fields(job_id = %id), err)]
    async fn update(&self, id: &JobId, patch: &JobPatch) -> Result<(), RepositoryError> {
        match self.execute_update(id, &JobFilter::any(), patch).await? {
            0 => Err(RepositoryError::NotFound(id.clone())),
            _ => Ok(()),
        }
    }

    #[instrument(skip(self, filter, patch), fields(job_id = %id), err)]
    async fn update_where(&self, id: &JobId, filter: &JobFilter, patch: &JobPatch) -> Result<u64, RepositoryError> {
        self.execute_update(id, filter, patch).await
    }
}

fn to_db_attempts(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<EmailJob, RepositoryError> {
    let corrupt = |e: sqlx::Error| RepositoryError::Corrupt(e.to_string());

    let id: String = row.try_get("id").map_err(corrupt)?;
    let status: String = row.try_get("status").map_err(corrupt)?;
    let attempts: i32 = row.try_get("attempts").map_err(corrupt)?;
    let locked_by: Option<String> = row.try_get("locked_by").map_err(corrupt)?;
    let locked_at: Option<DateTime<Utc>> = row.try_get("locked_at").map_err(corrupt)?;

    let lock = match (locked_by, locked_at) {
        (Some(owner), Some(at)) => Some(JobLock::new(WorkerId::from_token(owner), at)),
        (None, None) => None,
        _ => {
            return Err(RepositoryError::Corrupt(format!(
                "job {id}: locked_by and locked_at must be set together"
            )));
        }
    };

    Ok(EmailJob {
        status: status
            .parse()
            .map_err(|e: mailrelay_core::DomainError| RepositoryError::Corrupt(format!("job {id}: {e}")))?,
        recipient: row.try_get("recipient").map_err(corrupt)?,
        payload: row.try_get("payload").map_err(corrupt)?,
        scheduled_for: row.try_get("scheduled_for").map_err(corrupt)?,
        attempts: u32::try_from(attempts)
            .map_err(|_| RepositoryError::Corrupt(format!("job {id}: negative attempts {attempts}")))?,
        lock,
        sent_at: row.try_get("sent_at").map_err(corrupt)?,
        failed_at: row.try_get("failed_at").map_err(corrupt)?,
        error_message: row.try_get("error_message").map_err(corrupt)?,
        created_at: row.try_get("created_at").map_err(corrupt)?,
        id: JobId::from(id),
    })
}

/// Map SQLx errors to `RepositoryError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Io(e) => RepositoryError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::PoolTimedOut => RepositoryError::Unavailable(format!("pool timed out in {operation}")),
        sqlx::Error::PoolClosed => RepositoryError::Unavailable(format!("connection pool closed in {operation}")),
        sqlx::Error::Database(db_err) => {
            RepositoryError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        other => RepositoryError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        db_err.code().as_deref() == Some("23505")
    } else {
        false
    }
}
