//! Leased email jobs.
//!
//! ## Components
//!
//! - `JobRepository`: durable job table (in-memory or Postgres)
//! - `JobLeaseManager`: claim / resolve / reclaim jobs for one worker
//! - `JobDispatcher`: drives claimed jobs through a `Mailer`, once or on a poll loop

pub mod dispatcher;
pub mod lease_manager;
pub mod postgres;
pub mod repository;

pub use dispatcher::{
    DispatcherConfig, DispatcherHandle, DispatcherStats, DrainReport, JobDispatcher, JobOutcome, Mailer, SendError,
};
pub use lease_manager::{JobLeaseManager, LeaseError, Resolution};
pub use postgres::PostgresJobRepository;
pub use repository::{
    InMemoryJobRepository, JobFilter, JobPatch, JobRepository, LockCondition, LockUpdate, RepositoryError,
};
