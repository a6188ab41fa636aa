//! `mailrelay-core`: domain building blocks for leased email jobs.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod settings;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{AvailableJobsQuery, EmailJob, JobLock, JobStatus};
pub use settings::LeaseSettings;
pub use worker::WorkerId;
