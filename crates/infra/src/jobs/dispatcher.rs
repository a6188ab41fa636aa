//! Job dispatcher: drives claim → processing → send → resolve → release.
//!
//! One `drain` is one poll cycle over the available batch. `spawn` runs drains
//! on a fixed interval until the handle is shut down.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use mailrelay_core::{EmailJob, JobId};

use super::lease_manager::{JobLeaseManager, LeaseError, Resolution};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Mail transport failure. The message is recorded on the job once it fails
/// for good.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct SendError(pub String);

impl SendError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Outbound mail transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, job: &EmailJob) -> Result<(), SendError>;
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name for logging
    pub name: String,
    /// Sleep between drain cycles of the background loop
    pub poll_interval: Duration,
    /// How often the lock is extended while a send is in flight
    pub heartbeat_interval: Duration,
    /// Jobs examined per drain cycle
    pub batch_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "email-dispatcher".to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            batch_size: mailrelay_core::settings::DEFAULT_BATCH_SIZE,
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// What happened to one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Sent,
    Retrying { attempts: u32 },
    Failed { attempts: u32 },
    /// Claimed by another worker, or already resolved.
    Skipped,
}

/// Tally of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DrainReport {
    pub examined: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl DrainReport {
    fn record(&mut self, outcome: &Result<JobOutcome, LeaseError>) {
        self.examined += 1;
        match outcome {
            Ok(JobOutcome::Sent) => self.sent += 1,
            Ok(JobOutcome::Retrying { .. }) => self.retried += 1,
            Ok(JobOutcome::Failed { .. }) => self.failed += 1,
            Ok(JobOutcome::Skipped) => self.skipped += 1,
            Err(_) => self.errors += 1,
        }
    }
}

/// Background loop runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DispatcherStats {
    pub cycles: u64,
    pub sent: u64,
    pub retried: u64,
    pub failed: u64,
    pub skipped: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}

impl DispatcherStats {
    fn absorb(&mut self, report: &DrainReport) {
        self.cycles += 1;
        self.sent += report.sent as u64;
        self.retried += report.retried as u64;
        self.failed += report.failed as u64;
        self.skipped += report.skipped as u64;
        self.errors += report.errors as u64;
    }
}

/// Handle to control a running dispatcher loop.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl DispatcherHandle {
    /// Request graceful shutdown and wait for the in-flight cycle to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "dispatcher task ended abnormally");
            }
        }
    }

    /// Get current dispatcher statistics.
    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Sends email jobs through a `Mailer` under the lease protocol.
pub struct JobDispatcher {
    leases: Arc<JobLeaseManager>,
    mailer: Arc<dyn Mailer>,
    config: DispatcherConfig,
}

impl JobDispatcher {
    pub fn new(leases: Arc<JobLeaseManager>, mailer: Arc<dyn Mailer>, config: DispatcherConfig) -> Self {
        Self { leases, mailer, config }
    }

    pub fn leases(&self) -> &JobLeaseManager {
        &self.leases
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Claim, send and resolve one job. The claim is always released afterwards.
    pub async fn process_job(&self, job_id: &JobId) -> Result<JobOutcome, LeaseError> {
        if !self.leases.acquire_job_lock(job_id).await? {
            debug!(job_id = %job_id, "job not claimed; skipping");
            return Ok(JobOutcome::Skipped);
        }

        let outcome = self.process_claimed(job_id).await;

        if let Err(e) = self.leases.release_job_lock(job_id).await {
            warn!(job_id = %job_id, error = %e, "failed to release job lock");
        }
        outcome
    }

    async fn process_claimed(&self, job_id: &JobId) -> Result<JobOutcome, LeaseError> {
        let job = self
            .leases
            .job(job_id)
            .await?
            .ok_or_else(|| LeaseError::JobNotFound(job_id.clone()))?;
        if !self.leases.mark_job_processing(job_id).await? {
            debug!(job_id = %job_id, "job resolved or reclaimed before send");
            return Ok(JobOutcome::Skipped);
        }

        let resolution = match self.send_with_heartbeat(&job).await {
            Ok(()) => self.leases.mark_job_sent(job_id).await?,
            Err(e) => self.leases.mark_job_failed(job_id, &e.0).await?,
        };

        Ok(match resolution {
            Resolution::Sent => JobOutcome::Sent,
            Resolution::Retrying { attempts } => JobOutcome::Retrying { attempts },
            Resolution::Failed { attempts } => JobOutcome::Failed { attempts },
            Resolution::AlreadyTerminal(_) => JobOutcome::Skipped,
        })
    }

    async fn send_with_heartbeat(&self, job: &EmailJob) -> Result<(), SendError> {
        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let send = self.mailer.send(job);
        tokio::pin!(send);

        loop {
            tokio::select! {
                result = &mut send => return result,
                _ = heartbeat.tick() => {
                    if !self.leases.extend_job_lock(&job.id).await {
                        warn!(job_id = %job.id, "job lock lost during send");
                    }
                }
            }
        }
    }

    /// One poll cycle: process up to `limit` available jobs.
    ///
    /// Errors on individual jobs are logged and counted; only a failure to
    /// fetch the batch itself is returned.
    pub async fn drain(&self, limit: usize) -> Result<DrainReport, LeaseError> {
        let batch = self.leases.get_available_jobs(limit).await?;
        let mut report = DrainReport::default();

        for job in &batch {
            let outcome = self.process_job(&job.id).await;
            if let Err(e) = &outcome {
                error!(dispatcher = %self.config.name, job_id = %job.id, error = %e, "job processing failed");
            }
            report.record(&outcome);
        }

        if report.examined > 0 {
            info!(
                dispatcher = %self.config.name,
                examined = report.examined,
                sent = report.sent,
                retried = report.retried,
                failed = report.failed,
                skipped = report.skipped,
                errors = report.errors,
                "drain cycle finished"
            );
        }
        Ok(report)
    }

    /// `drain` with the configured batch size.
    pub async fn drain_batch(&self) -> Result<DrainReport, LeaseError> {
        self.drain(self.config.batch_size).await
    }

    /// Spawn the poll loop on the tokio runtime.
    pub fn spawn(self: Arc<Self>) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(DispatcherStats::default()));
        let stats_clone = stats.clone();

        let join = tokio::spawn(async move {
            self.run(shutdown_rx, stats_clone).await;
        });

        DispatcherHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }

    async fn run(&self, mut shutdown_rx: watch::Receiver<bool>, stats: Arc<Mutex<DispatcherStats>>) {
        info!(
            dispatcher = %self.config.name,
            worker_id = %self.leases.worker_id(),
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "job dispatcher started"
        );
        let start_time = Instant::now();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match self.drain_batch().await {
                Ok(report) => {
                    let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
                    s.absorb(&report);
                    s.uptime_secs = start_time.elapsed().as_secs();
                }
                Err(e) => {
                    error!(dispatcher = %self.config.name, error = %e, "failed to fetch available jobs");
                    let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
                    s.cycles += 1;
                    s.errors += 1;
                    s.uptime_secs = start_time.elapsed().as_secs();
                }
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(dispatcher = %self.config.name, "job dispatcher stopped");
    }
}
