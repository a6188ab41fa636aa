use std::sync::Arc;

use mailrelay_core::{Clock, LeaseSettings, SystemClock, WorkerId};
use mailrelay_infra::{
    jobs::{DispatcherConfig, InMemoryJobRepository, JobDispatcher, JobLeaseManager, JobRepository, Mailer},
    lease_store::{InMemoryLeaseStore, LeaseStore},
    lock::LockCoordinator,
};

#[cfg(feature = "redis")]
use anyhow::Context;
#[cfg(feature = "redis")]
use mailrelay_infra::{jobs::PostgresJobRepository, lease_store::RedisLeaseStore};
#[cfg(feature = "redis")]
use sqlx::PgPool;

use super::config::AppConfig;
use super::mailer::LogMailer;

/// Everything the HTTP handlers and the background loop share.
#[derive(Clone)]
pub struct AppServices {
    pub jobs: Arc<dyn JobRepository>,
    pub locks: LockCoordinator,
    pub leases: Arc<JobLeaseManager>,
    pub dispatcher: Arc<JobDispatcher>,
    pub clock: Arc<dyn Clock>,
}

impl AppServices {
    pub fn new(
        lease_store: Arc<dyn LeaseStore>,
        jobs: Arc<dyn JobRepository>,
        mailer: Arc<dyn Mailer>,
        clock: Arc<dyn Clock>,
        worker_id: WorkerId,
        dispatcher_config: DispatcherConfig,
    ) -> Self {
        let locks = LockCoordinator::new(lease_store);
        let leases = Arc::new(JobLeaseManager::new(
            locks.clone(),
            jobs.clone(),
            clock.clone(),
            worker_id,
            LeaseSettings::default(),
        ));
        let dispatcher = Arc::new(JobDispatcher::new(leases.clone(), mailer, dispatcher_config));

        Self {
            jobs,
            locks,
            leases,
            dispatcher,
            clock,
        }
    }

    /// In-memory stores (dev/test).
    pub fn in_memory(mailer: Arc<dyn Mailer>, dispatcher_config: DispatcherConfig) -> Self {
        Self::new(
            InMemoryLeaseStore::arc(),
            InMemoryJobRepository::arc(),
            mailer,
            Arc::new(SystemClock),
            WorkerId::detect(),
            dispatcher_config,
        )
    }
}

pub async fn build_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    let dispatcher_config = DispatcherConfig::default().with_poll_interval(config.poll_interval);

    if config.use_persistent_stores {
        #[cfg(feature = "redis")]
        {
            return build_persistent_services(config, dispatcher_config).await;
        }
        #[cfg(not(feature = "redis"))]
        {
            tracing::warn!("USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory");
        }
    }

    tracing::info!("using in-memory job and lease stores");
    Ok(AppServices::in_memory(Arc::new(LogMailer), dispatcher_config))
}

#[cfg(feature = "redis")]
async fn build_persistent_services(
    config: &AppConfig,
    dispatcher_config: DispatcherConfig,
) -> anyhow::Result<AppServices> {
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;

    let pool = PgPool::connect(database_url)
        .await
        .context("failed to connect to Postgres")?;
    let jobs = PostgresJobRepository::new(pool);
    jobs.migrate().await.context("failed to apply email_jobs schema")?;

    let lease_store = RedisLeaseStore::connect(&config.redis_url)
        .await
        .context("failed to connect to Redis")?;

    tracing::info!(redis_url = %config.redis_url, "using Postgres job store and Redis lease store");
    Ok(AppServices::new(
        Arc::new(lease_store),
        Arc::new(jobs),
        Arc::new(LogMailer),
        Arc::new(SystemClock),
        WorkerId::detect(),
        dispatcher_config,
    ))
}
