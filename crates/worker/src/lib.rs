//! Process wiring for the `scheduler` and `campaigner` binaries.
//!
//! Backends are picked from [`DispatchConfig`]: in-memory (dev) or Postgres
//! plus Redis Streams when `USE_PERSISTENT_STORES=true` and the crate is built
//! with the `redis` feature.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::runtime::Runtime;
use tracing::{info, warn};

use campaigner_core::SystemClock;
use campaigner_events::{InMemoryQueue, MessageQueue, Publisher};
use campaigner_infra::consumer::{CampaignHandler, ConsumerPool, ConsumerStats};
use campaigner_infra::scheduler::{Scheduler, SchedulerReport};
use campaigner_infra::store::{CampaignStore, InMemoryCampaignStore, PostgresCampaignStore, StoreError};
use campaigner_infra::template::StoredTemplateRenderer;
use campaigner_infra::tracking::StaticTrackingProbe;
use campaigner_infra::DispatchConfig;

/// Which store and queue implementations the process runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    InMemory,
    #[cfg(feature = "redis")]
    Persistent,
}

impl Backend {
    pub fn select(config: &DispatchConfig) -> Self {
        if !config.use_persistent_stores {
            warn!("USE_PERSISTENT_STORES not set; using in-memory store and queue");
            return Backend::InMemory;
        }

        #[cfg(feature = "redis")]
        {
            Backend::Persistent
        }
        #[cfg(not(feature = "redis"))]
        {
            warn!("USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory");
            Backend::InMemory
        }
    }
}

/// Runtime that owns the sqlx pool. Pipeline code runs on plain threads and
/// reaches it through a [`tokio::runtime::Handle`].
pub fn build_runtime() -> anyhow::Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .thread_name("campaigner-io")
        .enable_all()
        .build()
        .context("failed to build tokio runtime")
}

pub fn connect_store(runtime: &Runtime, config: &DispatchConfig) -> anyhow::Result<PostgresCampaignStore> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set for persistent stores")?;
    let pool = runtime
        .block_on(sqlx::PgPool::connect(url))
        .context("failed to connect to Postgres")?;
    Ok(PostgresCampaignStore::new(pool, runtime.handle().clone()))
}

#[cfg(feature = "redis")]
pub fn connect_queue(config: &DispatchConfig) -> anyhow::Result<campaigner_infra::queue::RedisStreamsQueue> {
    let queue = campaigner_infra::queue::RedisStreamsQueue::new(&config.redis_url, None)
        .context("failed to create Redis Streams queue")?
        .with_consumer_name(format!("campaigner-{}", std::process::id()))
        .with_visibility_timeout(config.visibility_timeout)
        .with_max_in_flight(config.max_in_flight);
    Ok(queue)
}

pub fn in_memory_backends(config: &DispatchConfig) -> (Arc<InMemoryCampaignStore>, Arc<InMemoryQueue>) {
    let queue = InMemoryQueue::new()
        .with_visibility_timeout(config.visibility_timeout)
        .with_max_in_flight(config.max_in_flight);
    (InMemoryCampaignStore::arc(), Arc::new(queue))
}

/// One scheduler pass over the campaigns due at `now`.
pub fn run_scheduler_tick<S, P>(
    store: S,
    publisher: P,
    config: &DispatchConfig,
    now: DateTime<Utc>,
) -> Result<SchedulerReport, StoreError>
where
    S: CampaignStore,
    P: Publisher,
{
    let scheduler = Scheduler::new(
        store,
        publisher,
        StaticTrackingProbe(config.configuration_set_exists),
        config.campaigner_topic.clone(),
    );
    let report = scheduler.run(now)?;
    info!(
        due = report.due,
        dispatched = report.dispatched.len(),
        skipped = report.skipped.len(),
        unconfirmed = report.unconfirmed().len(),
        "scheduler tick finished"
    );
    Ok(report)
}

/// Run the consumer pool until `wait_for_shutdown` returns, then drain it.
pub fn run_consumer<S, Q, F>(
    store: S,
    queue: Q,
    config: &DispatchConfig,
    wait_for_shutdown: F,
) -> anyhow::Result<ConsumerStats>
where
    S: CampaignStore + Clone + 'static,
    Q: MessageQueue + Clone + 'static,
    F: FnOnce() -> anyhow::Result<()>,
{
    let handler = CampaignHandler::new(
        store.clone(),
        queue.clone(),
        StoredTemplateRenderer::new(store),
        SystemClock,
        config.send_email_topic.clone(),
    )
    .with_page_size(config.page_size);

    let pool = ConsumerPool::spawn(Arc::new(handler), queue, config.consumer_config())
        .context("failed to spawn consumer workers")?;

    let waited = wait_for_shutdown();
    info!(workers = pool.workers(), "draining consumer pool");
    let stats = pool.shutdown();
    info!(
        stats = %serde_json::to_string(&stats).unwrap_or_default(),
        "consumer pool stopped"
    );
    waited.map(|()| stats)
}

/// Block until ctrl-c (or SIGTERM on unix).
pub fn wait_for_signal(runtime: &Runtime) -> anyhow::Result<()> {
    runtime.block_on(async {
        #[cfg(unix)]
        {
            let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;
            tokio::select! {
                res = tokio::signal::ctrl_c() => res.context("failed to listen for ctrl-c"),
                _ = term.recv() => Ok(()),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")
        }
    })
}

/// Sleep-based shutdown used by tests and one-off drains.
pub fn after(duration: Duration) -> impl FnOnce() -> anyhow::Result<()> {
    move || {
        std::thread::sleep(duration);
        Ok(())
    }
}
