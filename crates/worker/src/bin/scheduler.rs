//! Single scheduler pass: dispatch every campaign whose schedule is due.
//!
//! Meant to be invoked periodically by an external trigger (cron, k8s CronJob).

use anyhow::Context;
use chrono::Utc;

use campaigner_infra::DispatchConfig;
use campaigner_worker::Backend;

fn main() -> anyhow::Result<()> {
    campaigner_observability::init();

    let config = DispatchConfig::from_env().context("invalid configuration")?;
    let now = Utc::now();

    let report = match Backend::select(&config) {
        Backend::InMemory => {
            let (store, queue) = campaigner_worker::in_memory_backends(&config);
            campaigner_worker::run_scheduler_tick(store, queue, &config, now)
        }
        #[cfg(feature = "redis")]
        Backend::Persistent => {
            let runtime = campaigner_worker::build_runtime()?;
            let store = campaigner_worker::connect_store(&runtime, &config)?;
            let queue = campaigner_worker::connect_queue(&config)?;
            campaigner_worker::run_scheduler_tick(store, queue, &config, now)
        }
    }
    .context("failed to list scheduled campaigns")?;

    if !report.unconfirmed().is_empty() {
        tracing::error!(
            campaigns = ?report.unconfirmed(),
            "dispatched campaigns whose status could not be updated"
        );
    }
    Ok(())
}
