//! Long-running consumer pool for campaign dispatch messages.
//!
//! Stops taking new messages on ctrl-c / SIGTERM and waits for in-flight
//! campaigns to finish before exiting.

use anyhow::Context;

use campaigner_infra::DispatchConfig;
use campaigner_worker::Backend;

fn main() -> anyhow::Result<()> {
    campaigner_observability::init();

    let config = DispatchConfig::from_env().context("invalid configuration")?;
    let runtime = campaigner_worker::build_runtime()?;
    let shutdown = || campaigner_worker::wait_for_signal(&runtime);

    tracing::info!(
        topic = %config.campaigner_topic,
        group = %config.campaigner_group,
        concurrency = config.concurrency,
        "starting campaigner"
    );

    match Backend::select(&config) {
        Backend::InMemory => {
            let (store, queue) = campaigner_worker::in_memory_backends(&config);
            campaigner_worker::run_consumer(store, queue, &config, shutdown)?;
        }
        #[cfg(feature = "redis")]
        Backend::Persistent => {
            let store = campaigner_worker::connect_store(&runtime, &config)?;
            let queue = campaigner_worker::connect_queue(&config)?;
            campaigner_worker::run_consumer(store, queue, &config, shutdown)?;
        }
    }
    Ok(())
}
