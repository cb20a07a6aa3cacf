//! Infrastructure layer: stores, queues, config, and the dispatch pipeline.

pub mod config;
pub mod consumer;
pub mod pagination;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod template;
pub mod tracking;


pub use config::{ConfigError, DispatchConfig};
pub use consumer::{CampaignHandler, ConsumerConfig, ConsumerPool, HandleOutcome};
pub use scheduler::{CampaignLauncher, Scheduler, SchedulerReport};
pub use store::{CampaignStore, StoreError};
