//! Message queue mechanics for the dispatch pipeline.
//!
//! Transport-agnostic: the in-memory queue here backs tests and local runs;
//! durable backends (Redis Streams) live in `campaigner-infra`.

pub mod in_memory;
pub mod queue;

pub use in_memory::InMemoryQueue;
pub use queue::{Delivery, MessageQueue, Publisher, QueueError, Subscription};
