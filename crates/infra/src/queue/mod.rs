//! Infrastructure-backed queue implementations.
//!
//! The queue abstraction lives in `campaigner-events` as pure mechanics.
//! This module provides backends that need external services.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsError, RedisStreamsQueue};
