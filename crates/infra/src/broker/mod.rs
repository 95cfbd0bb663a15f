//! Durable task broker adapters.
//!
//! The in-memory broker lives in `parley-tasks`; this module holds the
//! networked implementations.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsConfig, RedisStreamsTaskBroker};
