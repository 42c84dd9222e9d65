//! Infrastructure message bus implementations.
//!
//! The bus abstraction and the in-memory bus live in `loadcache-events`. This
//! module provides broker-backed implementations (e.g. Redis).

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsError, RedisStreamsMessageBus};
