//! Broker-backed event bus implementations.
//!
//! The bus abstraction lives in `payrecon-events` as pure mechanics; this module
//! provides the Redis Streams transport for invoice transition envelopes.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{DEFAULT_STREAM_KEY, RedisStreamsError, RedisStreamsEventBus};
