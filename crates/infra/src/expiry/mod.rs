//! Time-based expiry of unpaid invoices.
//!
//! The watcher is just another signal source: it submits a `failed` request
//! through the coordinator like any gateway would.

pub mod registry;
pub mod watcher;

#[cfg(feature = "redis")]
pub mod redis_keyspace;

pub use registry::TimerRegistry;
pub use watcher::{DEFAULT_PROCESSING_DEADLINE, EXPIRY_REASON, ExpiryWatcher};

#[cfg(feature = "redis")]
pub use redis_keyspace::{RedisExpiryError, RedisExpirySource};
