//! Pluggable external state for multi-instance deployments.
//!
//! A [`DistributedStore`] is a small key/value capability: plain get/set with
//! a TTL, an atomic counter whose TTL starts with its first increment, and
//! delete. The distributed engine builds its fixed-window counting and shared
//! penalties on top of it.

mod cluster;
mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use cluster::{ClusterConfig, ClusterStore};
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Capability interface for a shared counter store.
///
/// A TTL of `Duration::ZERO` means the value never expires.
#[async_trait]
pub trait DistributedStore: Send + Sync {
    /// Get a value, or `None` if missing or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a value that expires after `ttl`.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Atomically add one to a counter and return the new value.
    ///
    /// A missing or expired counter starts from zero and expires `ttl` after
    /// this first increment; later increments do not extend it.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64>;

    /// Remove a key.
    async fn delete(&self, key: &str) -> Result<()>;
}
