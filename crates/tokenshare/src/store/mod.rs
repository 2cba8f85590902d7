//! Shared, TTL-capable key-value storage for tokens and the refresh lock.
mod memory;
#[cfg(feature = "redis")]
mod redis;

use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;

pub use memory::MemoryTokenStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisTokenStore;
use crate::error::Result;

/// Storage shared by all instances of a deployment.
///
/// Every call must reach the shared store; implementations may not cache values in
/// process, because other instances write to the same keys. Expiry is delegated to the
/// store: a key whose TTL elapsed must read as absent.
#[async_trait]
pub trait TokenStore: Debug + Send + Sync {
    /// Read a value. Expired and missing keys both return `None`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write `value`, replacing any previous value and TTL.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Atomically create `lock_key` holding `holder` unless it already exists.
    ///
    /// Returns `true` only if this call created the entry. Never waits for the lock.
    async fn try_acquire_lock(&self, lock_key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Delete `lock_key` if, and only if, it still holds `holder`.
    ///
    /// Returns `false` if the lock expired or was taken over by another holder meanwhile.
    async fn release_lock(&self, lock_key: &str, holder: &str) -> Result<bool>;

    /// Remaining lifetime of `key`, `None` if the key is absent or never expires.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;
}
