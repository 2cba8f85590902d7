use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client};

use super::TokenStore;
use crate::error::Result;

// Deletes KEYS[1] only while it still holds ARGV[1].
const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// [`TokenStore`] backed by Redis, shared by every instance connected to the same server.
///
/// Uses a [`ConnectionManager`], which reconnects transparently after connection loss.
/// Clones share the connection.
#[derive(Clone)]
pub struct RedisTokenStore {
    connection: ConnectionManager,
}

impl std::fmt::Debug for RedisTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTokenStore").finish_non_exhaustive()
    }
}

impl RedisTokenStore {
    /// Connect to the server at `url`, for example `redis://127.0.0.1:6379/0`.
    ///
    /// # Errors
    /// Returns [`Error::Store`](crate::Error::Store) if the URL is invalid or the initial
    /// connection fails.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        tracing::debug!("Connected to Redis token store");
        Ok(Self { connection })
    }

    #[must_use]
    pub fn from_connection_manager(connection: ConnectionManager) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl TokenStore for RedisTokenStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn try_acquire_lock(&self, lock_key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        // Nil reply when the key already exists.
        let reply: Option<String> = redis::cmd("SET")
            .arg(lock_key)
            .arg(holder)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release_lock(&self, lock_key: &str, holder: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let deleted: i64 = redis::cmd("EVAL")
            .arg(RELEASE_LOCK_SCRIPT)
            .arg(1)
            .arg(lock_key)
            .arg(holder)
            .query_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.connection.clone();
        let millis: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        // -2: missing, -1: no expiry
        Ok(u64::try_from(millis).ok().map(Duration::from_millis))
    }
}

/// Redis rejects `EX 0`, so sub-second TTLs are rounded up to one second.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}
