//! Redis-backed store for multi-process deployments.
//!
//! Counters are incremented by a Lua script so the first increment sets the
//! expiry atomically with the count.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::{debug, info};

use super::DistributedStore;
use crate::error::{Result, WardenError};

const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
local ttl_ms = tonumber(ARGV[1])
if count == 1 and ttl_ms > 0 then
    redis.call('PEXPIRE', KEYS[1], ttl_ms)
end
return count
"#;

/// [`DistributedStore`] over a Redis connection manager.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    increment: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to `redis_url` (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| WardenError::store("connect", redis_url, e))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| WardenError::store("connect", redis_url, e))?;

        info!(url = %redis_url, "Connected to redis");

        Ok(Self {
            conn,
            increment: Script::new(INCREMENT_SCRIPT),
        })
    }
}

#[async_trait]
impl DistributedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        conn.get::<_, Option<Vec<u8>>>(key)
            .await
            .map_err(|e| WardenError::store("get", key, e))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if !ttl.is_zero() {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        cmd.query_async::<()>(&mut conn)
            .await
            .map_err(|e| WardenError::store("set", key, e))
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = self
            .increment
            .key(key)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| WardenError::store("increment", key, e))?;

        debug!(key = %key, count = count, "Redis counter incremented");
        Ok(count)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| WardenError::store("delete", key, e))
    }
}
