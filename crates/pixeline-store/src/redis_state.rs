//! Redis-backed [`StateStore`]

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};

use crate::state::{Marker, StateStore, StoreError, lock_key};

/// Delete the lock only if it still carries our token
const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
";

/// Bound on a single connect or command round trip
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared multiplexed connection; cloning is cheap and every task may use it.
#[derive(Clone)]
pub struct RedisStateStore {
    conn: ConnectionManager,
    release: redis::Script,
}

impl std::fmt::Debug for RedisStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStateStore").finish_non_exhaustive()
    }
}

impl RedisStateStore {
    /// Open a managed connection and verify it with PING.
    ///
    /// Makes exactly one connection attempt; retrying is left to the caller.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(0)
            .set_connection_timeout(CONNECT_TIMEOUT)
            .set_response_timeout(CONNECT_TIMEOUT);
        let mut conn = ConnectionManager::new_with_config(client, config).await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(Self {
            conn,
            release: redis::Script::new(RELEASE_SCRIPT),
        })
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn try_lock(&self, url: &str, token: &str, lease: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let lease_ms = u64::try_from(lease.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply: Option<String> = redis::cmd("SET")
            .arg(lock_key(url))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, url: &str, token: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .release
            .key(lock_key(url))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn has_marker(&self, marker: Marker, url: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(marker.key(url)).await?;
        Ok(exists)
    }

    async fn set_marker(&self, marker: Marker, url: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(marker.key(url), value).await?;
        Ok(())
    }

    async fn has_marker_batch(
        &self,
        marker: Marker,
        urls: &[String],
    ) -> Result<Vec<bool>, StoreError> {
        if urls.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for url in urls {
            pipe.exists(marker.key(url));
        }
        let mut conn = self.conn.clone();
        let found: Vec<bool> = pipe.query_async(&mut conn).await?;
        Ok(found)
    }
}
