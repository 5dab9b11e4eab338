//! Redis session backend on a deadpool connection pool.

use crate::error::StoreError;
use crate::session::{BackendKind, SessionBackend};
use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::AsyncCommands;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Redis-backed session storage.
///
/// Connections are created lazily, so building the backend never touches the
/// network. Checkouts are bounded by the connect timeout and every command by
/// the socket timeout.
#[derive(Clone)]
pub struct RedisBackend {
    pool: Pool,
    connect_timeout: Duration,
    socket_timeout: Duration,
}

impl fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend")
            .field("pool", &"Pool")
            .field("connect_timeout", &self.connect_timeout)
            .field("socket_timeout", &self.socket_timeout)
            .finish()
    }
}

impl RedisBackend {
    /// Create a pool for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the URL cannot be parsed into a pool
    /// configuration.
    pub fn new(
        url: &str,
        connect_timeout: Duration,
        socket_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self {
            pool,
            connect_timeout,
            socket_timeout,
        })
    }

    async fn connection(&self) -> Result<Connection, StoreError> {
        tokio::time::timeout(self.connect_timeout, self.pool.get())
            .await
            .map_err(|_| StoreError::Timeout(self.connect_timeout))?
            .map_err(StoreError::from)
    }

    async fn command<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>> + Send,
    {
        tokio::time::timeout(self.socket_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(self.socket_timeout))?
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl SessionBackend for RedisBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        self.command(conn.get::<_, Option<String>>(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        // SETEX rejects a zero expiry.
        let seconds = ttl.as_secs().max(1);
        let mut conn = self.connection().await?;
        self.command(conn.set_ex::<_, _, ()>(key, value, seconds))
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let removed: i64 = self.command(conn.del(key)).await?;
        debug!(removed, "DEL");
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let reply: String = self
            .command(redis::cmd("PING").query_async(&mut conn))
            .await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Backend(format!("unexpected PING reply: {reply}")))
        }
    }

    /// Keys carry their own TTL, so Redis expires them itself.
    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}
