//! Redis-backed distributed lock.
//!
//! - **Acquire**: `SET key owner NX EX ttl`
//! - **Release**: Lua compare-and-delete, so an owner whose TTL already lapsed
//!   can never delete a lock someone else has since taken
//! - **Renew**: Lua compare-and-expire, used by the leadership check

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::instrument;

use super::{DistributedLock, LockError, OwnerToken, ttl_secs};

const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('expire', KEYS[1], ARGV[2])
else
    return 0
end
"#;

#[derive(Debug, Clone)]
pub struct RedisLock {
    client: Arc<redis::Client>,
    release: Arc<redis::Script>,
    renew: Arc<redis::Script>,
}

impl RedisLock {
    /// Create a lock client for `redis_url` (e.g. "redis://localhost:6379").
    ///
    /// No connection is made until the first command.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LockError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            release: Arc::new(redis::Script::new(RELEASE_SCRIPT)),
            renew: Arc::new(redis::Script::new(RENEW_SCRIPT)),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, LockError> {
        self.client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| LockError::Connection(e.to_string()))
    }
}

fn map_redis_error(operation: &str, err: redis::RedisError) -> LockError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
        LockError::Connection(format!("{operation}: {err}"))
    } else {
        LockError::Command(format!("{operation}: {err}"))
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    #[instrument(skip(self, owner), fields(ttl_secs = ttl.as_secs()), err)]
    async fn acquire(&self, key: &str, owner: &OwnerToken, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.connection().await?;

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(owner.to_string())
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("SET NX", e))?;

        Ok(reply.as_deref() == Some("OK"))
    }

    #[instrument(skip(self, owner), err)]
    async fn release(&self, key: &str, owner: &OwnerToken) -> Result<bool, LockError> {
        let mut conn = self.connection().await?;

        let deleted: i64 = self
            .release
            .key(key)
            .arg(owner.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("release script", e))?;

        Ok(deleted == 1)
    }

    #[instrument(skip(self, owner), fields(ttl_secs = ttl.as_secs()), err)]
    async fn renew(&self, key: &str, owner: &OwnerToken, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.connection().await?;

        let renewed: i64 = self
            .renew
            .key(key)
            .arg(owner.to_string())
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("renew script", e))?;

        Ok(renewed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_url() {
        assert!(matches!(
            RedisLock::new("not a url"),
            Err(LockError::Connection(_))
        ));
    }

    #[test]
    fn accepts_url_without_connecting() {
        assert!(RedisLock::new("redis://127.0.0.1:6399").is_ok());
    }
}
