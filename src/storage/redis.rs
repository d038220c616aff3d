use crate::storage::Storage;
use crate::{LazyqError, Result};
use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::AsyncCommands;
use std::time::Duration;

/// Redis-backed storage over a `deadpool-redis` connection pool.
///
/// The pool is safe to share across the dispatch loop, the per-queue
/// scheduler and cleaner tasks, and any number of producers.
#[derive(Clone)]
pub struct RedisStorage {
    pool: Pool,
}

impl RedisStorage {
    pub fn new(redis_url: &str) -> Result<Self> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| LazyqError::Storage(e.to_string()))?;

        Ok(Self { pool })
    }

    async fn get_conn(&self) -> Result<Connection> {
        self.pool.get().await.map_err(|e| {
            LazyqError::Storage(format!("failed to get Redis connection: {}", e))
        })
    }
}

/// BLPOP across `keys`: pops from the head, matching `push_tail` = RPUSH for
/// FIFO delivery and letting `push_head` = LPUSH jump the line.
fn blocking_pop_cmd(keys: &[String], timeout: Duration) -> redis::Cmd {
    // BLPOP takes whole seconds; 0 would block forever.
    let secs = timeout.as_secs().max(1);

    let mut cmd = redis::cmd("BLPOP");
    cmd.arg(keys).arg(secs);
    cmd
}

#[async_trait]
impl Storage for RedisStorage {
    async fn push_tail(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;
        conn.rpush::<_, _, ()>(key, value)
            .await
            .map_err(|e| LazyqError::Storage(e.to_string()))
    }

    async fn push_head(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;
        conn.lpush::<_, _, ()>(key, value)
            .await
            .map_err(|e| LazyqError::Storage(e.to_string()))
    }

    async fn blocking_pop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>> {
        // The dispatch loop may abort this call mid-reply on shutdown. A
        // detached connection is dropped instead of going back into the pool
        // with a pending BLPOP reply that would desync the next borrower.
        let mut conn = Connection::take(self.get_conn().await?);

        let popped: Option<(String, String)> = blocking_pop_cmd(keys, timeout)
            .query_async(&mut conn)
            .await
            .map_err(|e| LazyqError::Storage(e.to_string()))?;

        Ok(popped)
    }

    async fn add_scored(&self, key: &str, score: i64, value: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;
        conn.zadd::<_, _, _, ()>(key, value, score)
            .await
            .map_err(|e| LazyqError::Storage(e.to_string()))
    }

    async fn remove_value(&self, key: &str, value: &str) -> Result<u64> {
        let mut conn = self.get_conn().await?;
        conn.zrem(key, value)
            .await
            .map_err(|e| LazyqError::Storage(e.to_string()))
    }

    async fn range_by_score(&self, key: &str, max: i64) -> Result<Vec<String>> {
        let mut conn = self.get_conn().await?;
        conn.zrangebyscore(key, "-inf", max)
            .await
            .map_err(|e| LazyqError::Storage(e.to_string()))
    }

    async fn remove_range_by_score(&self, key: &str, max: i64) -> Result<u64> {
        let mut conn = self.get_conn().await?;
        conn.zrembyscore(key, "-inf", max)
            .await
            .map_err(|e| LazyqError::Storage(e.to_string()))
    }

    async fn queue_sizes(
        &self,
        running_key: &str,
        delay_key: &str,
        dead_key: &str,
    ) -> Result<(u64, u64, u64)> {
        let mut conn = self.get_conn().await?;

        let mut pipe = redis::pipe();
        pipe.llen(running_key).zcard(delay_key).zcard(dead_key);

        pipe.query_async(&mut conn)
            .await
            .map_err(|e| LazyqError::Storage(e.to_string()))
    }
}
