use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

/// The primitive operations the queue requires of its backing store.
///
/// Shaped after the Redis commands the queue is built on: lists for ready
/// jobs, sorted sets for delayed and dead jobs. The claim protocol relies on
/// `remove_value` being atomic and reporting whether anything was removed.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Append a value to the tail of a list (RPUSH).
    async fn push_tail(&self, key: &str, value: &str) -> Result<()>;

    /// Prepend a value to the head of a list (LPUSH).
    async fn push_head(&self, key: &str, value: &str) -> Result<()>;

    /// Pop from the head of the first non-empty list among `keys`, blocking
    /// up to `timeout`. Returns `None` when the timeout elapses with nothing
    /// available (BRPOP semantics: producers append to the tail, so the pop
    /// side delivers approximately FIFO).
    async fn blocking_pop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>>;

    /// Add a value to a sorted set with the given score (ZADD).
    async fn add_scored(&self, key: &str, score: i64, value: &str) -> Result<()>;

    /// Remove an exact value from a sorted set, reporting how many entries
    /// were actually removed (ZREM). Zero means another actor got there first.
    async fn remove_value(&self, key: &str, value: &str) -> Result<u64>;

    /// All values with score <= `max`, lowest score first (ZRANGEBYSCORE).
    async fn range_by_score(&self, key: &str, max: i64) -> Result<Vec<String>>;

    /// Remove all values with score <= `max`, reporting how many were removed
    /// (ZREMRANGEBYSCORE).
    async fn remove_range_by_score(&self, key: &str, max: i64) -> Result<u64>;

    /// One pipelined read of (running list length, delay set cardinality,
    /// dead set cardinality).
    async fn queue_sizes(
        &self,
        running_key: &str,
        delay_key: &str,
        dead_key: &str,
    ) -> Result<(u64, u64, u64)>;
}
