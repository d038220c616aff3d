use crate::storage::Storage;
use crate::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const POP_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct Inner {
    lists: HashMap<String, VecDeque<String>>,
    // Sorted sets kept ordered by (score, value); scans stay cheap at the
    // sizes an in-process store sees.
    sets: HashMap<String, Vec<(i64, String)>>,
}

/// In-process storage, mainly for tests and local experiments.
///
/// Implements the same contract as [`RedisStorage`](crate::RedisStorage),
/// including conditional-remove reporting, so the claim protocol can be
/// exercised without a Redis server. `blocking_pop` is a bounded poll loop
/// rather than a true blocking read.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn push_tail(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn push_head(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn blocking_pop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>> {
        let deadline = Instant::now() + timeout;

        loop {
            {
                let mut inner = self.inner.lock().await;
                for key in keys {
                    if let Some(list) = inner.lists.get_mut(key) {
                        if let Some(value) = list.pop_front() {
                            return Ok(Some((key.clone(), value)));
                        }
                    }
                }
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POP_POLL_INTERVAL).await;
        }
    }

    async fn add_scored(&self, key: &str, score: i64, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let set = inner.sets.entry(key.to_string()).or_default();

        // ZADD semantics: re-adding an existing member updates its score.
        set.retain(|(_, v)| v != value);
        set.push((score, value.to_string()));
        set.sort();
        Ok(())
    }

    async fn remove_value(&self, key: &str, value: &str) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let Some(set) = inner.sets.get_mut(key) else {
            return Ok(0);
        };

        let before = set.len();
        set.retain(|(_, v)| v != value);
        Ok((before - set.len()) as u64)
    }

    async fn range_by_score(&self, key: &str, max: i64) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sets
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(score, _)| *score <= max)
                    .map(|(_, v)| v.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn remove_range_by_score(&self, key: &str, max: i64) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let Some(set) = inner.sets.get_mut(key) else {
            return Ok(0);
        };

        let before = set.len();
        set.retain(|(score, _)| *score > max);
        Ok((before - set.len()) as u64)
    }

    async fn queue_sizes(
        &self,
        running_key: &str,
        delay_key: &str,
        dead_key: &str,
    ) -> Result<(u64, u64, u64)> {
        let inner = self.inner.lock().await;
        let running = inner.lists.get(running_key).map_or(0, |l| l.len() as u64);
        let delayed = inner.sets.get(delay_key).map_or(0, |s| s.len() as u64);
        let dead = inner.sets.get(dead_key).map_or(0, |s| s.len() as u64);
        Ok((running, delayed, dead))
    }
}
