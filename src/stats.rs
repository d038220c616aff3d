use crate::job::{dead_key, delay_key, running_key};
use crate::storage::Storage;
use crate::Result;
use serde::Serialize;

/// Point-in-time sizes of a queue's three structures.
///
/// Serializable so a dashboard can expose it as JSON directly.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queue: String,
    pub running: u64,
    pub delayed: u64,
    pub dead: u64,
}

/// Read a queue's stats in a single pipelined store round trip.
///
/// Pure read: no mutation, and no retries beyond the batch call's own error
/// surfacing.
pub async fn queue_stats<S: Storage>(storage: &S, queue: &str) -> Result<QueueStats> {
    let (running, delayed, dead) = storage
        .queue_sizes(&running_key(queue), &delay_key(queue), &dead_key(queue))
        .await?;

    Ok(QueueStats {
        queue: queue.to_string(),
        running,
        delayed,
        dead,
    })
}
