use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub(crate) const QUEUE_PREFIX: &str = "lazyq:queue:";
pub(crate) const DELAY_PREFIX: &str = "lazyq:delay:";
pub(crate) const DEAD_PREFIX: &str = "lazyq:dead:";

/// The stored record wrapping a job payload.
///
/// The payload is opaque to the queue: it is carried through Redis unexamined
/// and handed to the registered handler as raw bytes. `attempts` is bumped
/// exactly once, right before the handler runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    #[serde(rename = "job")]
    pub payload: Vec<u8>,
    pub created_at: i64,
    pub attempts: u32,
}

impl JobEnvelope {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            created_at: OffsetDateTime::now_utc().unix_timestamp(),
            attempts: 0,
        }
    }
}

/// A job whose single execution attempt failed, parked in the dead set.
///
/// `reason` is the stringified handler error. The entry's sorted-set score is
/// the failure timestamp; the cleaner removes entries older than the TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadJob {
    #[serde(flatten)]
    pub job: JobEnvelope,
    pub reason: String,
}

/// Key of the per-queue running list (FIFO, workers pop from here).
pub(crate) fn running_key(queue: &str) -> String {
    format!("{}{}", QUEUE_PREFIX, queue)
}

/// Key of the per-queue delay set, scored by due timestamp.
pub(crate) fn delay_key(queue: &str) -> String {
    format!("{}{}", DELAY_PREFIX, queue)
}

/// Key of the per-queue dead set, scored by failure timestamp.
pub(crate) fn dead_key(queue: &str) -> String {
    format!("{}{}", DEAD_PREFIX, queue)
}

/// Recover the queue name from a running-list key returned by a pop.
pub(crate) fn queue_from_running_key(key: &str) -> &str {
    key.strip_prefix(QUEUE_PREFIX).unwrap_or(key)
}

pub(crate) fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
