use crate::job::{dead_key, delay_key, running_key, unix_now, DeadJob, JobEnvelope};
use crate::storage::Storage;
use crate::{LazyqError, Result};
use log::info;
use std::sync::Arc;
use std::time::Duration;

/// Producer side of the queue: wraps payloads in envelopes and hands them to
/// the backing store. Cheap to clone; all clones share the storage handle.
pub struct Client<S> {
    storage: Arc<S>,
}

impl<S: Storage> Client<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage: Arc::new(storage),
        }
    }

    pub fn with_storage(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Enqueue a payload for immediate dispatch.
    ///
    /// The payload lands on the tail of the queue's running list and becomes
    /// visible to any server polling that queue. Fails only if the store
    /// operation fails; there is no local buffering.
    pub async fn enqueue(&self, queue: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        let envelope = JobEnvelope::new(payload.into());
        let raw = serde_json::to_string(&envelope)
            .map_err(|e| LazyqError::Serialization(e.to_string()))?;

        self.storage.push_tail(&running_key(queue), &raw).await
    }

    /// Enqueue a payload to be dispatched no earlier than `delay` from now.
    ///
    /// The envelope goes into the queue's delay set scored by its due
    /// timestamp (seconds resolution); a server-side scheduler promotes it to
    /// the running list once due.
    pub async fn enqueue_after(
        &self,
        queue: &str,
        payload: impl Into<Vec<u8>>,
        delay: Duration,
    ) -> Result<()> {
        let envelope = JobEnvelope::new(payload.into());
        let raw = serde_json::to_string(&envelope)
            .map_err(|e| LazyqError::Serialization(e.to_string()))?;

        let due = unix_now() + delay.as_secs() as i64;
        self.storage.add_scored(&delay_key(queue), due, &raw).await
    }

    /// Move a dead-set entry back onto the head of the running list.
    ///
    /// `dead_entry` must be the exact stored value. The conditional remove is
    /// the race arbiter: if a concurrent resubmission or the cleaner got there
    /// first, nothing is removed and this fails with
    /// [`LazyqError::JobMissing`].
    pub async fn resubmit_dead_job(&self, queue: &str, dead_entry: &str) -> Result<()> {
        let removed = self.storage.remove_value(&dead_key(queue), dead_entry).await?;
        if removed == 0 {
            return Err(LazyqError::JobMissing);
        }

        let dead: DeadJob = serde_json::from_str(dead_entry)
            .map_err(|e| LazyqError::Deserialization(e.to_string()))?;
        let raw = serde_json::to_string(&dead.job)
            .map_err(|e| LazyqError::Serialization(e.to_string()))?;

        self.storage.push_head(&running_key(queue), &raw).await?;

        info!("resubmitted dead job to queue {}", queue);
        Ok(())
    }
}

impl<S> Clone for Client<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
        }
    }
}
