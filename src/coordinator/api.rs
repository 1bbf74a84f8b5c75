// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! UI-facing operations: submit, inspect the queues, reads.

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::{CacheClass, CachedValue};
use crate::drain::{DrainEvent, DrainReport, DrainTrigger, ReplayOutcome};
use crate::queue::{EntryId, QueueEntry, QueueName};
use crate::remote::RemoteRequest;

use super::{EngineState, Mutation, SubmitOutcome, SyncEngine, SyncError};

impl SyncEngine {
    fn ensure_accepting(&self) -> Result<(), SyncError> {
        if self.state() == EngineState::ShuttingDown {
            return Err(SyncError::ShuttingDown);
        }
        Ok(())
    }

    /// Apply a mutation now if possible, otherwise queue it.
    ///
    /// - online, nothing older queued: attempt in the foreground
    ///   - all steps acknowledged → [`SubmitOutcome::Applied`]
    ///   - rejected → [`SyncError::Rejected`], nothing queued
    ///   - transient failure → queued with whatever progress was made
    /// - offline, or older entries of the same kind still waiting → queued
    ///
    /// A queued mutation's optimistic view is written to the cache.
    #[tracing::instrument(skip(self, mutation), fields(queue = %mutation.queue))]
    pub async fn submit(&self, mutation: Mutation) -> Result<SubmitOutcome, SyncError> {
        self.ensure_accepting()?;

        let now = self.clock.now_millis();
        let mut entry = QueueEntry::new(mutation.queue, mutation.entry, now);

        // Going ahead of older queued entries would break per-queue ordering
        let queue_busy = self.queue.pending_count(mutation.queue).await? > 0;

        if self.connectivity.current() && !queue_busy {
            match self.scheduler.replay_entry(&mut entry, false).await {
                ReplayOutcome::Succeeded(response) => {
                    self.scheduler.fold(&entry, &response).await;
                    debug!(id = %entry.id, "Mutation applied in foreground");
                    return Ok(SubmitOutcome::Applied(response));
                }
                ReplayOutcome::Permanent { reason, status } => {
                    warn!(id = %entry.id, reason = %reason, ?status, "Mutation rejected");
                    return Err(SyncError::Rejected {
                        status,
                        message: reason,
                    });
                }
                ReplayOutcome::Transient { error } => {
                    debug!(id = %entry.id, error = %error, "Foreground attempt failed, queueing");
                    entry.attempt_count = 1;
                    entry.last_error = Some(error);
                }
            }
        }

        let id = self.queue.enqueue_prepared(entry).await?;

        if let Some(update) = mutation.optimistic {
            if let Err(e) = self.cache.write(&update.key, update.class, update.value).await {
                warn!(key = %update.key, error = %e, "Optimistic cache update failed");
            }
        }

        info!(id = %id, "Mutation queued");
        Ok(SubmitOutcome::Queued(id))
    }

    /// Entries of one queue in creation order, flagged ones included.
    pub async fn list_pending(&self, queue: QueueName) -> Result<Vec<QueueEntry>, SyncError> {
        Ok(self.queue.list(queue).await?)
    }

    /// Entries still waiting for automatic replay, across all queues.
    pub async fn pending_count(&self) -> Result<usize, SyncError> {
        Ok(self.queue.pending_total().await?)
    }

    pub async fn needs_attention(&self) -> Result<Vec<QueueEntry>, SyncError> {
        Ok(self.queue.needs_attention().await?)
    }

    /// User retry: drain every queue now, ignoring backoff.
    pub async fn request_drain(&self) -> Result<Vec<DrainReport>, SyncError> {
        self.ensure_accepting()?;
        Ok(self.scheduler.drain_all(DrainTrigger::UserRetry).await)
    }

    /// App came to the foreground. Drains only when something is waiting.
    pub async fn on_foreground(&self) -> Result<Vec<DrainReport>, SyncError> {
        self.ensure_accepting()?;
        if self.queue.pending_total().await? == 0 {
            return Ok(Vec::new());
        }
        Ok(self.scheduler.drain_all(DrainTrigger::Foreground).await)
    }

    /// Put a flagged entry back into automatic replay.
    pub async fn requeue(&self, queue: QueueName, id: EntryId) -> Result<(), SyncError> {
        if !self.queue.requeue(queue, id).await? {
            return Err(SyncError::EntryNotFound { queue, id });
        }
        info!(queue = %queue, id = %id, "Entry requeued by user");
        Ok(())
    }

    /// Drop an entry for good. The only way a mutation leaves the queue unreplayed.
    pub async fn discard(&self, queue: QueueName, id: EntryId) -> Result<(), SyncError> {
        if !self.queue.remove(queue, id).await? {
            return Err(SyncError::EntryNotFound { queue, id });
        }
        info!(queue = %queue, id = %id, "Entry discarded by user");
        Ok(())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DrainEvent> {
        self.scheduler.subscribe()
    }

    /// Cached value for `key`, possibly stale.
    pub async fn read(&self, key: &str) -> Result<CachedValue, SyncError> {
        Ok(self.cache.read(key).await?)
    }

    /// Cached value for `key` without waiting on the network when one exists.
    ///
    /// A stale hit is returned at once while `GET path` refreshes it in the
    /// background. A miss waits on the `GET` and caches the result.
    pub async fn read_through(
        &self,
        key: &str,
        class: CacheClass,
        path: &str,
    ) -> Result<CachedValue, SyncError> {
        let endpoint = self.endpoint.clone();
        let request = RemoteRequest::get(path);
        let value = self
            .cache
            .read_through(key, class, move || async move {
                let response = match endpoint.send(&request).await {
                    Ok(response) => response,
                    Err(e) => return Err(e.to_string()),
                };
                if response.is_success() {
                    Ok::<_, String>(response.body)
                } else {
                    Err(format!("HTTP {}: {}", response.status, response.error_message()))
                }
            })
            .await?;
        Ok(value)
    }

    pub async fn invalidate(&self, key: &str) -> Result<(), SyncError> {
        Ok(self.cache.invalidate(key).await?)
    }

    pub async fn invalidate_all(&self) -> Result<usize, SyncError> {
        Ok(self.cache.invalidate_all().await?)
    }
}
