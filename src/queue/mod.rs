// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable, ordered queues of pending mutations.
//!
//! Each [`QueueName`] owns one durable-store key holding the whole list as a
//! versioned envelope. Every change is a read-modify-write of that list
//! under the queue's async mutex, so a UI enqueue and a drain removal can't
//! lose each other's update. The mutex is never held across a remote call.
//!
//! Corruption fails closed. An unreadable list reads as an empty queue; an
//! entry whose payload no longer matches its digest is left out of reads
//! while the rest of the list stays live. Nothing is destroyed on read: the
//! next write first copies the unreadable bytes or the failing entries to
//! `queue/{name}.corrupt-{millis}` for diagnostics.

mod entry;

pub use entry::{
    Attachment, EntryId, EntryState, NewEntry, QueueEntry, QueueName, payload_digest,
};

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::envelope;
use crate::storage::traits::{DurableStore, StorageError};

/// Result of loading a queue list.
struct Loaded {
    entries: Vec<QueueEntry>,
    /// Unreadable bytes found at the queue key, if any
    corrupt: Option<Vec<u8>>,
    /// Entries that decoded but failed their integrity check
    quarantined: Vec<QueueEntry>,
    needs_migration: bool,
}

pub struct MutationQueue {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    locks: DashMap<QueueName, Arc<Mutex<()>>>,
}

impl MutationQueue {
    pub fn new(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, queue: QueueName) -> Arc<Mutex<()>> {
        self.locks
            .entry(queue)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load(&self, queue: QueueName) -> Result<Loaded, StorageError> {
        let key = queue.store_key();
        let bytes = match self.store.get(&key).await? {
            Some(bytes) => bytes,
            None => {
                return Ok(Loaded {
                    entries: Vec::new(),
                    corrupt: None,
                    quarantined: Vec::new(),
                    needs_migration: false,
                })
            }
        };

        match envelope::decode::<Vec<QueueEntry>>(&key, &bytes) {
            Ok(decoded) => {
                let needs_migration = decoded.needs_migration();
                let (entries, quarantined): (Vec<_>, Vec<_>) = decoded
                    .record
                    .into_iter()
                    .partition(|e| e.payload_intact() && e.queue_name == queue);
                for bad in &quarantined {
                    error!(key = %key, id = %bad.id, "Queue entry failed integrity check, holding it back");
                    crate::metrics::record_corruption(&key);
                }
                Ok(Loaded {
                    entries,
                    corrupt: None,
                    quarantined,
                    needs_migration,
                })
            }
            Err(StorageError::Corruption { key, reason }) => {
                error!(key = %key, reason = %reason, "Corrupt queue list, treating as empty");
                crate::metrics::record_corruption(&key);
                Ok(Loaded {
                    entries: Vec::new(),
                    corrupt: Some(bytes),
                    quarantined: Vec::new(),
                    needs_migration: false,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn save(&self, queue: QueueName, entries: &[QueueEntry]) -> Result<(), StorageError> {
        let bytes = envelope::encode(&entries)?;
        self.store.set(&queue.store_key(), &bytes).await?;
        let pending = entries.iter().filter(|e| e.is_pending()).count();
        crate::metrics::set_pending(queue.as_str(), pending);
        Ok(())
    }

    /// Locked read-modify-write. `f` returns its result plus whether it changed the list.
    async fn mutate<R>(
        &self,
        queue: QueueName,
        f: impl FnOnce(&mut Vec<QueueEntry>) -> (R, bool),
    ) -> Result<R, StorageError> {
        let lock = self.lock_for(queue);
        let _guard = lock.lock().await;

        let mut loaded = self.load(queue).await?;
        let (result, changed) = f(&mut loaded.entries);

        if changed {
            let quarantine = format!("{}.corrupt-{}", queue.store_key(), self.clock.now_millis());
            if let Some(corrupt) = loaded.corrupt.take() {
                self.store.set(&quarantine, &corrupt).await?;
                warn!(queue = %queue, quarantine = %quarantine, "Preserved corrupt queue list before overwrite");
            } else if !loaded.quarantined.is_empty() {
                let bytes = envelope::encode(&loaded.quarantined)?;
                self.store.set(&quarantine, &bytes).await?;
                warn!(
                    queue = %queue,
                    quarantine = %quarantine,
                    count = loaded.quarantined.len(),
                    "Moved entries that failed integrity check out of the queue"
                );
            }
            if loaded.needs_migration {
                info!(queue = %queue, "Migrating legacy queue list to current format");
            }
            self.save(queue, &loaded.entries).await?;
        }

        Ok(result)
    }

    /// Append a mutation. Durable when this returns `Ok`.
    pub async fn enqueue(&self, queue: QueueName, entry: NewEntry) -> Result<EntryId, StorageError> {
        let entry = QueueEntry::new(queue, entry, self.clock.now_millis());
        self.enqueue_prepared(entry).await
    }

    /// Persist an entry that was built (and possibly partly replayed) elsewhere.
    ///
    /// Inserted by `created_at`, so an entry whose foreground attempt took a
    /// while still lands ahead of anything enqueued after it was created.
    pub async fn enqueue_prepared(&self, entry: QueueEntry) -> Result<EntryId, StorageError> {
        let queue = entry.queue_name;
        let id = entry.id;
        self.mutate(queue, move |entries| {
            if entries.iter().any(|e| e.id == entry.id) {
                return ((), false);
            }
            let position = entries
                .iter()
                .position(|e| e.created_at > entry.created_at)
                .unwrap_or(entries.len());
            entries.insert(position, entry);
            ((), true)
        })
        .await?;

        crate::metrics::record_enqueue(queue.as_str());
        debug!(queue = %queue, id = %id, "Entry enqueued");
        Ok(id)
    }

    /// All entries of a queue in creation order, including flagged ones.
    pub async fn list(&self, queue: QueueName) -> Result<Vec<QueueEntry>, StorageError> {
        Ok(self.load(queue).await?.entries)
    }

    pub async fn get(&self, queue: QueueName, id: EntryId) -> Result<Option<QueueEntry>, StorageError> {
        Ok(self.list(queue).await?.into_iter().find(|e| e.id == id))
    }

    /// Remove an entry. Removing an unknown id is a no-op; returns whether anything was removed.
    pub async fn remove(&self, queue: QueueName, id: EntryId) -> Result<bool, StorageError> {
        self.mutate(queue, |entries| {
            let before = entries.len();
            entries.retain(|e| e.id != id);
            let removed = entries.len() != before;
            (removed, removed)
        })
        .await
    }

    /// Non-empty queues and their entries.
    pub async fn peek_all(&self) -> Result<BTreeMap<QueueName, Vec<QueueEntry>>, StorageError> {
        let mut all = BTreeMap::new();
        for queue in QueueName::ALL {
            let entries = self.list(queue).await?;
            if !entries.is_empty() {
                all.insert(queue, entries);
            }
        }
        Ok(all)
    }

    /// Count a failed replay. Returns the new attempt count, or `None` if the
    /// entry is gone.
    pub async fn record_failure(
        &self,
        queue: QueueName,
        id: EntryId,
        error: &str,
        next_attempt_at: i64,
    ) -> Result<Option<u32>, StorageError> {
        let error = error.to_string();
        self.mutate(queue, |entries| match entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.attempt_count = entry.attempt_count.saturating_add(1);
                entry.last_error = Some(error);
                entry.next_attempt_at = next_attempt_at;
                (Some(entry.attempt_count), true)
            }
            None => (None, false),
        })
        .await
    }

    /// Persist sub-step progress. `target_id` is only ever set, never cleared.
    pub async fn record_progress(
        &self,
        queue: QueueName,
        id: EntryId,
        cursor: u32,
        target_id: Option<String>,
    ) -> Result<bool, StorageError> {
        self.mutate(queue, |entries| match entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                let mut changed = false;
                if cursor > entry.cursor {
                    entry.cursor = cursor;
                    changed = true;
                }
                if entry.target_id.is_none() && target_id.is_some() {
                    entry.target_id = target_id;
                    changed = true;
                }
                (true, changed)
            }
            None => (false, false),
        })
        .await
    }

    /// Move an entry to the dead-letter state.
    pub async fn flag_needs_attention(
        &self,
        queue: QueueName,
        id: EntryId,
        reason: &str,
        status: Option<u16>,
    ) -> Result<bool, StorageError> {
        let flagged_at = self.clock.now_millis();
        let reason = reason.to_string();
        self.mutate(queue, |entries| match entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.last_error = Some(reason.clone());
                entry.state = EntryState::NeedsAttention {
                    reason,
                    status,
                    flagged_at,
                };
                (true, true)
            }
            None => (false, false),
        })
        .await
    }

    /// Return a flagged entry to automatic replay with a fresh attempt budget.
    pub async fn requeue(&self, queue: QueueName, id: EntryId) -> Result<bool, StorageError> {
        self.mutate(queue, |entries| match entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.state = EntryState::Pending;
                entry.attempt_count = 0;
                entry.next_attempt_at = 0;
                (true, true)
            }
            None => (false, false),
        })
        .await
    }

    /// Entries eligible for automatic replay in one queue.
    pub async fn pending_count(&self, queue: QueueName) -> Result<usize, StorageError> {
        Ok(self.list(queue).await?.iter().filter(|e| e.is_pending()).count())
    }

    pub async fn pending_total(&self) -> Result<usize, StorageError> {
        let mut total = 0;
        for queue in QueueName::ALL {
            total += self.pending_count(queue).await?;
        }
        Ok(total)
    }

    /// Flagged entries across all queues.
    pub async fn needs_attention(&self) -> Result<Vec<QueueEntry>, StorageError> {
        let mut flagged = Vec::new();
        for queue in QueueName::ALL {
            flagged.extend(self.list(queue).await?.into_iter().filter(|e| e.needs_attention()));
        }
        Ok(flagged)
    }
}
