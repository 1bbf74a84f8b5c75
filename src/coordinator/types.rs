//! Public types for the engine facade.

use crate::cache::{CacheClass, CacheError};
use crate::queue::{EntryId, NewEntry, QueueName};
use crate::reconcile::CacheUpdate;
use crate::remote::{RemoteResponse, TransportError};
use crate::storage::traits::StorageError;

/// Engine lifecycle state.
///
/// Use [`super::SyncEngine::state()`] to check the current state or
/// [`super::SyncEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built, run loop not started. Submissions already work.
    Created,
    /// Run loop active
    Running,
    /// Drains cancelled, no new submissions accepted
    ShuttingDown,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

/// A user intent to change remote state.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub queue: QueueName,
    pub entry: NewEntry,
    /// What the UI should show while the mutation waits in the queue
    pub optimistic: Option<CacheUpdate>,
}

impl Mutation {
    pub fn new(queue: QueueName, entry: NewEntry) -> Self {
        Self {
            queue,
            entry,
            optimistic: None,
        }
    }

    #[must_use]
    pub fn with_optimistic(mut self, key: impl Into<String>, class: CacheClass, value: serde_json::Value) -> Self {
        self.optimistic = Some(CacheUpdate {
            key: key.into(),
            class,
            value,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The remote side acknowledged every step right away
    Applied(RemoteResponse),
    /// Persisted for later replay
    Queued(EntryId),
}

impl SubmitOutcome {
    #[must_use]
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued(_))
    }
}

/// Errors surfaced by the engine API.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The remote side refused the mutation. Not queued, not retried.
    #[error("rejected by remote (status {status:?}): {message}")]
    Rejected { status: Option<u16>, message: String },

    #[error("nothing cached for key {key}")]
    NotCached { key: String },

    #[error("entry {id} not found in {queue}")]
    EntryNotFound { queue: QueueName, id: EntryId },

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<CacheError> for SyncError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::NotCached { key } => Self::NotCached { key },
            CacheError::Storage(e) => Self::Storage(e),
            CacheError::Timeout(after) => Self::Transport(TransportError::Timeout(after)),
            CacheError::Fetch(msg) => Self::Transport(TransportError::Connection(msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cache_errors_map_onto_engine_errors() {
        let err: SyncError = CacheError::NotCached { key: "k".into() }.into();
        assert!(matches!(err, SyncError::NotCached { key } if key == "k"));

        let err: SyncError = CacheError::Fetch("down".into()).into();
        assert!(matches!(err, SyncError::Transport(TransportError::Connection(_))));
    }

    #[test]
    fn test_mutation_builder() {
        let mutation = Mutation::new(QueueName::ApprovalAction, NewEntry::new(json!({})))
            .with_optimistic("approval-42", CacheClass::Detail, json!({"status": "aprobado"}));
        assert_eq!(mutation.optimistic.unwrap().key, "approval-42");
    }

    #[test]
    fn test_rejected_display() {
        let err = SyncError::Rejected {
            status: Some(422),
            message: "already decided".into(),
        };
        assert!(err.to_string().contains("already decided"));
    }
}
