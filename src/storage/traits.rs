// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Corrupt record at '{key}': {reason}")]
    Corruption {
        key: String,
        reason: String,
    },
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key/value primitive the engine persists everything through.
///
/// Values are opaque bytes to the store. Implementations must make `set`
/// durable before returning; the queue relies on that for its
/// persisted-before-ack guarantee.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// All keys starting with `prefix`, in ascending order.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}
