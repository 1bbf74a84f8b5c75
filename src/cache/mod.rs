// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Last-known-good read cache.
//!
//! Every remote read the app shows is written here under `cache/{key}`.
//! A record past its TTL is still served, flagged with `is_stale`, and
//! refreshed in the background. A record is only ever overwritten (last
//! write wins) or removed by an explicit invalidate. Expiry never deletes.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::envelope;
use crate::storage::traits::{DurableStore, StorageError};

const KEY_PREFIX: &str = "cache/";

/// Selects the freshness window of a cached record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheClass {
    /// Collections that change often (approval inbox, response lists)
    List,
    /// A single entity
    Detail,
    /// Form designs, which change rarely
    FormDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub key: String,
    pub value: Value,
    pub class: CacheClass,
    pub written_at: i64,
}

/// What a read hands back to the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub value: Value,
    /// Older than its class TTL. A display hint, the value is still usable.
    pub is_stale: bool,
    pub written_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("nothing cached for key {key}")]
    NotCached { key: String },

    #[error("live fetch failed: {0}")]
    Fetch(String),

    #[error("live fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct CacheLayer {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    config: RwLock<SyncConfig>,
}

impl CacheLayer {
    pub fn new(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>, config: &SyncConfig) -> Self {
        Self {
            store,
            clock,
            config: RwLock::new(config.clone()),
        }
    }

    /// Pick up new TTLs and fetch timeout.
    pub fn apply_config(&self, config: &SyncConfig) {
        *self.config.write() = config.clone();
    }

    fn store_key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }

    fn is_stale(&self, record: &CacheRecord) -> bool {
        let ttl = self.config.read().ttl_for(record.class);
        let age_ms = self.clock.now_millis().saturating_sub(record.written_at);
        age_ms < 0 || age_ms as u128 >= ttl.as_millis()
    }

    async fn load(&self, key: &str) -> Result<Option<CacheRecord>, StorageError> {
        let store_key = Self::store_key(key);
        let Some(bytes) = self.store.get(&store_key).await? else {
            return Ok(None);
        };

        match envelope::decode::<CacheRecord>(&store_key, &bytes) {
            Ok(decoded) => Ok(Some(decoded.record)),
            Err(StorageError::Corruption { key, reason }) => {
                error!(key = %key, reason = %reason, "Corrupt cache record, treating as absent");
                crate::metrics::record_corruption(&key);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn to_cached(&self, record: CacheRecord) -> CachedValue {
        let is_stale = self.is_stale(&record);
        CachedValue {
            value: record.value,
            is_stale,
            written_at: record.written_at,
        }
    }

    /// Last-known-good value for `key`.
    pub async fn read(&self, key: &str) -> Result<CachedValue, CacheError> {
        match self.load(key).await? {
            Some(record) => {
                let cached = self.to_cached(record);
                crate::metrics::record_cache_read(if cached.is_stale { "stale" } else { "fresh" });
                Ok(cached)
            }
            None => {
                crate::metrics::record_cache_read("miss");
                Err(CacheError::NotCached { key: key.to_string() })
            }
        }
    }

    pub async fn write(&self, key: &str, class: CacheClass, value: Value) -> Result<(), CacheError> {
        let record = CacheRecord {
            key: key.to_string(),
            value,
            class,
            written_at: self.clock.now_millis(),
        };
        let bytes = envelope::encode(&record)?;
        self.store.set(&Self::store_key(key), &bytes).await?;
        debug!(key = %key, class = ?class, "Cache record written");
        Ok(())
    }

    pub async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.store.remove(&Self::store_key(key)).await?;
        Ok(())
    }

    /// Drop every cached record. Returns how many were removed.
    pub async fn invalidate_all(&self) -> Result<usize, CacheError> {
        let keys = self.store.keys_with_prefix(KEY_PREFIX).await?;
        for key in &keys {
            self.store.remove(key).await?;
        }
        debug!(count = keys.len(), "Cache cleared");
        Ok(keys.len())
    }

    /// Serve cached records without waiting on the network.
    ///
    /// A fresh record is returned as is. A stale one is returned at once and
    /// refreshed in the background. Only a miss waits on `fetch`, bounded by
    /// the request timeout.
    pub async fn read_through<F, Fut, E>(
        self: &Arc<Self>,
        key: &str,
        class: CacheClass,
        fetch: F,
    ) -> Result<CachedValue, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        if let Some(cached) = self.load(key).await?.map(|record| self.to_cached(record)) {
            if cached.is_stale {
                debug!(key = %key, "Serving stale record, refreshing in background");
                crate::metrics::record_cache_fallback();
                self.refresh_in_background(key, class, fetch);
            } else {
                crate::metrics::record_cache_read("fresh");
            }
            return Ok(cached);
        }

        let timeout = self.config.read().request_timeout();
        let value = match tokio::time::timeout(timeout, fetch()).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                crate::metrics::record_cache_read("miss");
                return Err(CacheError::Fetch(e.to_string()));
            }
            Err(_) => {
                crate::metrics::record_cache_read("miss");
                warn!(key = %key, ?timeout, "Live fetch timed out with nothing cached");
                return Err(CacheError::Timeout(timeout));
            }
        };

        self.write(key, class, value.clone()).await?;
        Ok(CachedValue {
            value,
            is_stale: false,
            written_at: self.clock.now_millis(),
        })
    }

    /// Best-effort refresh of a stale record. Failures are logged only.
    pub fn refresh_in_background<F, Fut, E>(
        self: &Arc<Self>,
        key: impl Into<String>,
        class: CacheClass,
        fetch: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let cache = Arc::clone(self);
        let key = key.into();
        tokio::spawn(async move {
            let timeout = cache.config.read().request_timeout();
            match tokio::time::timeout(timeout, fetch()).await {
                Ok(Ok(value)) => {
                    if let Err(e) = cache.write(&key, class, value).await {
                        warn!(key = %key, error = %e, "Background refresh could not persist");
                    }
                }
                Ok(Err(e)) => debug!(key = %key, error = %e, "Background refresh failed"),
                Err(_) => debug!(key = %key, ?timeout, "Background refresh timed out"),
            }
        })
    }
}
