// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed durable store.
//!
//! One table, one row per key:
//! ```sql
//! CREATE TABLE kv_store (
//!   store_key TEXT PRIMARY KEY,
//!   store_value BLOB NOT NULL,
//!   updated_at INTEGER NOT NULL  -- epoch millis, diagnostics only
//! )
//! ```
//!
//! The database runs in WAL journal mode with `synchronous = FULL` on every
//! pooled connection, so a completed `set` survives both process death and
//! power loss. Queue writes depend on that.

use async_trait::async_trait;
use sqlx::{AnyPool, Row, any::AnyPoolOptions};
use std::path::Path;
use std::sync::Once;
use std::time::Duration;
use tracing::info;

use super::traits::{DurableStore, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub struct SqliteStore {
    pool: AnyPool,
}

impl SqliteStore {
    /// Open (or create) a store file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let url = format!("sqlite://{}?mode=rwc", path.as_ref().to_string_lossy());
        Self::connect(&url).await
    }

    /// Connect with startup-mode retry (fails fast if the URL is wrong).
    pub async fn connect(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        if !connection_string.starts_with("sqlite:") {
            return Err(StorageError::Backend(format!(
                "Only sqlite URLs are supported for the durable store, got: {}",
                connection_string
            )));
        }

        info!(url = %connection_string, "Opening durable store");

        let pool = retry("store_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(4)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .after_connect(|conn, _meta| {
                    Box::pin(async move {
                        sqlx::query("PRAGMA synchronous = FULL")
                            .execute(&mut *conn)
                            .await?;
                        Ok(())
                    })
                })
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool };
        store.enable_wal_mode().await?;
        store.init_schema().await?;
        Ok(store)
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let sql = r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                store_key TEXT PRIMARY KEY,
                store_value BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            )
        "#;

        retry("store_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        Ok(())
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let row = sqlx::query("SELECT store_value FROM kv_store WHERE store_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        match row {
            Some(row) => {
                let value: Vec<u8> = row
                    .try_get("store_value")
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO kv_store (store_key, store_value, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(store_key) DO UPDATE SET \
             store_value = excluded.store_value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value.to_vec())
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM kv_store WHERE store_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        // substr() instead of LIKE so '%' and '_' in keys need no escaping
        let rows = sqlx::query(
            "SELECT store_key FROM kv_store WHERE substr(store_key, 1, ?) = ? ORDER BY store_key",
        )
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("store_key")
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .collect()
    }
}
