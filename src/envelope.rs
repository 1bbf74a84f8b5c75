// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Versioned wrapper for every persisted record.
//!
//! ```text
//! {"v": 1, "data": <record>}
//! ```
//!
//! Records written before versioning existed are bare JSON (no envelope).
//! They decode as version 0 and are rewritten in the current format on the
//! next write. A version newer than [`CURRENT_VERSION`] is refused: this
//! build cannot know what the extra fields mean, so it fails closed.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::traits::StorageError;

pub const CURRENT_VERSION: u32 = 1;

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    v: u32,
    data: &'a T,
}

#[derive(Deserialize)]
struct EnvelopeOwned {
    v: u32,
    data: Value,
}

/// A decoded record plus the version it was stored with.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<T> {
    pub record: T,
    pub version: u32,
}

impl<T> Decoded<T> {
    /// Whether the stored bytes predate the current format.
    #[must_use]
    pub fn needs_migration(&self) -> bool {
        self.version < CURRENT_VERSION
    }
}

pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, StorageError> {
    let envelope = EnvelopeRef {
        v: CURRENT_VERSION,
        data: record,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

pub fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<Decoded<T>, StorageError> {
    let raw: Value = serde_json::from_slice(bytes).map_err(|e| StorageError::Corruption {
        key: key.to_string(),
        reason: format!("not valid JSON: {}", e),
    })?;

    if is_enveloped(&raw) {
        let envelope: EnvelopeOwned =
            serde_json::from_value(raw).map_err(|e| StorageError::Corruption {
                key: key.to_string(),
                reason: format!("bad envelope: {}", e),
            })?;

        if envelope.v > CURRENT_VERSION {
            return Err(StorageError::Corruption {
                key: key.to_string(),
                reason: format!(
                    "record version {} is newer than supported version {}",
                    envelope.v, CURRENT_VERSION
                ),
            });
        }

        let record = serde_json::from_value(envelope.data).map_err(|e| StorageError::Corruption {
            key: key.to_string(),
            reason: format!("bad v{} record: {}", envelope.v, e),
        })?;
        return Ok(Decoded {
            record,
            version: envelope.v,
        });
    }

    // Legacy: bare record, no version tag
    let record = serde_json::from_value(raw).map_err(|e| StorageError::Corruption {
        key: key.to_string(),
        reason: format!("bad legacy record: {}", e),
    })?;
    Ok(Decoded { record, version: 0 })
}

fn is_enveloped(raw: &Value) -> bool {
    match raw.as_object() {
        Some(obj) => obj.len() == 2 && obj.contains_key("v") && obj.contains_key("data"),
        None => false,
    }
}
