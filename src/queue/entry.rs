// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Queue entry data model.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// The closed set of mutation kinds. One queue per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    /// Approve or reject a routed request
    ApprovalAction,
    /// Submit (or update) a form response with its answers
    FormResponse,
    /// Attach a captured signature
    Signature,
    /// Generate a serial number for a form
    SerialGeneration,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        QueueName::ApprovalAction,
        QueueName::FormResponse,
        QueueName::Signature,
        QueueName::SerialGeneration,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApprovalAction => "approval-action",
            Self::FormResponse => "form-response",
            Self::Signature => "signature",
            Self::SerialGeneration => "serial-generation",
        }
    }

    /// Durable-store key holding this queue's entries.
    #[must_use]
    pub fn store_key(&self) -> String {
        format!("queue/{}", self.as_str())
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| format!("unknown queue name: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub Uuid);

impl EntryId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A local file to upload with the mutation. Resolved at replay time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub local_uri: String,
    pub declared_name: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EntryState {
    /// Eligible for automatic replay
    Pending,
    /// Dead letter: kept and listed, but no longer replayed automatically
    NeedsAttention {
        reason: String,
        /// HTTP status of the rejection, when there was one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        flagged_at: i64,
    },
}

/// Everything the caller supplies to enqueue a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub payload: Value,
    pub attachments: Vec<Attachment>,
    pub target_id: Option<String>,
}

impl NewEntry {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            attachments: Vec::new(),
            target_id: None,
        }
    }

    #[must_use]
    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    #[must_use]
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

/// One pending mutation.
///
/// `id`, `queue_name`, `payload`, `payload_hash`, `attachments` and
/// `created_at` never change after enqueue. Replay bookkeeping (`attempt_count`,
/// `last_error`, `cursor`, `next_attempt_at`, `state`) and a `target_id`
/// assigned by a create step are the only mutable parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: EntryId,
    pub queue_name: QueueName,
    pub payload: Value,
    pub payload_hash: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub target_id: Option<String>,
    pub created_at: i64,
    #[serde(default)]
    pub attempt_count: u32,
    /// Sub-steps already acknowledged by the remote endpoint
    #[serde(default)]
    pub cursor: u32,
    /// Earliest time a periodic drain may retry this entry (epoch millis)
    #[serde(default)]
    pub next_attempt_at: i64,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(flatten)]
    pub state: EntryState,
}

impl QueueEntry {
    pub fn new(queue_name: QueueName, entry: NewEntry, created_at: i64) -> Self {
        let payload_hash = payload_digest(&entry.payload);
        Self {
            id: EntryId::new(),
            queue_name,
            payload: entry.payload,
            payload_hash,
            attachments: entry.attachments,
            target_id: entry.target_id,
            created_at,
            attempt_count: 0,
            cursor: 0,
            next_attempt_at: 0,
            last_error: None,
            state: EntryState::Pending,
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self.state, EntryState::Pending)
    }

    #[must_use]
    pub fn needs_attention(&self) -> bool {
        matches!(self.state, EntryState::NeedsAttention { .. })
    }

    /// Whether the stored payload still matches the digest taken at enqueue.
    #[must_use]
    pub fn payload_intact(&self) -> bool {
        payload_digest(&self.payload) == self.payload_hash
    }
}

/// SHA-256 over the payload's serialized bytes, hex encoded.
pub fn payload_digest(payload: &Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_queue_name_round_trips_through_str() {
        for name in QueueName::ALL {
            assert_eq!(name.as_str().parse::<QueueName>().unwrap(), name);
        }
        assert!("approvals".parse::<QueueName>().is_err());
    }

    #[test]
    fn test_queue_name_serde_matches_as_str() {
        let json = serde_json::to_string(&QueueName::ApprovalAction).unwrap();
        assert_eq!(json, "\"approval-action\"");
    }

    #[test]
    fn test_store_key() {
        assert_eq!(QueueName::Signature.store_key(), "queue/signature");
    }

    #[test]
    fn test_new_entry_starts_pending() {
        let entry = QueueEntry::new(
            QueueName::ApprovalAction,
            NewEntry::new(json!({"response_id": 42, "status": "aprobado"})).with_target("42"),
            1_000,
        );

        assert!(entry.is_pending());
        assert_eq!(entry.attempt_count, 0);
        assert_eq!(entry.cursor, 0);
        assert_eq!(entry.target_id.as_deref(), Some("42"));
        assert!(entry.payload_intact());
    }

    #[test]
    fn test_tampered_payload_detected() {
        let mut entry = QueueEntry::new(QueueName::Signature, NewEntry::new(json!({"a": 1})), 0);
        entry.payload = json!({"a": 2});
        assert!(!entry.payload_intact());
    }

    #[test]
    fn test_entry_serde_flattens_state() {
        let mut entry = QueueEntry::new(QueueName::Signature, NewEntry::new(json!({})), 0);
        entry.state = EntryState::NeedsAttention {
            reason: "rejected".into(),
            status: Some(422),
            flagged_at: 5,
        };

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["state"], json!("needs_attention"));
        assert_eq!(value["status"], json!(422));

        let back: QueueEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back, entry);
    }
}
