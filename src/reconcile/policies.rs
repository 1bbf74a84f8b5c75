// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use serde_json::Value;

use super::{CacheUpdate, PolicyError, ReconciliationPolicy, Step, StepKind};
use crate::cache::CacheClass;
use crate::queue::{QueueEntry, QueueName};
use crate::remote::RemoteResponse;

/// Prefer the server's view; fall back to what we sent.
fn authoritative(entry: &QueueEntry, response: &RemoteResponse) -> Value {
    if response.body.is_null() {
        entry.payload.clone()
    } else {
        response.body.clone()
    }
}

/// Ids come back as numbers or strings depending on the endpoint.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn without_keys(payload: &Value, keys: &[&str]) -> Value {
    match payload {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !keys.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Approve or reject: `POST approvals/{id}/status`.
///
/// The target is the entry's `target_id`, or `response_id` in the payload.
pub struct ApprovalActionPolicy;

impl ApprovalActionPolicy {
    fn target(entry: &QueueEntry) -> Option<String> {
        entry
            .target_id
            .clone()
            .or_else(|| id_string(&entry.payload["response_id"]))
    }
}

impl ReconciliationPolicy for ApprovalActionPolicy {
    fn queue(&self) -> QueueName {
        QueueName::ApprovalAction
    }

    fn steps(&self, entry: &QueueEntry) -> Result<Vec<Step>, PolicyError> {
        let target = Self::target(entry).ok_or_else(|| PolicyError {
            queue: QueueName::ApprovalAction,
            reason: "no target id and no response_id in payload".into(),
        })?;
        Ok(vec![Step::post(
            0,
            StepKind::UpdateApprovalStatus,
            format!("approvals/{}/status", target),
            entry.payload.clone(),
        )])
    }

    fn fold(&self, entry: &QueueEntry, response: &RemoteResponse) -> Option<CacheUpdate> {
        Some(CacheUpdate {
            key: format!("approval-{}", Self::target(entry)?),
            class: CacheClass::Detail,
            value: authoritative(entry, response),
        })
    }
}

/// Form submission in up to three steps:
///
/// 0. `save-response` creates the response (skipped when `target_id` was given)
/// 1. `save-answers` uploads answers plus attachments
/// 2. `associate-serials` links serials, only when the payload has `file_serials`
pub struct FormResponsePolicy;

impl FormResponsePolicy {
    const SAVE_RESPONSE: u32 = 0;
    const SAVE_ANSWERS: u32 = 1;
    const ASSOCIATE_SERIALS: u32 = 2;

    fn has_serials(payload: &Value) -> bool {
        payload["file_serials"]
            .as_array()
            .is_some_and(|serials| !serials.is_empty())
    }
}

impl ReconciliationPolicy for FormResponsePolicy {
    fn queue(&self) -> QueueName {
        QueueName::FormResponse
    }

    fn steps(&self, entry: &QueueEntry) -> Result<Vec<Step>, PolicyError> {
        let Some(ref response_id) = entry.target_id else {
            if entry.cursor > Self::SAVE_RESPONSE {
                return Err(PolicyError {
                    queue: QueueName::FormResponse,
                    reason: "response was created but no id came back".into(),
                });
            }
            // Later steps need the id the create step returns
            return Ok(vec![Step::post(
                Self::SAVE_RESPONSE,
                StepKind::SaveResponse,
                "responses",
                without_keys(&entry.payload, &["answers", "file_serials"]),
            )]);
        };

        let answers = entry.payload.get("answers").cloned().unwrap_or(Value::Array(Vec::new()));
        let mut steps = vec![Step::post(
            Self::SAVE_ANSWERS,
            StepKind::SaveAnswers,
            format!("responses/{}/answers", response_id),
            serde_json::json!({ "answers": answers }),
        )
        .with_attachments()];

        if Self::has_serials(&entry.payload) {
            steps.push(Step::post(
                Self::ASSOCIATE_SERIALS,
                StepKind::AssociateSerials,
                format!("responses/{}/serials", response_id),
                serde_json::json!({ "file_serials": entry.payload["file_serials"] }),
            ));
        }
        Ok(steps)
    }

    fn created_target(&self, step: &Step, response: &RemoteResponse) -> Option<String> {
        if step.kind != StepKind::SaveResponse {
            return None;
        }
        id_string(&response.body["id"])
    }

    fn fold(&self, entry: &QueueEntry, response: &RemoteResponse) -> Option<CacheUpdate> {
        Some(CacheUpdate {
            key: format!("response-{}", entry.target_id.as_ref()?),
            class: CacheClass::Detail,
            value: authoritative(entry, response),
        })
    }
}

/// `POST signatures` with the captured image attached.
pub struct SignaturePolicy;

impl ReconciliationPolicy for SignaturePolicy {
    fn queue(&self) -> QueueName {
        QueueName::Signature
    }

    fn steps(&self, entry: &QueueEntry) -> Result<Vec<Step>, PolicyError> {
        Ok(vec![Step::post(
            0,
            StepKind::UploadSignature,
            "signatures",
            entry.payload.clone(),
        )
        .with_attachments()])
    }

    fn fold(&self, _entry: &QueueEntry, _response: &RemoteResponse) -> Option<CacheUpdate> {
        None
    }
}

/// `POST serials`.
pub struct SerialGenerationPolicy;

impl ReconciliationPolicy for SerialGenerationPolicy {
    fn queue(&self) -> QueueName {
        QueueName::SerialGeneration
    }

    fn steps(&self, entry: &QueueEntry) -> Result<Vec<Step>, PolicyError> {
        Ok(vec![Step::post(
            0,
            StepKind::GenerateSerial,
            "serials",
            entry.payload.clone(),
        )])
    }

    fn fold(&self, entry: &QueueEntry, response: &RemoteResponse) -> Option<CacheUpdate> {
        let suffix = entry.target_id.clone().unwrap_or_else(|| entry.id.to_string());
        Some(CacheUpdate {
            key: format!("serial-{}", suffix),
            class: CacheClass::Detail,
            value: authoritative(entry, response),
        })
    }
}
