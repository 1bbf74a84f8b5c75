// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! How each kind of queued mutation is replayed.
//!
//! A policy turns an entry into its ordered remote steps, decides what an
//! HTTP status means, and says what the cache should look like afterwards.
//!
//! Steps carry a fixed `index`. An entry's `cursor` is the number of steps
//! the remote side has acknowledged, so replay resumes at the first step
//! whose index is `>= cursor`. Steps that need an id produced by an earlier
//! create step are only returned once `target_id` is known, which is why the
//! drain asks for the steps again after every acknowledged step.

mod policies;

pub use policies::{
    ApprovalActionPolicy, FormResponsePolicy, SerialGenerationPolicy, SignaturePolicy,
};

use serde_json::Value;

use crate::cache::CacheClass;
use crate::queue::{QueueEntry, QueueName};
use crate::remote::{Method, RemoteResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    UpdateApprovalStatus,
    SaveResponse,
    SaveAnswers,
    AssociateSerials,
    UploadSignature,
    GenerateSerial,
}

impl StepKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpdateApprovalStatus => "update-approval-status",
            Self::SaveResponse => "save-response",
            Self::SaveAnswers => "save-answers",
            Self::AssociateSerials => "associate-serials",
            Self::UploadSignature => "upload-signature",
            Self::GenerateSerial => "generate-serial",
        }
    }
}

/// One remote request of a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub index: u32,
    pub kind: StepKind,
    pub method: Method,
    pub path: String,
    pub body: Value,
    /// Send the entry's attachments with this step
    pub with_attachments: bool,
}

impl Step {
    pub fn post(index: u32, kind: StepKind, path: impl Into<String>, body: Value) -> Self {
        Self {
            index,
            kind,
            method: Method::Post,
            path: path.into(),
            body,
            with_attachments: false,
        }
    }

    #[must_use]
    pub fn with_attachments(mut self) -> Self {
        self.with_attachments = true;
        self
    }

    /// `{entry_id}:{step_index}`. Stable across replays of the same step.
    #[must_use]
    pub fn idempotency_key(&self, entry: &QueueEntry) -> String {
        format!("{}:{}", entry.id, self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Success,
    /// Try again later; the entry stays queued
    Retryable,
    /// The remote side refused it; retrying won't help
    Permanent,
}

/// Authoritative state to write into the cache after a successful replay.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheUpdate {
    pub key: String,
    pub class: CacheClass,
    pub value: Value,
}

/// The entry can't be turned into requests at all.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("cannot build request for {queue}: {reason}")]
pub struct PolicyError {
    pub queue: QueueName,
    pub reason: String,
}

/// 2xx success; 408, 425, 429 and 5xx retryable; every other status permanent.
#[must_use]
pub fn default_classify(status: u16) -> Disposition {
    match status {
        200..=299 => Disposition::Success,
        408 | 425 | 429 | 500..=599 => Disposition::Retryable,
        _ => Disposition::Permanent,
    }
}

pub trait ReconciliationPolicy: Send + Sync {
    fn queue(&self) -> QueueName;

    /// Every step applicable to the entry as it stands, in order.
    fn steps(&self, entry: &QueueEntry) -> Result<Vec<Step>, PolicyError>;

    fn classify(&self, status: u16) -> Disposition {
        default_classify(status)
    }

    /// Id of an entity created by `step`, taken from its response.
    fn created_target(&self, _step: &Step, _response: &RemoteResponse) -> Option<String> {
        None
    }

    /// Cache state once every step has been acknowledged. `response` is the last step's.
    fn fold(&self, entry: &QueueEntry, response: &RemoteResponse) -> Option<CacheUpdate>;
}

/// The policy for a queue.
#[must_use]
pub fn policy_for(queue: QueueName) -> &'static dyn ReconciliationPolicy {
    match queue {
        QueueName::ApprovalAction => &ApprovalActionPolicy,
        QueueName::FormResponse => &FormResponsePolicy,
        QueueName::Signature => &SignaturePolicy,
        QueueName::SerialGeneration => &SerialGenerationPolicy,
    }
}

/// First step still to send, given what the entry has had acknowledged.
pub fn next_step(
    policy: &dyn ReconciliationPolicy,
    entry: &QueueEntry,
) -> Result<Option<Step>, PolicyError> {
    Ok(policy
        .steps(entry)?
        .into_iter()
        .find(|step| step.index >= entry.cursor))
}
