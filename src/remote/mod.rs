// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The remote API as seen by the engine.
//!
//! [`RemoteEndpoint::send`] returns `Ok` for any HTTP response, including
//! 4xx and 5xx. `Err` means the request never got a response at all.
//! Deciding what a status means is the reconciliation policy's job.

pub mod attachments;
pub mod http;

pub use attachments::{AttachmentError, AttachmentResolver, FsAttachmentResolver, ResolvedAttachment};
pub use http::HttpEndpoint;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub method: Method,
    /// Relative to the endpoint's base URL
    pub path: String,
    pub body: Option<Value>,
    /// When non-empty the request goes out as multipart
    pub attachments: Vec<ResolvedAttachment>,
    /// Lets the remote side drop a step it has already applied
    pub idempotency_key: Option<String>,
}

impl RemoteRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            attachments: Vec::new(),
            idempotency_key: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_attachments(mut self, attachments: Vec<ResolvedAttachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    pub status: u16,
    /// Parsed JSON, a JSON string for non-JSON text, or `Null` when empty
    pub body: Value,
}

impl RemoteResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Human-readable error text from a `{"error": ..}` or `{"message": ..}` body.
    #[must_use]
    pub fn error_message(&self) -> String {
        self.body["error"]
            .as_str()
            .or_else(|| self.body["message"].as_str())
            .or_else(|| self.body.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {}", self.status))
    }
}

/// The request got no HTTP response.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("circuit breaker open, remote call skipped")]
    CircuitOpen,

    /// The request could not be built from the entry. Sending it again won't help.
    #[error("attachment {name} rejected: {reason}")]
    InvalidAttachment { name: String, reason: String },
}

impl TransportError {
    /// Whether a later replay could succeed.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::InvalidAttachment { .. })
    }
}

#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    async fn send(&self, request: &RemoteRequest) -> Result<RemoteResponse, TransportError>;
}
