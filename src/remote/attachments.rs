// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Turning queued attachment references into bytes at replay time.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::queue::Attachment;

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAttachment {
    pub declared_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AttachmentError {
    /// The file is gone. Replaying later won't bring it back.
    #[error("attachment missing: {uri}")]
    Missing { uri: String },

    #[error("attachment {uri} unreadable: {reason}")]
    Io { uri: String, reason: String },
}

impl AttachmentError {
    /// Whether another replay could succeed.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Missing { .. })
    }
}

#[async_trait]
pub trait AttachmentResolver: Send + Sync {
    async fn resolve(&self, attachment: &Attachment) -> Result<ResolvedAttachment, AttachmentError>;
}

/// Reads `file://` URIs and plain paths from the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct FsAttachmentResolver;

impl FsAttachmentResolver {
    fn path_for(uri: &str) -> PathBuf {
        PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri))
    }
}

#[async_trait]
impl AttachmentResolver for FsAttachmentResolver {
    async fn resolve(&self, attachment: &Attachment) -> Result<ResolvedAttachment, AttachmentError> {
        let path = Self::path_for(&attachment.local_uri);
        let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AttachmentError::Missing {
                uri: attachment.local_uri.clone(),
            },
            _ => AttachmentError::Io {
                uri: attachment.local_uri.clone(),
                reason: e.to_string(),
            },
        })?;

        Ok(ResolvedAttachment {
            declared_name: attachment.declared_name.clone(),
            mime_type: attachment.mime_type.clone(),
            bytes,
        })
    }
}
