// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! `reqwest` implementation of [`RemoteEndpoint`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use tracing::debug;

use super::{Method, RemoteEndpoint, RemoteRequest, RemoteResponse, TransportError};

/// Talks to the forms API over HTTPS.
///
/// Sends `Authorization: Bearer <token>` when a token is set and
/// `Idempotency-Key` when the request carries one. Requests with
/// attachments go out as multipart: a `payload` JSON part followed by one
/// `files` part per attachment.
#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    base_url: String,
    http: Client,
    api_token: Option<String>,
    timeout: Duration,
}

impl HttpEndpoint {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let base_url = base_url.into();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(TransportError::Connection(format!(
                "base URL must start with http:// or https://, got: {}",
                base_url
            )));
        }

        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        Ok(Self {
            base_url,
            http,
            api_token: None,
            timeout,
        })
    }

    #[must_use]
    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        let path = path.strip_prefix('/').unwrap_or(path);
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn builder(&self, request: &RemoteRequest) -> Result<RequestBuilder, TransportError> {
        let url = self.url(&request.path);
        let mut builder = match request.method {
            Method::Get => self.http.get(&url),
            Method::Post => self.http.post(&url),
            Method::Put => self.http.put(&url),
            Method::Patch => self.http.patch(&url),
            Method::Delete => self.http.delete(&url),
        };

        if let Some(ref token) = self.api_token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        if let Some(ref key) = request.idempotency_key {
            builder = builder.header("Idempotency-Key", key);
        }

        if request.attachments.is_empty() {
            if let Some(ref body) = request.body {
                builder = builder.json(body);
            }
            return Ok(builder);
        }

        let mut form = Form::new();
        if let Some(ref body) = request.body {
            let payload = Part::text(body.to_string())
                .mime_str("application/json")
                .map_err(|e| TransportError::Connection(e.to_string()))?;
            form = form.part("payload", payload);
        }
        for attachment in &request.attachments {
            let part = Part::bytes(attachment.bytes.clone())
                .file_name(attachment.declared_name.clone())
                .mime_str(&attachment.mime_type)
                .map_err(|e| TransportError::InvalidAttachment {
                    name: attachment.declared_name.clone(),
                    reason: format!("mime type {:?}: {}", attachment.mime_type, e),
                })?;
            form = form.part("files", part);
        }
        Ok(builder.multipart(form))
    }

    fn map_error(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else {
            TransportError::Connection(err.to_string())
        }
    }
}

fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

#[async_trait]
impl RemoteEndpoint for HttpEndpoint {
    async fn send(&self, request: &RemoteRequest) -> Result<RemoteResponse, TransportError> {
        let response = self
            .builder(request)?
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| self.map_error(e))?;
        debug!(method = %request.method, path = %request.path, status, "Remote call completed");

        Ok(RemoteResponse::new(status, parse_body(&text)))
    }
}
