// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed HTTP/JSON client for the policy backend.
//!
//! The backend owns the board's source of truth; the supervisor only ever
//! reaches it through this surface. Every response must be a JSON object, and
//! every failure carries a stable code the classifier can reduce.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Backend request failure.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Network unreachable, DNS failure, connection reset, deadline exceeded.
    #[error("backend request failed: {reason}")]
    Unreachable { reason: String },
    /// Backend answered with HTTP >= 400; payload retained for diagnostics.
    #[error("backend returned HTTP {status}")]
    Status { status: u16, payload: Value },
    /// Backend answered 2xx/3xx with something other than a JSON object.
    #[error("backend JSON payload must be an object")]
    InvalidPayload { status: u16, payload: Value },
}

impl HttpError {
    /// Stable wire code, recorded in events and the ledger.
    pub fn code(&self) -> &'static str {
        match self {
            HttpError::Unreachable { .. } => "backend_unreachable",
            HttpError::Status { .. } => "backend_http_error",
            HttpError::InvalidPayload { .. } => "backend_invalid_payload",
        }
    }

    /// HTTP status, 0 when the request never completed.
    pub fn status_code(&self) -> u16 {
        match self {
            HttpError::Unreachable { .. } => 0,
            HttpError::Status { status, .. } | HttpError::InvalidPayload { status, .. } => *status,
        }
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            HttpError::Unreachable { .. } => None,
            HttpError::Status { payload, .. } | HttpError::InvalidPayload { payload, .. } => {
                Some(payload)
            }
        }
    }
}

/// The backend surface the supervisor core depends on. `get_json`/`post_json`
/// are the transport; the named calls are the contract.
#[async_trait]
pub trait BackendApi: Send + Sync {
    fn base_url(&self) -> &str;

    async fn get_json(&self, path: &str, params: &[(&str, &str)]) -> Result<Value, HttpError>;

    async fn post_json(&self, path: &str, body: Value) -> Result<Value, HttpError>;

    async fn preflight_orchestrator(&self) -> Result<Value, HttpError> {
        self.get_json("/internal/preflight", &[("role", "ORCHESTRATOR")]).await
    }

    async fn agent_context(&self, role: &str) -> Result<Value, HttpError> {
        self.get_json("/internal/agent-context", &[("role", role)]).await
    }

    async fn project_items_metadata(&self, sprint: &str) -> Result<Value, HttpError> {
        self.get_json(
            "/internal/metadata/project-items",
            &[("role", "ORCHESTRATOR"), ("sprint", sprint)],
        )
        .await
    }

    async fn post_field_update(&self, body: Value) -> Result<Value, HttpError> {
        self.post_json("/internal/project-item/update-field", body).await
    }

    async fn post_plan_apply(&self, draft: Value) -> Result<Value, HttpError> {
        self.post_json(
            "/internal/plan-apply",
            serde_json::json!({ "role": "ORCHESTRATOR", "draft": draft }),
        )
        .await
    }

    async fn post_resolve_linked_pr(&self, body: Value) -> Result<Value, HttpError> {
        self.post_json("/internal/reviewer/resolve-linked-pr", body).await
    }

    /// Fire-and-forget transcript chunk. Callers swallow the error.
    async fn post_transcript_event(&self, body: Value) -> Result<Value, HttpError> {
        self.post_json("/internal/logs/events", body).await
    }
}

/// Production client over `reqwest`.
#[derive(Debug, Clone)]
pub struct BackendClient {
    base_url: String,
    client: reqwest::Client,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HttpError::Unreachable { reason: e.to_string() })?;
        Ok(Self { base_url: base_url.into().trim_end_matches('/').to_string(), client })
    }

    async fn finish(&self, response: reqwest::Response) -> Result<Value, HttpError> {
        let status = response.status().as_u16();
        let raw = response
            .text()
            .await
            .map_err(|e| HttpError::Unreachable { reason: e.to_string() })?;
        let payload: Value = if raw.is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(&raw).unwrap_or_else(|_| serde_json::json!({ "raw": raw }))
        };
        if status >= 400 {
            return Err(HttpError::Status { status, payload });
        }
        if !payload.is_object() {
            return Err(HttpError::InvalidPayload { status, payload });
        }
        Ok(payload)
    }
}

#[async_trait]
impl BackendApi for BackendClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json(&self, path: &str, params: &[(&str, &str)]) -> Result<Value, HttpError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(|e| HttpError::Unreachable { reason: e.to_string() })?;
        self.finish(response).await
    }

    async fn post_json(&self, path: &str, body: Value) -> Result<Value, HttpError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| HttpError::Unreachable { reason: e.to_string() })?;
        self.finish(response).await
    }
}

#[cfg(test)]
#[path = "backend_tests.rs"]
mod tests;
