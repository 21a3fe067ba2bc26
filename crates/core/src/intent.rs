// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Planner intent parsing and validation.
//!
//! Intents arrive as JSON lines on the planner's stdout. A malformed intent
//! is a hard stop for the whole supervisor: the planner is a trusted peer and
//! schema drift between the two processes must surface immediately.

use crate::canonical::canonical_json;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Envelope type tag every intent must carry.
pub const INTENT_TYPE: &str = "RUN_INTENT";

const ALLOWED_KEYS: [&str; 5] = ["type", "role", "run_id", "endpoint", "body"];

const EXECUTOR_ENDPOINTS: [&str; 2] =
    ["/internal/executor/claim-ready-item", "/internal/reviewer/resolve-linked-pr"];
const REVIEWER_ENDPOINTS: [&str; 1] = ["/internal/reviewer/resolve-linked-pr"];

/// Worker role named by a planner intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "EXECUTOR")]
    Executor,
    #[serde(rename = "REVIEWER")]
    Reviewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Executor => "EXECUTOR",
            Role::Reviewer => "REVIEWER",
        }
    }

    /// Parse a role, trimming whitespace and normalizing case.
    pub fn parse(raw: &str) -> Option<Role> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "EXECUTOR" => Some(Role::Executor),
            "REVIEWER" => Some(Role::Reviewer),
            _ => None,
        }
    }

    /// Endpoints this role is allowed to name in an intent.
    pub fn allowed_endpoints(&self) -> &'static [&'static str] {
        match self {
            Role::Executor => &EXECUTOR_ENDPOINTS,
            Role::Reviewer => &REVIEWER_ENDPOINTS,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Intent validation failure. Always classified HARD_STOP by the supervisor.
#[derive(Debug, Error)]
pub enum IntentError {
    #[error("orchestrator emitted invalid JSONL: {0}")]
    InvalidJson(String),
    #[error("intent line must be a JSON object")]
    InvalidType,
    #[error("intent has unknown fields: {0:?}")]
    UnknownFields(Vec<String>),
    #[error("intent type mismatch: {0:?}")]
    TypeMismatch(Option<String>),
    #[error("intent role must be EXECUTOR or REVIEWER")]
    InvalidRole,
    #[error("intent run_id is required")]
    MissingRunId,
    #[error("intent endpoint is required")]
    InvalidEndpoint,
    #[error("intent endpoint {endpoint:?} is not allowed for role {role}")]
    EndpointNotAllowed { role: Role, endpoint: String },
    #[error("intent body must be an object")]
    InvalidBody,
    #[error("intent body.role must match intent role")]
    RoleMismatch,
    #[error("intent body.run_id must match intent run_id")]
    RunIdMismatch,
}

impl IntentError {
    /// Stable wire code, recorded in events and the ledger.
    pub fn code(&self) -> &'static str {
        match self {
            IntentError::InvalidJson(_) => "intent_invalid_json",
            IntentError::InvalidType => "intent_invalid_type",
            IntentError::UnknownFields(_) => "intent_unknown_fields",
            IntentError::TypeMismatch(_) => "intent_type_mismatch",
            IntentError::InvalidRole => "intent_invalid_role",
            IntentError::MissingRunId => "intent_missing_run_id",
            IntentError::InvalidEndpoint => "intent_invalid_endpoint",
            IntentError::EndpointNotAllowed { .. } => "intent_endpoint_not_allowed",
            IntentError::InvalidBody => "intent_invalid_body",
            IntentError::RoleMismatch => "intent_role_mismatch",
            IntentError::RunIdMismatch => "intent_run_id_mismatch",
        }
    }
}

/// A validated planner intent. Immutable; the raw envelope is retained for
/// hashing and for verbatim injection into the worker prompt.
#[derive(Debug, Clone)]
pub struct RunIntent {
    pub role: Role,
    pub run_id: String,
    pub endpoint: String,
    pub body: Map<String, Value>,
    raw: Value,
}

impl RunIntent {
    /// SHA-256 hex of the canonical-JSON envelope; the dispatch idempotency key.
    pub fn intent_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(canonical_json(&self.raw).as_bytes());
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(64);
        for byte in digest {
            use std::fmt::Write;
            let _ = write!(hex, "{:02x}", byte);
        }
        hex
    }

    /// The raw envelope as emitted by the planner.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Issue number carried in the body, when the planner resolved one.
    pub fn issue_number(&self) -> Option<i64> {
        self.body.get("issue_number").and_then(Value::as_i64)
    }
}

/// Decode one planner stdout line as a JSON object.
pub fn parse_json_line(line: &str) -> Result<Value, IntentError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| IntentError::InvalidJson(e.to_string()))?;
    if !value.is_object() {
        return Err(IntentError::InvalidType);
    }
    Ok(value)
}

/// Validate a decoded envelope into a [`RunIntent`].
pub fn parse_intent(value: Value) -> Result<RunIntent, IntentError> {
    let map = value.as_object().ok_or(IntentError::InvalidType)?;

    let mut extra: Vec<String> =
        map.keys().filter(|k| !ALLOWED_KEYS.contains(&k.as_str())).cloned().collect();
    if !extra.is_empty() {
        extra.sort();
        return Err(IntentError::UnknownFields(extra));
    }

    match map.get("type").and_then(Value::as_str) {
        Some(t) if t == INTENT_TYPE => {}
        other => return Err(IntentError::TypeMismatch(other.map(str::to_string))),
    }

    let role = map
        .get("role")
        .and_then(Value::as_str)
        .and_then(Role::parse)
        .ok_or(IntentError::InvalidRole)?;

    let run_id = match map.get("run_id").and_then(Value::as_str) {
        Some(id) if !id.trim().is_empty() => id.to_string(),
        _ => return Err(IntentError::MissingRunId),
    };

    let endpoint = match map.get("endpoint").and_then(Value::as_str) {
        Some(e) if e.trim().starts_with("/internal/") => e.trim().to_string(),
        _ => return Err(IntentError::InvalidEndpoint),
    };
    if !role.allowed_endpoints().contains(&endpoint.as_str()) {
        return Err(IntentError::EndpointNotAllowed { role, endpoint });
    }

    let body =
        map.get("body").and_then(Value::as_object).cloned().ok_or(IntentError::InvalidBody)?;

    if body.get("role").and_then(Value::as_str) != Some(role.as_str()) {
        return Err(IntentError::RoleMismatch);
    }
    if body.get("run_id").and_then(Value::as_str) != Some(run_id.as_str()) {
        return Err(IntentError::RunIdMismatch);
    }

    Ok(RunIntent { role, run_id, endpoint, body, raw: value })
}

#[cfg(test)]
#[path = "intent_tests.rs"]
mod tests;
