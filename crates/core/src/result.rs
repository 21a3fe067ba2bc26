// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent worker result contract.
//!
//! Workers are instructed to emit exactly one JSON object and nothing else.
//! Real agents wrap output anyway, so parsing tolerates a `RUNNER_RESULT_JSON:`
//! prefix and fenced-code wrappers before decoding; everything past that point
//! is strict.

use crate::intent::Role;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// URL keys that advertise a pull request in a worker result.
pub const PR_URL_KEYS: [&str; 4] = ["pr_url", "pull_request", "pr", "resolved_pr"];

const RESULT_PREFIX: &str = "RUNNER_RESULT_JSON:";

/// Terminal status reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reviewer verdict. Required whenever the run's role is REVIEWER; its
/// absence on a reviewer result is a contract violation handled upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewerOutcome {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
    #[serde(rename = "INCOMPLETE")]
    Incomplete,
}

impl ReviewerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewerOutcome::Pass => "PASS",
            ReviewerOutcome::Fail => "FAIL",
            ReviewerOutcome::Incomplete => "INCOMPLETE",
        }
    }

    pub fn parse(raw: &str) -> Option<ReviewerOutcome> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PASS" => Some(ReviewerOutcome::Pass),
            "FAIL" => Some(ReviewerOutcome::Fail),
            "INCOMPLETE" => Some(ReviewerOutcome::Incomplete),
            _ => None,
        }
    }
}

impl fmt::Display for ReviewerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated worker result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub run_id: String,
    pub role: Role,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ReviewerOutcome>,
    pub summary: String,
    #[serde(default)]
    pub urls: BTreeMap<String, String>,
    #[serde(default)]
    pub errors: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker_verified: Option<bool>,
}

impl WorkerResult {
    /// First PR URL the result advertises, if any. Executor results that
    /// advertise one must also set `marker_verified=true`.
    pub fn advertised_pr_url(&self) -> Option<&str> {
        PR_URL_KEYS.iter().find_map(|key| self.urls.get(*key).map(String::as_str))
    }
}

/// Worker output that failed validation.
#[derive(Debug, Error)]
pub enum WorkerResultError {
    #[error("worker output was not valid JSON; worker must output JSON only: {error}")]
    NotJson { error: String, content: String },
    #[error("worker result must be a JSON object")]
    NotObject,
    #[error("worker result identity mismatch (expected {expected_run_id}/{expected_role})")]
    IdentityMismatch { expected_run_id: String, expected_role: Role },
    #[error("worker result status must be succeeded|failed")]
    InvalidStatus,
    #[error("worker result outcome must be PASS|FAIL|INCOMPLETE")]
    InvalidOutcome,
    #[error("worker result summary must be a string")]
    InvalidSummary,
}

impl WorkerResultError {
    pub fn code(&self) -> &'static str {
        match self {
            WorkerResultError::IdentityMismatch { .. } => "worker_identity_mismatch",
            _ => "worker_invalid_output",
        }
    }
}

/// Parse a worker's free-form text payload into a [`WorkerResult`].
pub fn parse_worker_result(
    content: &str,
    expected_run_id: &str,
    expected_role: Role,
) -> Result<WorkerResult, WorkerResultError> {
    let raw = strip_wrappers(content);
    let parsed: Value = serde_json::from_str(raw).map_err(|e| WorkerResultError::NotJson {
        error: e.to_string(),
        content: clip(content, 2000),
    })?;
    let map = parsed.as_object().ok_or(WorkerResultError::NotObject)?;

    let run_id = map.get("run_id").and_then(Value::as_str).unwrap_or_default();
    let role = map.get("role").and_then(Value::as_str).and_then(Role::parse);
    if run_id != expected_run_id || role != Some(expected_role) {
        return Err(WorkerResultError::IdentityMismatch {
            expected_run_id: expected_run_id.to_string(),
            expected_role,
        });
    }

    let status = match map.get("status").and_then(Value::as_str) {
        Some("succeeded") => RunStatus::Succeeded,
        Some("failed") => RunStatus::Failed,
        _ => return Err(WorkerResultError::InvalidStatus),
    };

    let outcome = match map.get("outcome") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => {
            Some(ReviewerOutcome::parse(s).ok_or(WorkerResultError::InvalidOutcome)?)
        }
        Some(_) => return Err(WorkerResultError::InvalidOutcome),
    };

    let summary = match map.get("summary") {
        Some(Value::String(s)) => s.clone(),
        _ => return Err(WorkerResultError::InvalidSummary),
    };

    // Non-object urls and non-array errors degrade to empty rather than
    // failing the run; identity and status are the load-bearing fields.
    let urls = map
        .get("urls")
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .map(|(k, v)| {
                    let text = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), text)
                })
                .collect()
        })
        .unwrap_or_default();

    let errors = map
        .get("errors")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .map(|e| {
                    if e.is_object() {
                        e.clone()
                    } else {
                        serde_json::json!({ "error": e.to_string() })
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let marker_verified = map.get("marker_verified").and_then(Value::as_bool);

    Ok(WorkerResult {
        run_id: run_id.to_string(),
        role: expected_role,
        status,
        outcome,
        summary,
        urls,
        errors,
        marker_verified,
    })
}

/// Strip the optional result prefix and fenced-code wrappers.
fn strip_wrappers(content: &str) -> &str {
    let mut raw = content.trim();
    if let Some(idx) = raw.find(RESULT_PREFIX) {
        raw = raw[idx + RESULT_PREFIX.len()..].trim();
    }
    if raw.starts_with("```") {
        raw = match raw.find('\n') {
            Some(nl) => raw[nl + 1..].trim_end(),
            None => raw,
        };
        if let Some(stripped) = raw.strip_suffix("```") {
            raw = stripped.trim_end();
        }
    }
    raw.trim()
}

fn clip(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
#[path = "result_tests.rs"]
mod tests;
