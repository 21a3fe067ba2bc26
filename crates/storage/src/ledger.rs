// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable run ledger keyed by `run_id`.
//!
//! The ledger is what makes dispatch idempotent across supervisor restarts: a
//! `succeeded` row is terminal, and re-dispatch of the same run must be
//! skipped. Row status only moves forward
//! (`queued → running → {succeeded, failed, skipped}`); `upsert` is the
//! explicit re-dispatch reset and replaces the row wholesale.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Ledger access failure.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger file is not valid JSON: {path}: {error}")]
    InvalidJson { path: PathBuf, error: String },
    #[error("ledger root must be a JSON object")]
    InvalidRoot,
    #[error("cannot mark {operation}: run_id {run_id} not in ledger")]
    MissingRun { operation: &'static str, run_id: String },
    #[error("run {run_id} is already {status}; refusing to move it to {requested}")]
    InvalidTransition { run_id: String, status: RunState, requested: RunState },
    #[error("ledger write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle state of one run row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl RunState {
    /// Terminal states never transition again via `mark_*`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed | RunState::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Queued => "queued",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Skipped => "skipped",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result payload stored on a finished (or watchdog-failed) row. Unknown
/// fields from older supervisor versions are preserved through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub urls: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer_outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_classification: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reviewer_feedback_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executor_response_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_cycle_count: Option<u32>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One run lifecycle row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRow {
    pub run_id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub intent_hash: String,
    #[serde(default)]
    pub received_at: String,
    pub status: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_at: Option<String>,
    #[serde(default)]
    pub result: Option<RunRecord>,
}

/// Per-task activity row under the ledger root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskActivity {
    #[serde(default)]
    pub last_activity_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerRoot {
    #[serde(default)]
    plan_version: String,
    #[serde(default)]
    runs: BTreeMap<String, LedgerRow>,
    #[serde(default)]
    tasks: BTreeMap<String, TaskActivity>,
}

/// Crash-safe, mutex-serialized JSON document of run rows.
pub struct RunLedger {
    path: PathBuf,
    root: Mutex<Option<LedgerRoot>>,
}

impl RunLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), root: Mutex::new(None) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the backing file. Missing file is an empty ledger; a non-object
    /// or unparseable root is an error. Both on-disk shapes are accepted: the
    /// legacy flat run map and the structured `{plan_version, runs, tasks}`
    /// document. Writes always emit the structured shape.
    pub fn load(&self) -> Result<(), LedgerError> {
        let mut root = self.root.lock();
        if root.is_some() {
            return Ok(());
        }
        *root = Some(self.read_root()?);
        Ok(())
    }

    pub fn get(&self, run_id: &str) -> Result<Option<LedgerRow>, LedgerError> {
        self.load()?;
        let root = self.root.lock();
        Ok(root.as_ref().and_then(|r| r.runs.get(run_id).cloned()))
    }

    /// Insert or replace a row. Replacing is deliberate: a re-dispatched
    /// non-succeeded run starts a fresh lifecycle.
    pub fn upsert(&self, row: LedgerRow) -> Result<(), LedgerError> {
        self.load()?;
        let mut guard = self.root.lock();
        let root = guard.get_or_insert_with(LedgerRoot::default);
        root.runs.insert(row.run_id.clone(), row);
        self.write_root(root)
    }

    /// Move a row to `running`, stamping `running_at`.
    pub fn mark_running(&self, run_id: &str, at_iso: &str) -> Result<(), LedgerError> {
        self.load()?;
        let mut guard = self.root.lock();
        let root = guard.get_or_insert_with(LedgerRoot::default);
        let row = root.runs.get_mut(run_id).ok_or_else(|| LedgerError::MissingRun {
            operation: "running",
            run_id: run_id.to_string(),
        })?;
        if row.status.is_terminal() {
            return Err(LedgerError::InvalidTransition {
                run_id: run_id.to_string(),
                status: row.status,
                requested: RunState::Running,
            });
        }
        row.status = RunState::Running;
        row.running_at = Some(at_iso.to_string());
        self.write_root(root)
    }

    /// Record the terminal state and result payload for a row.
    pub fn mark_result(
        &self,
        run_id: &str,
        status: RunState,
        result: RunRecord,
    ) -> Result<(), LedgerError> {
        self.load()?;
        let mut guard = self.root.lock();
        let root = guard.get_or_insert_with(LedgerRoot::default);
        let row = root.runs.get_mut(run_id).ok_or_else(|| LedgerError::MissingRun {
            operation: "result",
            run_id: run_id.to_string(),
        })?;
        if row.status.is_terminal() {
            return Err(LedgerError::InvalidTransition {
                run_id: run_id.to_string(),
                status: row.status,
                requested: status,
            });
        }
        row.status = status;
        row.result = Some(result);
        self.write_root(root)
    }

    pub fn plan_version(&self) -> Result<String, LedgerError> {
        self.load()?;
        let root = self.root.lock();
        Ok(root.as_ref().map(|r| r.plan_version.clone()).unwrap_or_default())
    }

    pub fn task_last_activity(&self, project_item_id: &str) -> Result<String, LedgerError> {
        self.load()?;
        let root = self.root.lock();
        Ok(root
            .as_ref()
            .and_then(|r| r.tasks.get(project_item_id))
            .map(|t| t.last_activity_at.clone())
            .unwrap_or_default())
    }

    pub fn touch_task_last_activity(
        &self,
        project_item_id: &str,
        at_iso: &str,
    ) -> Result<(), LedgerError> {
        self.load()?;
        let mut guard = self.root.lock();
        let root = guard.get_or_insert_with(LedgerRoot::default);
        root.tasks.entry(project_item_id.to_string()).or_default().last_activity_at =
            at_iso.to_string();
        self.write_root(root)
    }

    fn read_root(&self) -> Result<LedgerRoot, LedgerError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LedgerRoot::default());
            }
            Err(e) => return Err(LedgerError::Io(e)),
        };
        let payload: Value = serde_json::from_str(&raw).map_err(|e| LedgerError::InvalidJson {
            path: self.path.clone(),
            error: e.to_string(),
        })?;
        let map = payload.as_object().ok_or(LedgerError::InvalidRoot)?;

        let structured =
            ["plan_version", "runs", "tasks"].iter().any(|key| map.contains_key(*key));
        let value = if structured {
            payload
        } else {
            serde_json::json!({ "plan_version": "", "runs": payload, "tasks": {} })
        };
        serde_json::from_value(value).map_err(|e| LedgerError::InvalidJson {
            path: self.path.clone(),
            error: e.to_string(),
        })
    }

    /// Writes go through a temp file in the same directory and land with an
    /// atomic rename so a concurrent reader never observes a partial document.
    fn write_root(&self, root: &LedgerRoot) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = temp_path(&self.path);
        let mut payload = serde_json::to_string_pretty(root)
            .map_err(|e| LedgerError::InvalidJson { path: tmp.clone(), error: e.to_string() })?;
        payload.push('\n');
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".tmp-{}-{}", std::process::id(), millis));
    PathBuf::from(name)
}

#[cfg(test)]
#[path = "ledger_tests.rs"]
mod tests;
