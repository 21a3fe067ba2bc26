// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Orchestrator state file shared with the planner child.
//!
//! The supervisor owns this file; the planner cooperates by only ever writing
//! through an atomic rename into the same path. Readers tolerate a missing
//! file by returning an empty state and quarantine a malformed one with a
//! `.corrupt-<ms>` suffix rather than guessing at its contents.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sf_core::parse_iso;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Per-item cross-poll context. Rewritten wholesale on every reconciliation;
/// fields the supervisor does not model are carried through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateItem {
    #[serde(default)]
    pub last_seen_status: String,
    #[serde(default)]
    pub last_seen_sprint: String,
    #[serde(default)]
    pub last_seen_issue_number: i64,
    #[serde(default)]
    pub last_seen_issue_title: String,
    #[serde(default)]
    pub last_seen_issue_url: String,
    #[serde(default)]
    pub last_seen_at: String,
    #[serde(default)]
    pub status_since_at: String,
    #[serde(default)]
    pub status_since_poll: u64,
    #[serde(default)]
    pub last_activity_at: String,
    #[serde(default)]
    pub last_activity_indicator: String,
    #[serde(default)]
    pub last_dispatched_role: String,
    #[serde(default)]
    pub last_dispatched_status: String,
    #[serde(default)]
    pub last_dispatched_at: String,
    #[serde(default)]
    pub last_dispatched_poll: u64,
    #[serde(default)]
    pub last_run_id: String,
    #[serde(default)]
    pub reviewer_dispatches_for_current_status: u32,
    #[serde(default)]
    pub review_cycle_count: u32,
    #[serde(default)]
    pub last_reviewer_outcome: String,
    #[serde(default)]
    pub last_reviewer_feedback_at: String,
    #[serde(default)]
    pub last_executor_response_at: String,
    #[serde(default)]
    pub in_review_origin: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl StateItem {
    /// Clear the dispatch epoch so the planner may dispatch again. The run id
    /// is retained for audit.
    pub fn clear_dispatch(&mut self) {
        self.last_dispatched_role = String::new();
        self.last_dispatched_status = String::new();
        self.last_dispatched_at = String::new();
        self.last_dispatched_poll = 0;
    }

    /// Most recent observation timestamp, for duplicate-item resolution.
    fn recency(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        parse_iso(&self.last_seen_at).or_else(|| parse_iso(&self.status_since_at))
    }
}

/// Shared planner/supervisor state document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorState {
    #[serde(default)]
    pub poll_count: u64,
    #[serde(default)]
    pub items: BTreeMap<String, StateItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sprint_plan: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ownership_index: Option<Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Outcome of resolving an issue number against possibly-stale items.
#[derive(Debug)]
pub struct ResolvedItem<'a> {
    pub project_item_id: &'a str,
    pub item: &'a StateItem,
    /// How many entries matched the issue; >1 means stale duplicates exist
    /// and the caller should log the observation.
    pub candidates: usize,
}

impl OrchestratorState {
    /// Resolve the currently-active project item for an issue.
    ///
    /// Stale duplicates can survive in the file across runs; pick the entry
    /// with the most recent `last_seen_at` (falling back to
    /// `status_since_at`). Exact timestamp ties break by larger
    /// `last_dispatched_poll`, then lexicographically larger
    /// `project_item_id`.
    pub fn resolve_item_for_issue(&self, issue_number: i64) -> Option<ResolvedItem<'_>> {
        let mut matches: Vec<(&String, &StateItem)> = self
            .items
            .iter()
            .filter(|(_, item)| item.last_seen_issue_number == issue_number)
            .collect();
        let candidates = matches.len();
        matches.sort_by(|(a_id, a), (b_id, b)| {
            a.recency()
                .cmp(&b.recency())
                .then(a.last_dispatched_poll.cmp(&b.last_dispatched_poll))
                .then(a_id.as_str().cmp(b_id.as_str()))
        });
        matches.pop().map(|(project_item_id, item)| ResolvedItem {
            project_item_id,
            item,
            candidates,
        })
    }
}

/// Loader/saver for the state file path.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current state. Missing file → empty state. Malformed JSON →
    /// quarantine and empty state; the planner rebuilds context on its next
    /// poll.
    pub fn load(&self) -> OrchestratorState {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return OrchestratorState::default();
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "state file unreadable");
                return OrchestratorState::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(e) => {
                let quarantine = corrupt_path(&self.path);
                tracing::warn!(
                    path = %self.path.display(),
                    quarantine = %quarantine.display(),
                    error = %e,
                    "state file is not valid JSON; quarantining and resetting"
                );
                let _ = fs::rename(&self.path, &quarantine);
                OrchestratorState::default()
            }
        }
    }

    /// Persist atomically (temp file + rename into place).
    pub fn save(&self, state: &OrchestratorState) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut payload = serde_json::to_string_pretty(state)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        payload.push('\n');
        let tmp = tmp_path(&self.path);
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, &self.path)
    }
}

fn now_ms() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".tmp-{}-{}", std::process::id(), now_ms()));
    PathBuf::from(name)
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".corrupt-{}", now_ms()));
    PathBuf::from(name)
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
