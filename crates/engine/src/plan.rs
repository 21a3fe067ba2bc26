// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed projection of the kickoff sprint-plan cache.
//!
//! The plan arrives as dynamic JSON (produced once at kickoff, cached in the
//! orchestrator state); it is validated here and the rest of the engine only
//! sees typed rows.

use crate::sanitize::SanitizeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Scope-isolation mode. CHAINED items may share ownership with predecessors
/// that have reached `Done`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationMode {
    #[default]
    #[serde(rename = "ISOLATED")]
    Isolated,
    #[serde(rename = "CHAINED")]
    Chained,
}

/// Per-issue scope row from the plan's `sprint_plan` map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeEntry {
    pub touch_paths: Vec<String>,
    pub owns_paths: Vec<String>,
    pub conflicts_with: Vec<i64>,
    pub depends_on: Vec<i64>,
    pub group_id: String,
    pub isolation_mode: IsolationMode,
}

/// One task row from the plan's `tasks` array.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskRow {
    pub title: String,
    pub issue_number: i64,
    pub project_item_id: String,
    pub priority: String,
    pub depends_on_titles: Vec<String>,
}

/// Read-only cache produced by kickoff.
#[derive(Debug, Clone, Default)]
pub struct SprintPlan {
    pub sprint: String,
    pub tasks: Vec<TaskRow>,
    pub scope: BTreeMap<i64, ScopeEntry>,
}

/// Validate a raw sprint plan. Scope rows that are not objects, or whose
/// issue-number keys do not parse, are malformed data (exit 3 at top level).
pub fn parse_sprint_plan(value: &Value) -> Result<SprintPlan, SanitizeError> {
    let root = value
        .as_object()
        .ok_or_else(|| SanitizeError::MalformedSprintData("sprint plan must be an object".into()))?;

    let sprint = root.get("sprint").and_then(Value::as_str).unwrap_or_default().to_string();

    let mut tasks = Vec::new();
    if let Some(rows) = root.get("tasks").and_then(Value::as_array) {
        for row in rows {
            tasks.push(TaskRow {
                title: row.get("title").and_then(Value::as_str).unwrap_or_default().to_string(),
                issue_number: row.get("issue_number").and_then(Value::as_i64).unwrap_or_default(),
                project_item_id: row
                    .get("project_item_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                priority: row
                    .get("priority")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                depends_on_titles: string_list(row.get("depends_on_titles")),
            });
        }
    }

    let mut scope = BTreeMap::new();
    if let Some(map) = root.get("sprint_plan").and_then(Value::as_object) {
        for (key, entry) in map {
            let number: i64 = key.trim().parse().map_err(|_| {
                SanitizeError::MalformedSprintData(format!("scope key is not an issue number: {key}"))
            })?;
            let entry = entry.as_object().ok_or_else(|| {
                SanitizeError::MalformedSprintData(format!("scope entry {key} must be an object"))
            })?;
            scope.insert(
                number,
                ScopeEntry {
                    touch_paths: string_list(entry.get("touch_paths")),
                    owns_paths: string_list(entry.get("owns_paths")),
                    conflicts_with: number_list(entry.get("conflicts_with")),
                    depends_on: number_list(entry.get("depends_on")),
                    group_id: entry
                        .get("group_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    isolation_mode: match entry.get("isolation_mode").and_then(Value::as_str) {
                        Some("CHAINED") => IsolationMode::Chained,
                        _ => IsolationMode::Isolated,
                    },
                },
            );
        }
    }

    Ok(SprintPlan { sprint, tasks, scope })
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items.iter().filter_map(Value::as_str).map(str::to_string).collect()
        })
        .unwrap_or_default()
}

fn number_list(value: Option<&Value>) -> Vec<i64> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default()
}

#[cfg(test)]
#[path = "plan_tests.rs"]
mod tests;
