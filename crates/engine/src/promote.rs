// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Ready-buffer promotion.
//!
//! After each planner poll, Backlog items are promoted to Ready to keep the
//! buffer at `ready_target`, under two gates: CHAINED items wait for their
//! dependencies to reach Done, and no two actively-worked items may own
//! overlapping paths.

use crate::plan::{IsolationMode, ScopeEntry, SprintPlan};
use crate::sanitize::{normalize_path, paths_overlap, sanitize_with_regen, SanitizeError};
use serde_json::{json, Value};
use sf_adapters::{BackendApi, HttpError};
use sf_core::EventSink;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use thiserror::Error;

/// Statuses that reserve an item's owned paths against new promotions.
const ACTIVE_STATUSES: [&str; 4] = ["Ready", "In Progress", "In Review", "Needs Human Approval"];

/// Promotion failure.
#[derive(Debug, Error)]
pub enum PromoteError {
    #[error(transparent)]
    Sanitize(#[from] SanitizeError),
    #[error(transparent)]
    Http(#[from] HttpError),
}

/// Knobs for one promotion pass.
#[derive(Debug, Clone)]
pub struct PromoteOptions {
    pub dry_run: bool,
    pub ready_target: u32,
    pub sanitization_regen_attempts: u32,
    pub state_path: PathBuf,
}

struct Candidate {
    issue_number: i64,
    project_item_id: String,
    priority_rank: u8,
}

/// Compute and apply Backlog→Ready promotions for one dispatch summary.
pub async fn autopromote_ready(
    backend: &dyn BackendApi,
    summary: &Value,
    sprint_plan: Option<&SprintPlan>,
    sprint_plan_raw: Option<&Value>,
    opts: &PromoteOptions,
    events: &dyn EventSink,
) -> Result<(), PromoteError> {
    let mut status_by_issue: BTreeMap<i64, String> = BTreeMap::new();
    let mut item_id_by_issue: BTreeMap<i64, String> = BTreeMap::new();
    if let Some(processed) = summary.get("processed_items").and_then(Value::as_array) {
        for item in processed {
            let Some(issue) = item.get("issue_number").and_then(Value::as_i64) else {
                continue;
            };
            if let Some(status) = item.get("status").and_then(Value::as_str) {
                status_by_issue.insert(issue, status.to_string());
            }
            if let Some(id) = item.get("project_item_id").and_then(Value::as_str) {
                item_id_by_issue.insert(issue, id.to_string());
            }
        }
    }

    // A cycle that survives sanitization stops promotion entirely.
    let scope: BTreeMap<i64, ScopeEntry> = match sprint_plan {
        Some(plan) => {
            sanitize_with_regen(
                &plan.scope,
                sprint_plan_raw,
                opts.sanitization_regen_attempts,
                &opts.state_path,
                events,
            )?
            .plan
        }
        None => BTreeMap::new(),
    };

    let current_ready = summary
        .get("status_counts")
        .and_then(|c| c.get("Ready"))
        .and_then(Value::as_u64)
        .unwrap_or_else(|| {
            status_by_issue.values().filter(|s| s.as_str() == "Ready").count() as u64
        });
    let deficit = (opts.ready_target as u64).saturating_sub(current_ready);
    if deficit == 0 {
        return Ok(());
    }

    let eligible = eligible_candidates(sprint_plan, &status_by_issue, &item_id_by_issue);

    // Paths already owned by actively-worked issues. CHAINED successors of
    // Done predecessors may overlap those predecessors: Done items are simply
    // never reserved.
    let mut reserved: BTreeSet<(i64, String)> = BTreeSet::new();
    for (&issue, status) in &status_by_issue {
        if !ACTIVE_STATUSES.contains(&status.as_str()) {
            continue;
        }
        if let Some(entry) = scope.get(&issue) {
            for own in &entry.owns_paths {
                reserved.insert((issue, normalize_path(own)));
            }
        }
    }

    let mut promoted = 0u64;
    for candidate in eligible {
        if promoted >= deficit {
            break;
        }
        let entry = scope.get(&candidate.issue_number);

        if let Some(entry) = entry {
            if entry.isolation_mode == IsolationMode::Chained {
                let unmet: Vec<i64> = entry
                    .depends_on
                    .iter()
                    .copied()
                    .filter(|dep| {
                        status_by_issue.get(dep).map(String::as_str) != Some("Done")
                    })
                    .collect();
                if !unmet.is_empty() {
                    events.emit(json!({
                        "type": "BOARD_PROMOTION_SKIPPED_DEPENDENCY",
                        "issue_number": candidate.issue_number,
                        "unmet_depends_on": unmet,
                    }));
                    continue;
                }
            }

            let conflict = entry.owns_paths.iter().find_map(|own| {
                reserved
                    .iter()
                    .find(|(issue, path)| {
                        *issue != candidate.issue_number && paths_overlap(own, path)
                    })
                    .cloned()
            });
            if let Some((blocking_issue, path)) = conflict {
                events.emit(json!({
                    "type": "BOARD_PROMOTION_SKIPPED_CONFLICT",
                    "issue_number": candidate.issue_number,
                    "blocking_issue": blocking_issue,
                    "path": path,
                }));
                continue;
            }
        }

        if opts.dry_run {
            events.emit(json!({
                "type": "BOARD_PROMOTED",
                "dry_run": true,
                "issue_number": candidate.issue_number,
                "project_item_id": candidate.project_item_id,
            }));
        } else {
            backend
                .post_field_update(json!({
                    "role": "ORCHESTRATOR",
                    "project_item_id": candidate.project_item_id,
                    "field": "Status",
                    "value": "Ready",
                    "issue_number": candidate.issue_number,
                }))
                .await?;
            events.emit(json!({
                "type": "BOARD_PROMOTED",
                "issue_number": candidate.issue_number,
                "project_item_id": candidate.project_item_id,
            }));
        }

        if let Some(entry) = entry {
            for own in &entry.owns_paths {
                reserved.insert((candidate.issue_number, normalize_path(own)));
            }
        }
        promoted += 1;
    }

    Ok(())
}

/// Backlog items allowed to enter the Ready buffer, in promotion order.
///
/// Eligibility checks the task rows' title-level dependencies; the CHAINED
/// gate later re-checks the pruned scope edges, which may differ.
fn eligible_candidates(
    sprint_plan: Option<&SprintPlan>,
    status_by_issue: &BTreeMap<i64, String>,
    item_id_by_issue: &BTreeMap<i64, String>,
) -> Vec<Candidate> {
    let mut eligible = Vec::new();
    match sprint_plan {
        Some(plan) => {
            let issue_by_title: BTreeMap<&str, i64> =
                plan.tasks.iter().map(|t| (t.title.as_str(), t.issue_number)).collect();
            for task in &plan.tasks {
                if status_by_issue.get(&task.issue_number).map(String::as_str) != Some("Backlog") {
                    continue;
                }
                let Some(rank) = priority_rank(&task.priority) else {
                    continue;
                };
                let project_item_id = if task.project_item_id.is_empty() {
                    match item_id_by_issue.get(&task.issue_number) {
                        Some(id) => id.clone(),
                        None => continue,
                    }
                } else {
                    task.project_item_id.clone()
                };
                // Declared dependencies (titles that resolve to a task) must
                // all be Done; unresolvable titles cannot block anything.
                let deps_done = task
                    .depends_on_titles
                    .iter()
                    .filter_map(|title| issue_by_title.get(title.as_str()))
                    .all(|dep| status_by_issue.get(dep).map(String::as_str) == Some("Done"));
                if !deps_done {
                    continue;
                }
                eligible.push(Candidate {
                    issue_number: task.issue_number,
                    project_item_id,
                    priority_rank: rank,
                });
            }
        }
        None => {
            // Without a plan: every Backlog item, at P2.
            for (&issue, status) in status_by_issue {
                if status != "Backlog" {
                    continue;
                }
                let Some(id) = item_id_by_issue.get(&issue) else {
                    continue;
                };
                eligible.push(Candidate {
                    issue_number: issue,
                    project_item_id: id.clone(),
                    priority_rank: 2,
                });
            }
        }
    }
    eligible.sort_by_key(|c| (c.priority_rank, c.issue_number));
    eligible
}

fn priority_rank(priority: &str) -> Option<u8> {
    match priority.trim() {
        "P0" => Some(0),
        "P1" => Some(1),
        "P2" => Some(2),
        _ => None,
    }
}

#[cfg(test)]
#[path = "promote_tests.rs"]
mod tests;
