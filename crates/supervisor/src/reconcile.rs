// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Board reconciliation.
//!
//! Two triggers: once at startup against the backend's authoritative
//! metadata, and once per planner poll on every DISPATCH_SUMMARY. Per-poll
//! handlers are isolated: a failure in one is reported and the rest still
//! run. State derived from an item's status epoch never survives an epoch
//! boundary, and recovery never acts on dispatches from the current poll.

use crate::runner::Runner;
use serde_json::{json, Value};
use sf_adapters::{BackendApi, WorkerDriver};
use sf_core::{is_retryable, parse_iso, Clock, FailureClass};
use sf_storage::{RunRecord, RunState, StateItem};

/// Statuses the running-worker watchdog covers.
const WATCHDOG_STATUSES: [&str; 2] = ["In Progress", "In Review"];

/// Review cycles allowed before an item is parked as Blocked.
const REVIEW_CYCLE_CAP: u32 = 5;

impl<B, W, C> Runner<B, W, C>
where
    B: BackendApi + 'static,
    W: WorkerDriver + 'static,
    C: Clock + 'static,
{
    /// Startup rehydration against `getProjectItemsMetadata`.
    ///
    /// Epoch-scoped fields survive only when the remote (issue, status) pair
    /// is unchanged; review-cycle fields additionally require the item to
    /// still be In Review. Dispatch counters always reset — the worker pool
    /// is ephemeral. Local items absent remotely are pruned.
    pub async fn reconcile_startup_state(&self, sprint: &str) -> Value {
        let metadata = match self.backend.project_items_metadata(sprint).await {
            Ok(metadata) => metadata,
            Err(error) => {
                return json!({
                    "status": "SKIPPED",
                    "reason": "remote_fetch_failed",
                    "error": error.to_string(),
                });
            }
        };

        let previous = self.state.load();
        let mut next = previous.clone();
        let as_of = metadata
            .get("as_of")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.clock.now_iso());

        let mut merged = std::collections::BTreeMap::new();
        let empty = Vec::new();
        let remote_items = metadata.get("items").and_then(Value::as_array).unwrap_or(&empty);
        for remote in remote_items {
            let Some(project_item_id) = remote.get("project_item_id").and_then(Value::as_str)
            else {
                continue;
            };
            let issue_number = remote.get("issue_number").and_then(Value::as_i64).unwrap_or(0);
            let status =
                remote.get("status").and_then(Value::as_str).unwrap_or_default().to_string();

            let prior = previous.items.get(project_item_id);
            let mut item = StateItem {
                last_seen_status: status.clone(),
                last_seen_sprint: remote
                    .get("sprint")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                last_seen_issue_number: issue_number,
                last_seen_issue_title: remote
                    .get("issue_title")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                last_seen_issue_url: remote
                    .get("issue_url")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                last_seen_at: as_of.clone(),
                status_since_at: as_of.clone(),
                status_since_poll: previous.poll_count,
                ..StateItem::default()
            };

            if let Some(prior) = prior {
                item.last_run_id = prior.last_run_id.clone();
                item.last_activity_at = prior.last_activity_at.clone();
                item.last_activity_indicator = prior.last_activity_indicator.clone();
                item.extra = prior.extra.clone();

                let same_epoch = prior.last_seen_issue_number == issue_number
                    && prior.last_seen_status == status;
                if same_epoch {
                    item.status_since_at = prior.status_since_at.clone();
                    item.status_since_poll = prior.status_since_poll;
                    if status == "In Review" {
                        item.review_cycle_count = prior.review_cycle_count;
                        item.last_reviewer_outcome = prior.last_reviewer_outcome.clone();
                        item.last_reviewer_feedback_at = prior.last_reviewer_feedback_at.clone();
                        item.last_executor_response_at = prior.last_executor_response_at.clone();
                        item.in_review_origin = prior.in_review_origin.clone();
                    }
                }
            }
            // Dispatch epoch always resets (StateItem::default() covers the
            // fields; this is the documented intent).
            item.clear_dispatch();
            item.reviewer_dispatches_for_current_status = 0;

            merged.insert(project_item_id.to_string(), item);
        }

        let pruned = previous.items.keys().filter(|id| !merged.contains_key(*id)).count();
        next.items = merged;

        let state_changed = next != previous;
        if state_changed {
            if let Err(error) = self.state.save(&next) {
                return json!({
                    "status": "SKIPPED",
                    "reason": "state_write_failed",
                    "error": error.to_string(),
                });
            }
        }

        json!({
            "status": "APPLIED",
            "remote_items": remote_items.len(),
            "pruned_local_items": pruned,
            "state_changed": state_changed,
        })
    }

    /// Per-poll reconciliation, driven by each DISPATCH_SUMMARY.
    pub async fn handle_dispatch_summary(&self, summary: &Value) {
        let handlers: [(&str, HandlerOutcome); 6] = [
            ("recover_passed_in_review_items", self.recover_passed_in_review_items(summary).await),
            (
                "recover_lost_in_review_reviewer_dispatches",
                self.recover_lost_in_review_reviewer_dispatches(summary),
            ),
            ("handle_review_stall", self.handle_review_stall(summary).await),
            ("handle_blocked_retries", self.handle_blocked_retries(summary).await),
            ("handle_in_review_cycle_caps", self.handle_in_review_cycle_caps(summary).await),
            ("handle_running_watchdog", self.handle_running_watchdog(summary).await),
        ];
        for (name, outcome) in handlers {
            if let Err(error) = outcome {
                self.events.emit(json!({
                    "type": "DISPATCH_SUMMARY_HANDLER_FAILED",
                    "handler": name,
                    "error": error,
                }));
            }
        }
    }

    /// An In Review item whose recorded reviewer outcome is PASS missed its
    /// transition (crash between record and update); re-drive it.
    async fn recover_passed_in_review_items(&self, summary: &Value) -> HandlerOutcome {
        for (issue_number, project_item_id) in processed_with_status(summary, "In Review") {
            let state = self.state.load();
            let Some(item) = state.items.get(&project_item_id) else {
                continue;
            };
            if item.last_reviewer_outcome != "PASS" {
                continue;
            }
            self.promote_passed_review(issue_number).await.map_err(stringify)?;
            self.events.emit(json!({
                "type": "REVIEW_PASS_RECOVERED",
                "issue_number": issue_number,
                "project_item_id": project_item_id,
            }));
        }
        Ok(())
    }

    /// A reviewer dispatch from an earlier poll with no recorded outcome and
    /// no live ledger row is lost; clear the dispatch epoch so the planner
    /// may re-dispatch. Never recovers within the dispatching poll.
    fn recover_lost_in_review_reviewer_dispatches(&self, summary: &Value) -> HandlerOutcome {
        let mut state = self.state.load();
        let current_poll = summary
            .get("poll_count")
            .and_then(Value::as_u64)
            .unwrap_or(state.poll_count);

        let mut recovered = Vec::new();
        for (issue_number, project_item_id) in processed_with_status(summary, "In Review") {
            let Some(item) = state.items.get(&project_item_id) else {
                continue;
            };
            if item.last_dispatched_role != "REVIEWER"
                || item.last_dispatched_poll == 0
                || item.last_dispatched_poll >= current_poll
                || !item.last_reviewer_outcome.is_empty()
            {
                continue;
            }

            let stale_run_id = item.last_run_id.clone();
            let row = match &self.ledger {
                Some(ledger) => ledger.get(&stale_run_id).map_err(stringify)?,
                None => None,
            };
            let lost = match row {
                None => true,
                Some(row) => {
                    let has_outcome = row
                        .result
                        .as_ref()
                        .and_then(|r| r.reviewer_outcome.as_deref())
                        .map(|o| !o.is_empty())
                        .unwrap_or(false);
                    matches!(row.status, RunState::Queued | RunState::Failed) && !has_outcome
                }
            };
            if lost {
                recovered.push((project_item_id, issue_number, stale_run_id));
            }
        }

        if recovered.is_empty() {
            return Ok(());
        }
        for (project_item_id, issue_number, stale_run_id) in &recovered {
            if let Some(item) = state.items.get_mut(project_item_id) {
                item.clear_dispatch();
            }
            self.events.emit(json!({
                "type": "REVIEW_DISPATCH_RECOVERED",
                "issue_number": issue_number,
                "project_item_id": project_item_id,
                "stale_run_id": stale_run_id,
            }));
        }
        self.state.save(&state).map_err(stringify)?;
        Ok(())
    }

    /// Escalate review churn to a human, but only on a second opinion: at
    /// least two reviewer dispatches this status epoch, and reviewer feedback
    /// is the most recent event.
    async fn handle_review_stall(&self, summary: &Value) -> HandlerOutcome {
        let churn = summary
            .get("needs_attention")
            .and_then(|n| n.get("in_review_churn"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for entry in churn {
            let polls = entry.get("in_review_polls").and_then(Value::as_u64).unwrap_or(0);
            if polls <= self.options.review_stall_polls {
                continue;
            }
            let issue_number = entry.get("issue_number").and_then(Value::as_i64).unwrap_or(0);
            let Some(project_item_id) = entry.get("project_item_id").and_then(Value::as_str)
            else {
                continue;
            };
            self.events.emit(json!({
                "type": "REVIEW_STALL_DETECTED",
                "issue_number": issue_number,
                "project_item_id": project_item_id,
                "in_review_polls": polls,
            }));

            let state = self.state.load();
            let Some(item) = state.items.get(project_item_id) else {
                continue;
            };
            if item.reviewer_dispatches_for_current_status < 2 {
                continue;
            }
            // Escalate only when no executor response postdates the feedback.
            let feedback = parse_iso(&item.last_reviewer_feedback_at);
            let response = parse_iso(&item.last_executor_response_at);
            if response > feedback {
                continue;
            }

            let linked = self
                .backend
                .post_resolve_linked_pr(json!({ "role": "ORCHESTRATOR", "issue_number": issue_number }))
                .await
                .map_err(stringify)?;
            self.backend
                .post_field_update(json!({
                    "role": "ORCHESTRATOR",
                    "project_item_id": project_item_id,
                    "field": "Status",
                    "value": "Needs Human Approval",
                    "issue_number": issue_number,
                    "pr_url": linked.get("pr_url").and_then(Value::as_str),
                    "human_approval_checklist": crate::runner::HUMAN_APPROVAL_CHECKLIST,
                }))
                .await
                .map_err(stringify)?;
            self.events.emit(json!({
                "type": "REVIEW_STALL_ESCALATED",
                "issue_number": issue_number,
                "project_item_id": project_item_id,
            }));
        }
        Ok(())
    }

    /// Blocked items whose recorded failure is retryable go back to Ready
    /// after the cooldown.
    async fn handle_blocked_retries(&self, summary: &Value) -> HandlerOutcome {
        let Some(ledger) = &self.ledger else {
            return Ok(());
        };
        for (issue_number, project_item_id) in processed_with_status(summary, "Blocked") {
            let state = self.state.load();
            let Some(item) = state.items.get(&project_item_id) else {
                continue;
            };
            let Some(since) = parse_iso(&item.status_since_at) else {
                continue;
            };
            let minutes = (self.clock.now_utc() - since).num_minutes();
            if minutes < self.options.blocked_retry_minutes {
                continue;
            }

            let Some(row) = ledger.get(&item.last_run_id).map_err(stringify)? else {
                continue;
            };
            let retryable = row
                .result
                .as_ref()
                .map(|record| {
                    is_retryable(
                        record.failure_classification.as_deref().unwrap_or(""),
                        record.error_code.as_deref().unwrap_or(""),
                    )
                })
                .unwrap_or(false);
            if !retryable {
                continue;
            }

            self.backend
                .post_field_update(json!({
                    "role": "ORCHESTRATOR",
                    "project_item_id": project_item_id,
                    "field": "Status",
                    "value": "Ready",
                    "issue_number": issue_number,
                }))
                .await
                .map_err(stringify)?;
            self.events.emit(json!({
                "type": "BLOCKED_RETRY_PROMOTED",
                "issue_number": issue_number,
                "project_item_id": project_item_id,
                "minutes_blocked": minutes,
            }));
        }
        Ok(())
    }

    /// Too many review cycles parks the item for a human.
    async fn handle_in_review_cycle_caps(&self, summary: &Value) -> HandlerOutcome {
        for (issue_number, project_item_id) in processed_with_status(summary, "In Review") {
            let state = self.state.load();
            let Some(item) = state.items.get(&project_item_id) else {
                continue;
            };
            if item.review_cycle_count < REVIEW_CYCLE_CAP {
                continue;
            }
            self.backend
                .post_field_update(json!({
                    "role": "ORCHESTRATOR",
                    "project_item_id": project_item_id,
                    "field": "Status",
                    "value": "Blocked",
                    "issue_number": issue_number,
                    "failure_classification": FailureClass::ItemStop.as_str(),
                    "failure_message": "Exceeded review iterations",
                }))
                .await
                .map_err(stringify)?;
            self.events.emit(json!({
                "type": "REVIEW_CYCLE_CAP_REACHED",
                "issue_number": issue_number,
                "project_item_id": project_item_id,
                "review_cycle_count": item.review_cycle_count,
            }));
        }
        Ok(())
    }

    /// A ledger row still `running` long past the watchdog budget belongs to
    /// a dead worker. Fail the row, then recover the item: executors go to
    /// Blocked, reviewers release the dispatch epoch for a retry.
    async fn handle_running_watchdog(&self, summary: &Value) -> HandlerOutcome {
        let Some(ledger) = &self.ledger else {
            return Ok(());
        };
        for status in WATCHDOG_STATUSES {
            for (issue_number, project_item_id) in processed_with_status(summary, status) {
                let mut state = self.state.load();
                let Some(item) = state.items.get(&project_item_id).cloned() else {
                    continue;
                };
                if item.last_run_id.is_empty() {
                    continue;
                }
                let Some(row) = ledger.get(&item.last_run_id).map_err(stringify)? else {
                    continue;
                };
                if row.status != RunState::Running {
                    continue;
                }
                let started = parse_iso(row.running_at.as_deref().unwrap_or(""))
                    .or_else(|| parse_iso(&row.received_at));
                let Some(started) = started else {
                    continue;
                };
                let elapsed_s = (self.clock.now_utc() - started).num_seconds();
                if elapsed_s <= self.options.watchdog_timeout_s {
                    continue;
                }

                ledger
                    .mark_result(
                        &item.last_run_id,
                        RunState::Failed,
                        RunRecord {
                            status: Some("failed".to_string()),
                            summary: Some(format!(
                                "worker watchdog timeout after {elapsed_s}s"
                            )),
                            failure_classification: Some(
                                FailureClass::ItemStop.as_str().to_string(),
                            ),
                            error_code: Some("watchdog_timeout".to_string()),
                            ..RunRecord::default()
                        },
                    )
                    .map_err(stringify)?;
                self.events.emit(json!({
                    "type": "WORKER_WATCHDOG_TIMEOUT",
                    "issue_number": issue_number,
                    "project_item_id": project_item_id,
                    "run_id": item.last_run_id,
                    "elapsed_s": elapsed_s,
                }));

                if item.last_dispatched_role == "REVIEWER" {
                    let now = self.clock.now_iso();
                    if let Some(entry) = state.items.get_mut(&project_item_id) {
                        entry.clear_dispatch();
                        entry.last_reviewer_outcome = "INCOMPLETE".to_string();
                        entry.last_reviewer_feedback_at = now;
                        entry.review_cycle_count += 1;
                    }
                    self.state.save(&state).map_err(stringify)?;
                    self.events.emit(json!({
                        "type": "WORKER_WATCHDOG_TIMEOUT_RECOVERY",
                        "issue_number": issue_number,
                        "project_item_id": project_item_id,
                        "run_id": item.last_run_id,
                    }));
                } else {
                    self.transition_executor_failure_to_blocked(
                        &item.last_run_id,
                        FailureClass::ItemStop.as_str(),
                        "worker watchdog timeout",
                    )
                    .await;
                }
            }
        }
        Ok(())
    }
}

type HandlerOutcome = Result<(), String>;

fn stringify(error: impl std::fmt::Display) -> String {
    error.to_string()
}

/// Processed items from the summary carrying the given status.
fn processed_with_status(summary: &Value, status: &str) -> Vec<(i64, String)> {
    summary
        .get("processed_items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|item| item.get("status").and_then(Value::as_str) == Some(status))
                .filter_map(|item| {
                    let issue = item.get("issue_number").and_then(Value::as_i64)?;
                    let id = item.get("project_item_id").and_then(Value::as_str)?;
                    Some((issue, id.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
#[path = "reconcile_tests.rs"]
mod tests;
