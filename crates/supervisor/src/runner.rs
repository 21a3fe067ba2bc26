// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Supervisor runtime: role-partitioned worker pools and the ledger-gated
//! dispatch path.
//!
//! Every intent runs exactly once per lifecycle: a `succeeded` ledger row is
//! terminal and re-dispatch is skipped. Errors are classified exactly once;
//! ITEM_STOP recovers the affected item and the pool keeps running, anything
//! harder drains the pool.

use crate::gate::IssueGate;
use serde_json::json;
use sf_adapters::{BackendApi, CodexWorkerError, HttpError, TranscriptHandle, WorkerDriver};
use sf_core::{
    Clock, EventSink, FailureClass, IntentError, ReviewerOutcome, Role, RunIntent, RunStatus,
    WorkerResult, ITEM_STOP_WORKER_CODES,
};
use sf_storage::{LedgerError, LedgerRow, RunLedger, RunRecord, RunState, StateStore};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const HEARTBEAT_EVERY: Duration = Duration::from_secs(30);
const QUEUE_POP_TIMEOUT: Duration = Duration::from_millis(200);
const FAILURE_MESSAGE_MAX_CHARS: usize = 500;

/// Checklist text attached to every Needs Human Approval transition.
pub const HUMAN_APPROVAL_CHECKLIST: &str = "Human approval checklist:\n\
- [ ] Review the linked PR diff against the issue's acceptance criteria\n\
- [ ] Confirm CI is green on the PR\n\
- [ ] Merge the PR manually (the supervisor never merges)\n\
- [ ] Move the item to Done";

/// Any failure a worker run can surface, classified exactly once.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Intent(#[from] IntentError),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Worker(#[from] CodexWorkerError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Pure reducer over error kind + code + status (spec'd taxonomy). Unknown
/// shapes fail closed as HARD_STOP.
pub fn classify_failure(error: &RunError) -> FailureClass {
    match error {
        RunError::Intent(_) => FailureClass::HardStop,
        RunError::Http(http) => match http {
            HttpError::Unreachable { .. } => FailureClass::Transient,
            HttpError::Status { status, .. } if *status == 409 => FailureClass::ItemStop,
            HttpError::Status { status, .. } if *status >= 500 => FailureClass::Transient,
            HttpError::Status { .. } | HttpError::InvalidPayload { .. } => FailureClass::HardStop,
        },
        RunError::Worker(worker) => {
            if ITEM_STOP_WORKER_CODES.contains(&worker.code()) {
                FailureClass::ItemStop
            } else {
                FailureClass::HardStop
            }
        }
        RunError::Ledger(_) => FailureClass::HardStop,
    }
}

/// Stable wire code for a run error.
pub fn run_error_code(error: &RunError) -> &'static str {
    match error {
        RunError::Intent(intent) => intent.code(),
        RunError::Http(http) => http.code(),
        RunError::Worker(worker) => worker.code(),
        RunError::Ledger(_) => "ledger_error",
    }
}

/// Supervisor knobs carried by the runner.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub dry_run: bool,
    pub review_stall_polls: u64,
    pub blocked_retry_minutes: i64,
    pub watchdog_timeout_s: i64,
    /// How long to poll the state file for an issue number on claim-ready
    /// intents whose body lacks one.
    pub issue_resolve_timeout: Duration,
    pub issue_resolve_poll: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            review_stall_polls: 50,
            blocked_retry_minutes: 15,
            watchdog_timeout_s: 900,
            issue_resolve_timeout: Duration::from_secs(5),
            issue_resolve_poll: Duration::from_millis(250),
        }
    }
}

/// The supervisor runtime.
pub struct Runner<B, W, C> {
    pub(crate) backend: Arc<B>,
    pub(crate) driver: Arc<W>,
    pub(crate) ledger: Option<Arc<RunLedger>>,
    pub(crate) state: StateStore,
    pub(crate) clock: C,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) transcript: TranscriptHandle,
    pub(crate) gate: IssueGate,
    pub(crate) options: RunnerOptions,

    executor_tx: mpsc::UnboundedSender<RunIntent>,
    executor_rx: Mutex<mpsc::UnboundedReceiver<RunIntent>>,
    reviewer_tx: mpsc::UnboundedSender<RunIntent>,
    reviewer_rx: Mutex<mpsc::UnboundedReceiver<RunIntent>>,

    stop: CancellationToken,
    stop_reason: parking_lot::Mutex<Option<String>>,
}

impl<B, W, C> Runner<B, W, C>
where
    B: BackendApi + 'static,
    W: WorkerDriver + 'static,
    C: Clock + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<B>,
        driver: Arc<W>,
        ledger: Option<Arc<RunLedger>>,
        state: StateStore,
        clock: C,
        events: Arc<dyn EventSink>,
        transcript: TranscriptHandle,
        options: RunnerOptions,
    ) -> Self {
        let (executor_tx, executor_rx) = mpsc::unbounded_channel();
        let (reviewer_tx, reviewer_rx) = mpsc::unbounded_channel();
        Self {
            backend,
            driver,
            ledger,
            state,
            clock,
            events,
            transcript,
            gate: IssueGate::new(),
            options,
            executor_tx,
            executor_rx: Mutex::new(executor_rx),
            reviewer_tx,
            reviewer_rx: Mutex::new(reviewer_rx),
            stop: CancellationToken::new(),
            stop_reason: parking_lot::Mutex::new(None),
        }
    }

    /// Record the reason and signal every worker to drain.
    pub fn hard_stop(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut slot = self.stop_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
        drop(slot);
        self.stop.cancel();
    }

    pub fn should_stop(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn stop_reason(&self) -> String {
        self.stop_reason.lock().clone().unwrap_or_else(|| "hard stop".to_string())
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Route an intent to its role's FIFO queue.
    pub fn enqueue(&self, intent: RunIntent) {
        let tx = match intent.role {
            Role::Executor => &self.executor_tx,
            Role::Reviewer => &self.reviewer_tx,
        };
        let _ = tx.send(intent);
    }

    /// One worker slot: pop, handle, classify. ITEM_STOP-class failures log
    /// and continue; anything else drains the pool.
    pub async fn run_worker_loop(&self, role: Role) {
        loop {
            if self.should_stop() {
                break;
            }
            let intent = {
                let rx = match role {
                    Role::Executor => &self.executor_rx,
                    Role::Reviewer => &self.reviewer_rx,
                };
                let mut rx = rx.lock().await;
                match tokio::time::timeout(QUEUE_POP_TIMEOUT, rx.recv()).await {
                    Err(_) => continue,
                    Ok(None) => break,
                    Ok(Some(intent)) => intent,
                }
            };

            if let Err(error) = self.handle_intent(&intent).await {
                let classification = classify_failure(&error);
                if classification == FailureClass::HardStop {
                    self.hard_stop(format!("{}: {}", classification, error));
                } else {
                    self.events.emit(json!({
                        "type": "ITEM_STOP",
                        "role": role.as_str(),
                        "run_id": intent.run_id,
                        "error": error.to_string(),
                    }));
                }
            }
        }
    }

    /// Dispatch one intent end-to-end.
    pub async fn handle_intent(&self, intent: &RunIntent) -> Result<(), RunError> {
        if self.options.dry_run {
            self.events.emit(json!({
                "type": "DRY_RUN_WOULD_EXECUTE",
                "role": intent.role.as_str(),
                "run_id": intent.run_id,
                "endpoint": intent.endpoint,
                "body": intent.body,
            }));
            return Ok(());
        }

        if let Some(ledger) = &self.ledger {
            if let Some(existing) = ledger.get(&intent.run_id)? {
                if existing.status == RunState::Succeeded {
                    self.events.emit(json!({
                        "type": "LEDGER_SKIP",
                        "run_id": intent.run_id,
                        "reason": "already_succeeded",
                    }));
                    return Ok(());
                }
            }
            // Re-dispatch of a non-succeeded run starts a fresh lifecycle.
            ledger.upsert(LedgerRow {
                run_id: intent.run_id.clone(),
                role: intent.role.as_str().to_string(),
                intent_hash: intent.intent_hash(),
                received_at: self.clock.now_iso(),
                status: RunState::Queued,
                running_at: None,
                result: None,
            })?;
            ledger.mark_running(&intent.run_id, &self.clock.now_iso())?;
        }

        let issue = self.resolve_issue_number(intent).await;
        let _heartbeat = self.spawn_heartbeat(intent);

        if let Some(issue) = issue {
            self.gate.reserve(issue, &intent.run_id, intent.role, &*self.events).await;
        }

        let outcome = self.drive_and_post_process(intent, issue).await;

        if let Err(error) = &outcome {
            self.record_failure(intent, issue, error).await;
        }
        if let Some(issue) = issue {
            self.gate.release(issue, &intent.run_id);
        }
        outcome
    }

    async fn drive_and_post_process(
        &self,
        intent: &RunIntent,
        issue: Option<i64>,
    ) -> Result<(), RunError> {
        // Bundle injection: fetched verbatim from the backend per run.
        let bundle = self.backend.agent_context(intent.role.as_str()).await?;
        let result = self
            .driver
            .run_intent(
                &bundle,
                intent,
                self.backend.base_url(),
                self.transcript.bind(&intent.run_id),
            )
            .await?;
        match intent.role {
            Role::Executor => self.post_process_executor(intent, issue, result).await,
            Role::Reviewer => self.post_process_reviewer(intent, issue, result).await,
        }
    }

    async fn post_process_executor(
        &self,
        intent: &RunIntent,
        issue: Option<i64>,
        result: WorkerResult,
    ) -> Result<(), RunError> {
        // A PR claim is only trusted when the worker verified the run marker.
        if result.advertised_pr_url().is_some() && result.marker_verified != Some(true) {
            return Err(CodexWorkerError::InvalidOutput(
                "executor advertised a pull request without marker verification".to_string(),
            )
            .into());
        }

        if result.status == RunStatus::Failed {
            // Worker-declared failure: the run completed, the item did not.
            if let Some(ledger) = &self.ledger {
                ledger.mark_result(
                    &intent.run_id,
                    RunState::Failed,
                    RunRecord {
                        status: Some("failed".to_string()),
                        summary: Some(result.summary.clone()),
                        urls: result.urls.clone(),
                        errors: result.errors.clone(),
                        failure_classification: Some(FailureClass::ItemStop.as_str().to_string()),
                        error_code: Some("worker_reported_failure".to_string()),
                        ..RunRecord::default()
                    },
                )?;
            }
            self.transition_executor_failure_to_blocked(
                &intent.run_id,
                FailureClass::ItemStop.as_str(),
                &clip(&result.summary, FAILURE_MESSAGE_MAX_CHARS),
            )
            .await;
            return Ok(());
        }

        let now = self.clock.now_iso();
        let mut response_at = None;
        if let Some(issue) = issue {
            if self.record_executor_response_state(issue, &now) {
                response_at = Some(now.clone());
            }
        }

        if let Some(ledger) = &self.ledger {
            ledger.mark_result(
                &intent.run_id,
                RunState::Succeeded,
                RunRecord {
                    status: Some("succeeded".to_string()),
                    summary: Some(result.summary),
                    urls: result.urls,
                    errors: result.errors,
                    last_executor_response_at: response_at,
                    ..RunRecord::default()
                },
            )?;
        }
        Ok(())
    }

    async fn post_process_reviewer(
        &self,
        intent: &RunIntent,
        issue: Option<i64>,
        result: WorkerResult,
    ) -> Result<(), RunError> {
        let Some(outcome) = result.outcome else {
            // Contract violation; the failure path records INCOMPLETE.
            return Err(CodexWorkerError::InvalidOutput(
                "reviewer result is missing an outcome".to_string(),
            )
            .into());
        };

        let now = self.clock.now_iso();
        if let Some(issue) = issue {
            self.record_reviewer_outcome_state(issue, outcome.as_str(), &now);
        }

        if outcome == ReviewerOutcome::Pass {
            if let Some(issue) = issue {
                self.promote_passed_review(issue).await?;
            } else {
                tracing::warn!(run_id = %intent.run_id, "reviewer PASS without an issue number; no transition");
            }
        }

        if let Some(ledger) = &self.ledger {
            let terminal = match result.status {
                RunStatus::Succeeded => RunState::Succeeded,
                RunStatus::Failed => RunState::Failed,
            };
            ledger.mark_result(
                &intent.run_id,
                terminal,
                RunRecord {
                    status: Some(result.status.as_str().to_string()),
                    summary: Some(result.summary),
                    urls: result.urls,
                    errors: result.errors,
                    reviewer_outcome: Some(outcome.as_str().to_string()),
                    last_reviewer_feedback_at: Some(now),
                    ..RunRecord::default()
                },
            )?;
        }
        Ok(())
    }

    /// Resolve the linked PR and move the item to Needs Human Approval.
    /// Shared by the reviewer PASS path and the stale-PASS recovery handler.
    pub(crate) async fn promote_passed_review(&self, issue: i64) -> Result<(), RunError> {
        let linked = self
            .backend
            .post_resolve_linked_pr(json!({ "role": "ORCHESTRATOR", "issue_number": issue }))
            .await?;
        let returned_item = linked.get("project_item_id").and_then(serde_json::Value::as_str);
        let pr_url = linked.get("pr_url").and_then(serde_json::Value::as_str);

        let state = self.state.load();
        let state_item = state.resolve_item_for_issue(issue);
        if let (Some(returned), Some(resolved)) = (returned_item, &state_item) {
            if returned != resolved.project_item_id {
                self.events.emit(json!({
                    "type": "REVIEWER_LINKAGE_MISMATCH",
                    "issue_number": issue,
                    "resolved_project_item_id": returned,
                    "state_project_item_id": resolved.project_item_id,
                }));
                return Ok(());
            }
        }
        let project_item_id = match returned_item {
            Some(id) => id.to_string(),
            None => match &state_item {
                Some(resolved) => resolved.project_item_id.to_string(),
                None => {
                    tracing::warn!(issue, "no project item id for passed review; no transition");
                    return Ok(());
                }
            },
        };

        self.backend
            .post_field_update(json!({
                "role": "ORCHESTRATOR",
                "project_item_id": project_item_id,
                "field": "Status",
                "value": "Needs Human Approval",
                "issue_number": issue,
                "pr_url": pr_url,
                "human_approval_checklist": HUMAN_APPROVAL_CHECKLIST,
            }))
            .await?;
        Ok(())
    }

    /// Record a reviewer outcome on the currently-active state item for the
    /// issue. FAIL and INCOMPLETE count as review cycles.
    pub(crate) fn record_reviewer_outcome_state(&self, issue: i64, outcome: &str, recorded_at: &str) {
        let mut state = self.state.load();
        let resolved = match state.resolve_item_for_issue(issue) {
            Some(resolved) => {
                if resolved.candidates > 1 {
                    self.events.emit(json!({
                        "type": "STATE_DUPLICATE_ITEMS_OBSERVED",
                        "issue_number": issue,
                        "candidates": resolved.candidates,
                        "selected": resolved.project_item_id,
                    }));
                }
                resolved.project_item_id.to_string()
            }
            None => return,
        };
        if let Some(item) = state.items.get_mut(&resolved) {
            item.last_reviewer_outcome = outcome.to_string();
            item.last_reviewer_feedback_at = recorded_at.to_string();
            if outcome == "FAIL" || outcome == "INCOMPLETE" {
                item.review_cycle_count += 1;
            }
        }
        if let Err(e) = self.state.save(&state) {
            tracing::warn!(error = %e, "state save failed after reviewer outcome");
        }
    }

    /// Stamp the executor response timestamp when the item is In Review.
    /// Returns whether a stamp was written.
    pub(crate) fn record_executor_response_state(&self, issue: i64, at: &str) -> bool {
        let mut state = self.state.load();
        let resolved = match state.resolve_item_for_issue(issue) {
            Some(resolved) if resolved.item.last_seen_status == "In Review" => {
                resolved.project_item_id.to_string()
            }
            _ => return false,
        };
        if let Some(item) = state.items.get_mut(&resolved) {
            item.last_executor_response_at = at.to_string();
        }
        match self.state.save(&state) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "state save failed after executor response");
                false
            }
        }
    }

    /// Recover an executor failure by moving the item to Blocked. Only
    /// `In Progress` and `In Review` are recoverable.
    pub async fn transition_executor_failure_to_blocked(
        &self,
        run_id: &str,
        failure_classification: &str,
        failure_message: &str,
    ) {
        let state = self.state.load();
        let found = state
            .items
            .iter()
            .find(|(_, item)| item.last_run_id == run_id)
            .map(|(id, item)| (id.clone(), item.clone()));
        let Some((project_item_id, item)) = found else {
            self.events.emit(json!({
                "type": "WORKER_RECOVERY_SKIPPED",
                "run_id": run_id,
                "reason": "item_not_found",
            }));
            return;
        };

        let status = item.last_seen_status.as_str();
        if status != "In Progress" && status != "In Review" {
            self.events.emit(json!({
                "type": "WORKER_RECOVERY_SKIPPED",
                "run_id": run_id,
                "status": status,
            }));
            return;
        }

        let suggested_next_steps: Vec<&str> = if status == "In Review" {
            vec![
                "Continue the fix on the existing linked PR branch; do not open a new PR.",
                "Re-promote the item to Ready once the branch is healthy.",
            ]
        } else {
            vec![
                "Inspect the failure message and address the cause.",
                "Re-promote the item to Ready to dispatch a fresh executor run.",
            ]
        };

        let body = json!({
            "role": "ORCHESTRATOR",
            "project_item_id": project_item_id,
            "field": "Status",
            "value": "Blocked",
            "issue_number": item.last_seen_issue_number,
            "failure_classification": failure_classification,
            "failure_message": clip(failure_message, FAILURE_MESSAGE_MAX_CHARS),
            "suggested_next_steps": suggested_next_steps,
        });
        if let Err(error) = self.backend.post_field_update(body).await {
            self.events.emit(json!({
                "type": "WORKER_RECOVERY_FAILED",
                "run_id": run_id,
                "error": error.to_string(),
            }));
        }
    }

    /// Failure bookkeeping: classify, record in the ledger (reviewers record
    /// an INCOMPLETE verdict), and recover the item where possible.
    async fn record_failure(&self, intent: &RunIntent, issue: Option<i64>, error: &RunError) {
        let classification = classify_failure(error);
        let code = run_error_code(error);
        let message = clip(&error.to_string(), FAILURE_MESSAGE_MAX_CHARS);

        let reviewer_outcome = match intent.role {
            Role::Reviewer => {
                let now = self.clock.now_iso();
                if let Some(issue) = issue {
                    self.record_reviewer_outcome_state(issue, "INCOMPLETE", &now);
                }
                Some("INCOMPLETE".to_string())
            }
            Role::Executor => None,
        };

        if let Some(ledger) = &self.ledger {
            let marked = ledger.mark_result(
                &intent.run_id,
                RunState::Failed,
                RunRecord {
                    status: Some("failed".to_string()),
                    summary: Some(message.clone()),
                    errors: vec![json!({ "error": message })],
                    reviewer_outcome,
                    failure_classification: Some(classification.as_str().to_string()),
                    error_code: Some(code.to_string()),
                    ..RunRecord::default()
                },
            );
            if let Err(e) = marked {
                tracing::warn!(run_id = %intent.run_id, error = %e, "ledger mark failed");
            }
        }

        if intent.role == Role::Executor && classification != FailureClass::HardStop {
            self.transition_executor_failure_to_blocked(
                &intent.run_id,
                classification.as_str(),
                &message,
            )
            .await;
        }
    }

    /// Resolve the issue number: intent body first, then (for claim-ready
    /// executor intents) a bounded poll of the state file for the planner's
    /// record of this run.
    async fn resolve_issue_number(&self, intent: &RunIntent) -> Option<i64> {
        if let Some(issue) = intent.issue_number() {
            return Some(issue);
        }
        if intent.role != Role::Executor
            || !intent.endpoint.ends_with("/executor/claim-ready-item")
        {
            return None;
        }
        let deadline = tokio::time::Instant::now() + self.options.issue_resolve_timeout;
        loop {
            let state = self.state.load();
            let found = state
                .items
                .values()
                .find(|item| item.last_run_id == intent.run_id && item.last_seen_issue_number != 0)
                .map(|item| item.last_seen_issue_number);
            if found.is_some() {
                return found;
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(self.options.issue_resolve_poll).await;
        }
    }

    fn spawn_heartbeat(&self, intent: &RunIntent) -> HeartbeatGuard {
        let events = Arc::clone(&self.events);
        let run_id = intent.run_id.clone();
        let role = intent.role;
        HeartbeatGuard(tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            loop {
                tokio::time::sleep(HEARTBEAT_EVERY).await;
                events.emit(json!({
                    "type": "WORKER_HEARTBEAT",
                    "run_id": run_id,
                    "role": role.as_str(),
                    "elapsed_s": started.elapsed().as_secs(),
                }));
            }
        }))
    }
}

/// Stops the heartbeat task when the dispatch path unwinds.
struct HeartbeatGuard(JoinHandle<()>);

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub(crate) fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
