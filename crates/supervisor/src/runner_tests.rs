// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tests for the dispatch path and post-run state updates

use super::*;
use crate::test_helpers::*;
use serde_json::json;
use sf_core::{ReviewerOutcome, Role, RunStatus};
use sf_storage::{RunLedger, RunState};
use std::sync::Arc;
use tempfile::TempDir;

fn write_state(path: &std::path::Path, state: serde_json::Value) {
    std::fs::write(path, state.to_string()).unwrap();
}

fn ledger_in(dir: &TempDir) -> Arc<RunLedger> {
    Arc::new(RunLedger::new(dir.path().join("runner-ledger.json")))
}

#[tokio::test]
async fn dry_run_reports_without_executing() {
    let dir = TempDir::new().unwrap();
    let fx = fixture(
        &dir.path().join("state.json"),
        None,
        RunnerOptions { dry_run: true, ..RunnerOptions::default() },
    );
    let intent = executor_intent("run-dry");

    fx.runner.handle_intent(&intent).await.unwrap();

    let events = fx.sink.of_type("DRY_RUN_WOULD_EXECUTE");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["run_id"], "run-dry");
    assert!(fx.backend.calls.lock().is_empty());
}

#[tokio::test]
async fn succeeded_run_is_skipped_on_redispatch() {
    let dir = TempDir::new().unwrap();
    let ledger = ledger_in(&dir);
    ledger
        .upsert(sf_storage::LedgerRow {
            run_id: "run-1".to_string(),
            role: "EXECUTOR".to_string(),
            intent_hash: "h".to_string(),
            received_at: "2026-02-08T00:00:00.000Z".to_string(),
            status: RunState::Succeeded,
            running_at: None,
            result: None,
        })
        .unwrap();
    // The driver has no scripted result: reaching it would fail the test.
    let fx = fixture(&dir.path().join("state.json"), Some(ledger), RunnerOptions::default());

    fx.runner.handle_intent(&executor_intent("run-1")).await.unwrap();

    let skips = fx.sink.of_type("LEDGER_SKIP");
    assert_eq!(skips.len(), 1);
    assert_eq!(skips[0]["reason"], "already_succeeded");
}

#[tokio::test]
async fn missing_reviewer_outcome_fails_closed() {
    let dir = TempDir::new().unwrap();
    let ledger = ledger_in(&dir);
    let intent = reviewer_intent("run-r1", 2);
    let mut result = worker_result("run-r1", Role::Reviewer, RunStatus::Succeeded);
    result.summary = "No outcome provided.".to_string();
    let fx = fixture_with(
        StubBackend::default(),
        MapDriver::with_result(result),
        &dir.path().join("state.json"),
        Some(Arc::clone(&ledger)),
        RunnerOptions::default(),
    );

    let err = fx.runner.handle_intent(&intent).await.unwrap_err();
    assert_eq!(run_error_code(&err), "worker_invalid_output");

    let row = ledger.get("run-r1").unwrap().unwrap();
    assert_eq!(row.status, RunState::Failed);
    assert_eq!(row.result.unwrap().reviewer_outcome.as_deref(), Some("INCOMPLETE"));
}

#[tokio::test]
async fn reviewer_fail_outcome_is_recorded_without_board_writes() {
    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("state.json");
    write_state(
        &state_path,
        json!({
            "poll_count": 1,
            "items": {
                "PVTI_2": {
                    "last_seen_issue_number": 2,
                    "last_seen_status": "In Review",
                    "last_run_id": "review-run",
                }
            },
        }),
    );
    let ledger = ledger_in(&dir);
    let intent = reviewer_intent("run-r2", 2);
    let mut result = worker_result("run-r2", Role::Reviewer, RunStatus::Succeeded);
    result.outcome = Some(ReviewerOutcome::Fail);
    result.summary = "Blocking findings posted as issue comment.".to_string();
    let fx = fixture_with(
        StubBackend::default(),
        MapDriver::with_result(result),
        &state_path,
        Some(Arc::clone(&ledger)),
        RunnerOptions::default(),
    );

    fx.runner.handle_intent(&intent).await.unwrap();

    let row = ledger.get("run-r2").unwrap().unwrap();
    assert_eq!(row.status, RunState::Succeeded);
    assert_eq!(row.result.unwrap().reviewer_outcome.as_deref(), Some("FAIL"));
    assert!(fx.backend.update_calls().is_empty());

    let state: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&state_path).unwrap()).unwrap();
    assert_eq!(state["items"]["PVTI_2"]["last_reviewer_outcome"], "FAIL");
    assert_eq!(state["items"]["PVTI_2"]["review_cycle_count"], 1);
    assert!(state["items"]["PVTI_2"]["last_reviewer_feedback_at"].as_str().unwrap().len() > 0);
}

#[tokio::test]
async fn reviewer_pass_moves_item_to_needs_human_approval() {
    let dir = TempDir::new().unwrap();
    let intent = reviewer_intent("run-pass", 2);
    let mut result = worker_result("run-pass", Role::Reviewer, RunStatus::Succeeded);
    result.outcome = Some(ReviewerOutcome::Pass);
    result.summary = "All checks passed.".to_string();
    let fx = fixture_with(
        StubBackend::default(),
        MapDriver::with_result(result),
        &dir.path().join("state.json"),
        None,
        RunnerOptions::default(),
    );

    fx.runner.handle_intent(&intent).await.unwrap();

    let resolves = fx.backend.calls_to("/internal/reviewer/resolve-linked-pr");
    assert_eq!(resolves.len(), 1);
    assert_eq!(resolves[0]["issue_number"], 2);

    let updates = fx.backend.update_calls();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["role"], "ORCHESTRATOR");
    assert_eq!(updates[0]["value"], "Needs Human Approval");
    assert_eq!(updates[0]["issue_number"], 2);
    assert_eq!(updates[0]["project_item_id"], "PVTI_2");
    assert!(updates[0]["pr_url"].as_str().unwrap().ends_with("/pull/2"));
    assert!(updates[0]["human_approval_checklist"]
        .as_str()
        .unwrap()
        .contains("never merges"));
}

#[tokio::test]
async fn reviewer_pass_with_mismatched_linkage_skips_the_update() {
    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("state.json");
    write_state(
        &state_path,
        json!({
            "poll_count": 1,
            "items": {
                "PVTI_other": {
                    "last_seen_issue_number": 2,
                    "last_seen_status": "In Review",
                }
            },
        }),
    );
    let intent = reviewer_intent("run-pass", 2);
    let mut result = worker_result("run-pass", Role::Reviewer, RunStatus::Succeeded);
    result.outcome = Some(ReviewerOutcome::Pass);
    let backend = StubBackend {
        resolve_project_item_id: "PVTI_resolved".to_string(),
        ..StubBackend::default()
    };
    let fx = fixture_with(
        backend,
        MapDriver::with_result(result),
        &state_path,
        None,
        RunnerOptions::default(),
    );

    fx.runner.handle_intent(&intent).await.unwrap();

    assert!(fx.backend.update_calls().is_empty());
    assert_eq!(fx.sink.of_type("REVIEWER_LINKAGE_MISMATCH").len(), 1);
}

#[tokio::test]
async fn executor_pr_without_marker_fails() {
    for url_key in ["pr_url", "pull_request", "pr", "resolved_pr"] {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        let intent = executor_intent("run-pr");
        let mut result = worker_result("run-pr", Role::Executor, RunStatus::Succeeded);
        result.summary = "Opened PR.".to_string();
        result
            .urls
            .insert(url_key.to_string(), "https://github.com/example/repo/pull/1".to_string());
        result.marker_verified = Some(false);
        let fx = fixture_with(
            StubBackend::default(),
            MapDriver::with_result(result),
            &dir.path().join("state.json"),
            Some(Arc::clone(&ledger)),
            RunnerOptions::default(),
        );

        let err = fx.runner.handle_intent(&intent).await.unwrap_err();
        assert_eq!(run_error_code(&err), "worker_invalid_output", "url key {url_key}");

        let row = ledger.get("run-pr").unwrap().unwrap();
        assert_eq!(row.status, RunState::Failed);
        assert_eq!(row.result.unwrap().error_code.as_deref(), Some("worker_invalid_output"));
        // No state item to recover: nothing is posted to the board.
        assert!(fx.backend.update_calls().is_empty());
        assert_eq!(fx.sink.of_type("WORKER_RECOVERY_SKIPPED").len(), 1);
    }
}

#[tokio::test]
async fn executor_response_is_stamped_when_item_is_in_review() {
    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("state.json");
    write_state(
        &state_path,
        json!({
            "poll_count": 1,
            "items": {
                "PVTI_2": {
                    "last_seen_issue_number": 2,
                    "last_seen_status": "In Review",
                    "last_reviewer_feedback_at": "2026-02-27T00:00:00.000Z",
                    "last_run_id": "run-fix",
                }
            },
        }),
    );
    let ledger = ledger_in(&dir);
    // Executor follow-up runs carry the issue in the body.
    let intent = sf_core::parse_intent(json!({
        "type": "RUN_INTENT",
        "role": "EXECUTOR",
        "run_id": "run-fix",
        "endpoint": "/internal/reviewer/resolve-linked-pr",
        "body": {"role": "EXECUTOR", "run_id": "run-fix", "issue_number": 2},
    }))
    .unwrap();
    let mut result = worker_result("run-fix", Role::Executor, RunStatus::Succeeded);
    result.summary = "Addressed review feedback.".to_string();
    let fx = fixture_with(
        StubBackend::default(),
        MapDriver::with_result(result),
        &state_path,
        Some(Arc::clone(&ledger)),
        RunnerOptions::default(),
    );

    fx.runner.handle_intent(&intent).await.unwrap();

    let state: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&state_path).unwrap()).unwrap();
    let stamped = state["items"]["PVTI_2"]["last_executor_response_at"].as_str().unwrap();
    assert!(stamped > "2026-02-27T00:00:00.000Z");

    let row = ledger.get("run-fix").unwrap().unwrap();
    assert_eq!(row.result.unwrap().last_executor_response_at.as_deref(), Some(stamped));
}

#[tokio::test]
async fn claim_ready_issue_is_resolved_from_the_state_file() {
    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("state.json");
    write_state(
        &state_path,
        json!({
            "poll_count": 1,
            "items": {
                "PVTI_2": {
                    "last_seen_issue_number": 2,
                    "last_seen_status": "In Review",
                    "last_run_id": "run-claim",
                }
            },
        }),
    );
    // Claim-ready body has no issue number; resolution comes from the state.
    let intent = executor_intent("run-claim");
    let result = worker_result("run-claim", Role::Executor, RunStatus::Succeeded);
    let fx = fixture_with(
        StubBackend::default(),
        MapDriver::with_result(result),
        &state_path,
        None,
        RunnerOptions::default(),
    );

    fx.runner.handle_intent(&intent).await.unwrap();

    let state: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&state_path).unwrap()).unwrap();
    assert!(!state["items"]["PVTI_2"]["last_executor_response_at"]
        .as_str()
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn executor_reported_failure_blocks_the_item() {
    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("state.json");
    write_state(
        &state_path,
        json!({
            "poll_count": 1,
            "items": {
                "PVTI_44": {
                    "last_seen_issue_number": 44,
                    "last_seen_status": "In Progress",
                    "last_dispatched_role": "EXECUTOR",
                    "last_run_id": "run-44",
                }
            },
        }),
    );
    let ledger = ledger_in(&dir);
    let intent = executor_intent("run-44");
    let mut result = worker_result("run-44", Role::Executor, RunStatus::Failed);
    result.summary = "could not apply patch".to_string();
    let fx = fixture_with(
        StubBackend::default(),
        MapDriver::with_result(result),
        &state_path,
        Some(Arc::clone(&ledger)),
        RunnerOptions::default(),
    );

    fx.runner.handle_intent(&intent).await.unwrap();

    let row = ledger.get("run-44").unwrap().unwrap();
    assert_eq!(row.status, RunState::Failed);
    let record = row.result.unwrap();
    assert_eq!(record.failure_classification.as_deref(), Some("ITEM_STOP"));
    assert_eq!(record.error_code.as_deref(), Some("worker_reported_failure"));

    let updates = fx.backend.update_calls();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["value"], "Blocked");
    assert_eq!(updates[0]["issue_number"], 44);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn executor_and_reviewer_on_the_same_issue_serialize() {
    use async_trait::async_trait;
    use sf_adapters::{CodexWorkerError, TranscriptHandle, WorkerDriver};
    use sf_core::{RunIntent, WorkerResult};
    use tokio::sync::Notify;

    struct GatedDriver {
        executor_started: Notify,
        executor_started_flag: std::sync::atomic::AtomicBool,
        allow_executor_finish: Notify,
        reviewer_started: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl WorkerDriver for GatedDriver {
        async fn run_intent(
            &self,
            _bundle: &serde_json::Value,
            intent: &RunIntent,
            _backend_base_url: &str,
            _transcript: TranscriptHandle,
        ) -> Result<WorkerResult, CodexWorkerError> {
            if intent.role == Role::Executor {
                self.executor_started_flag.store(true, std::sync::atomic::Ordering::SeqCst);
                self.executor_started.notify_waiters();
                self.allow_executor_finish.notified().await;
                let mut result = worker_result(&intent.run_id, Role::Executor, RunStatus::Succeeded);
                result.summary = "executor done".to_string();
                return Ok(result);
            }
            self.reviewer_started.store(true, std::sync::atomic::Ordering::SeqCst);
            let mut result = worker_result(&intent.run_id, Role::Reviewer, RunStatus::Succeeded);
            result.outcome = Some(ReviewerOutcome::Fail);
            result.summary = "reviewer done".to_string();
            Ok(result)
        }
    }

    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("state.json");
    write_state(
        &state_path,
        json!({
            "poll_count": 1,
            "items": {
                "PVTI_2": {
                    "last_seen_issue_number": 2,
                    "last_seen_status": "In Progress",
                    "last_dispatched_role": "EXECUTOR",
                    "last_run_id": "run-exec",
                }
            },
        }),
    );

    let driver = Arc::new(GatedDriver {
        executor_started: Notify::new(),
        executor_started_flag: std::sync::atomic::AtomicBool::new(false),
        allow_executor_finish: Notify::new(),
        reviewer_started: std::sync::atomic::AtomicBool::new(false),
    });
    let backend = Arc::new(StubBackend::default());
    let sink = Arc::new(sf_core::MemorySink::new());
    let runner = Arc::new(Runner::new(
        Arc::clone(&backend),
        Arc::clone(&driver),
        None,
        sf_storage::StateStore::new(&state_path),
        sf_core::FakeClock::new(),
        Arc::clone(&sink) as Arc<dyn sf_core::EventSink>,
        TranscriptHandle::disabled(),
        RunnerOptions {
            issue_resolve_timeout: std::time::Duration::ZERO,
            ..RunnerOptions::default()
        },
    ));

    let exec_task = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move { runner.handle_intent(&executor_intent("run-exec")).await })
    };
    // Wait until the executor holds the issue slot.
    while !driver.executor_started_flag.load(std::sync::atomic::Ordering::SeqCst) {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let review_task = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move { runner.handle_intent(&reviewer_intent("run-rev", 2)).await })
    };

    // The reviewer must wait until the executor releases the issue slot.
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    assert!(!driver.reviewer_started.load(std::sync::atomic::Ordering::SeqCst));

    driver.allow_executor_finish.notify_waiters();
    exec_task.await.unwrap().unwrap();
    review_task.await.unwrap().unwrap();
    assert!(driver.reviewer_started.load(std::sync::atomic::Ordering::SeqCst));
}

#[tokio::test]
async fn executor_failure_moves_in_progress_item_to_blocked() {
    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("state.json");
    write_state(
        &state_path,
        json!({
            "poll_count": 10,
            "items": {
                "PVTI_44": {
                    "last_seen_issue_number": 44,
                    "last_seen_status": "In Progress",
                    "last_dispatched_role": "EXECUTOR",
                    "last_run_id": "run-44",
                }
            },
        }),
    );
    let fx = fixture(&state_path, None, RunnerOptions::default());

    fx.runner
        .transition_executor_failure_to_blocked("run-44", "ITEM_STOP", "mcp call timed out")
        .await;

    let updates = fx.backend.update_calls();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["role"], "ORCHESTRATOR");
    assert_eq!(updates[0]["project_item_id"], "PVTI_44");
    assert_eq!(updates[0]["field"], "Status");
    assert_eq!(updates[0]["value"], "Blocked");
    assert_eq!(updates[0]["issue_number"], 44);
    assert_eq!(updates[0]["failure_classification"], "ITEM_STOP");
    assert_eq!(updates[0]["failure_message"], "mcp call timed out");
}

#[tokio::test]
async fn executor_fixup_failure_keeps_the_linked_pr_branch() {
    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("state.json");
    write_state(
        &state_path,
        json!({
            "poll_count": 11,
            "items": {
                "PVTI_55": {
                    "last_seen_issue_number": 55,
                    "last_seen_status": "In Review",
                    "last_dispatched_role": "EXECUTOR",
                    "last_run_id": "run-55",
                }
            },
        }),
    );
    let fx = fixture(&state_path, None, RunnerOptions::default());

    fx.runner
        .transition_executor_failure_to_blocked("run-55", "ITEM_STOP", "executor fixup failed")
        .await;

    let updates = fx.backend.update_calls();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["value"], "Blocked");
    assert_eq!(updates[0]["issue_number"], 55);
    let steps = updates[0]["suggested_next_steps"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    assert!(steps.contains("existing linked PR branch"));
}

#[tokio::test]
async fn unrecoverable_statuses_skip_the_blocked_transition() {
    for status in ["Backlog", "Ready", "Done", "Needs Human Approval"] {
        let dir = TempDir::new().unwrap();
        let state_path = dir.path().join("state.json");
        write_state(
            &state_path,
            json!({
                "poll_count": 1,
                "items": {
                    "PVTI_1": {
                        "last_seen_issue_number": 1,
                        "last_seen_status": status,
                        "last_run_id": "run-1",
                    }
                },
            }),
        );
        let fx = fixture(&state_path, None, RunnerOptions::default());

        fx.runner.transition_executor_failure_to_blocked("run-1", "ITEM_STOP", "boom").await;

        assert!(fx.backend.update_calls().is_empty(), "status {status}");
        assert_eq!(fx.sink.of_type("WORKER_RECOVERY_SKIPPED").len(), 1);
    }
}

#[tokio::test]
async fn unknown_run_id_skips_recovery() {
    let dir = TempDir::new().unwrap();
    let fx = fixture(&dir.path().join("state.json"), None, RunnerOptions::default());
    fx.runner.transition_executor_failure_to_blocked("ghost", "ITEM_STOP", "boom").await;
    assert!(fx.backend.update_calls().is_empty());
    assert_eq!(fx.sink.of_type("WORKER_RECOVERY_SKIPPED").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn long_runs_emit_heartbeats() {
    use async_trait::async_trait;
    use sf_adapters::{CodexWorkerError, TranscriptHandle, WorkerDriver};
    use sf_core::{RunIntent, WorkerResult};

    struct SlowDriver;

    #[async_trait]
    impl WorkerDriver for SlowDriver {
        async fn run_intent(
            &self,
            _bundle: &serde_json::Value,
            intent: &RunIntent,
            _backend_base_url: &str,
            _transcript: TranscriptHandle,
        ) -> Result<WorkerResult, CodexWorkerError> {
            tokio::time::sleep(std::time::Duration::from_secs(65)).await;
            Ok(worker_result(&intent.run_id, Role::Executor, RunStatus::Succeeded))
        }
    }

    let dir = TempDir::new().unwrap();
    let backend = Arc::new(StubBackend::default());
    let sink = Arc::new(sf_core::MemorySink::new());
    let runner = Runner::new(
        Arc::clone(&backend),
        Arc::new(SlowDriver),
        None,
        sf_storage::StateStore::new(dir.path().join("state.json")),
        sf_core::FakeClock::new(),
        Arc::clone(&sink) as Arc<dyn sf_core::EventSink>,
        TranscriptHandle::disabled(),
        RunnerOptions {
            issue_resolve_timeout: std::time::Duration::ZERO,
            ..RunnerOptions::default()
        },
    );

    runner.handle_intent(&executor_intent("run-slow")).await.unwrap();

    let beats = sink.of_type("WORKER_HEARTBEAT");
    assert!(beats.len() >= 2, "expected at least two heartbeats, got {}", beats.len());
    assert_eq!(beats[0]["run_id"], "run-slow");
}

#[test]
fn classification_matrix_is_deterministic() {
    use sf_adapters::{CodexWorkerError, HttpError};
    use sf_core::FailureClass;

    let intent_error = RunError::Intent(sf_core::parse_json_line("{bad").unwrap_err());
    assert_eq!(classify_failure(&intent_error), FailureClass::HardStop);

    let unreachable: RunError =
        HttpError::Unreachable { reason: "down".to_string() }.into();
    assert_eq!(classify_failure(&unreachable), FailureClass::Transient);
    assert_eq!(run_error_code(&unreachable), "backend_unreachable");

    let conflict: RunError = HttpError::Status { status: 409, payload: json!({}) }.into();
    assert_eq!(classify_failure(&conflict), FailureClass::ItemStop);

    let bad_gateway: RunError = HttpError::Status { status: 502, payload: json!({}) }.into();
    assert_eq!(classify_failure(&bad_gateway), FailureClass::Transient);

    let forbidden: RunError = HttpError::Status { status: 403, payload: json!({}) }.into();
    assert_eq!(classify_failure(&forbidden), FailureClass::HardStop);

    let invalid_payload: RunError =
        HttpError::InvalidPayload { status: 200, payload: json!([]) }.into();
    assert_eq!(classify_failure(&invalid_payload), FailureClass::HardStop);

    let timeout: RunError = CodexWorkerError::McpTimeout { method: "tools/call" }.into();
    assert_eq!(classify_failure(&timeout), FailureClass::ItemStop);
    assert_eq!(run_error_code(&timeout), "mcp_timeout");

    let mismatch: RunError = CodexWorkerError::McpProtocolMismatch {
        expected: sf_adapters::MCP_PROTOCOL_VERSION,
        actual: None,
    }
    .into();
    assert_eq!(classify_failure(&mismatch), FailureClass::HardStop);

    // Classification is pure: asking twice answers the same.
    assert_eq!(classify_failure(&timeout), classify_failure(&timeout));
}
