// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process wiring: preflight, capability checks, worker pool spawn, the
//! planner child, and the stdout/stderr multiplexer.
//!
//! The planner's stdout is the intent stream (schema errors are fatal); its
//! stderr is forwarded verbatim for operators and mined for supervisory
//! events, DISPATCH_SUMMARY being the reconciliation trigger.

use crate::config::SupervisorConfig;
use crate::runner::{Runner, RunnerOptions};
use serde_json::{json, Value};
use sf_adapters::codex::assert_codex_github_mcp_available;
use sf_adapters::{
    BackendApi, BackendClient, CodexConfig, CodexDriver, HttpError, TranscriptHandle,
    TranscriptSink,
};
use sf_core::{
    exit_code_for, parse_intent, parse_json_line, EventSink, FailureClass, Role, StderrSink,
    SystemClock,
};
use sf_engine::{autopromote_ready, parse_sprint_plan, PromoteError, PromoteOptions};
use sf_storage::{RunLedger, RunState, StateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

type ProdRunner = Runner<BackendClient, CodexDriver, SystemClock>;

/// Run the supervisor to completion; returns the process exit code.
pub async fn run_supervisor(config: SupervisorConfig) -> i32 {
    let events: Arc<dyn EventSink> = Arc::new(StderrSink);

    let backend = match BackendClient::new(
        config.backend_base_url.clone(),
        Duration::from_secs(config.backend_timeout_s),
    ) {
        Ok(backend) => Arc::new(backend),
        Err(error) => {
            events.emit(json!({"type": "CONFIG_ERROR", "error": error.to_string()}));
            return 2;
        }
    };

    // Preflight gate: the backend must positively allow an orchestrator run.
    match backend.preflight_orchestrator().await {
        Ok(preflight) => {
            if preflight.get("status").and_then(Value::as_str) != Some("PASS") {
                events.emit(json!({
                    "type": "HARD_STOP",
                    "reason": "preflight_fail",
                    "payload": preflight,
                }));
                return 2;
            }
        }
        Err(error) => {
            let classification = classify_http(&error);
            events.emit(json!({
                "type": classification.as_str(),
                "reason": "backend_preflight_failed",
                "error": error.to_string(),
                "code": error.code(),
                "status_code": error.status_code(),
            }));
            return exit_code_for(classification);
        }
    }

    if !config.dry_run {
        if let Err(error) = assert_codex_github_mcp_available(&config.codex_bin).await {
            events.emit(json!({
                "type": "HARD_STOP",
                "reason": "codex_mcp_missing",
                "code": error.code(),
                "error": error.to_string(),
            }));
            return 2;
        }
    }

    let ledger =
        if config.dry_run { None } else { Some(Arc::new(RunLedger::new(&config.ledger_path))) };
    if let Some(ledger) = &ledger {
        if let Err(error) = ledger.load() {
            events.emit(json!({"type": "HARD_STOP", "reason": "ledger_unreadable", "error": error.to_string()}));
            return 2;
        }
    }

    let transcript_sink = if config.dry_run {
        None
    } else {
        Some(TranscriptSink::start(backend.clone() as Arc<dyn BackendApi>))
    };
    let transcript =
        transcript_sink.as_ref().map(TranscriptSink::handle).unwrap_or_else(TranscriptHandle::disabled);

    let driver = Arc::new(CodexDriver::new(CodexConfig {
        codex_bin: config.codex_bin.clone(),
        mcp_args: config.codex_mcp_args.clone(),
        tools_call_timeout: Duration::from_secs(config.tools_call_timeout_s),
        reply_timeout: Duration::from_secs(config.reply_timeout_s),
    }));

    let runner: Arc<ProdRunner> = Arc::new(Runner::new(
        backend.clone(),
        driver,
        ledger,
        StateStore::new(&config.state_path),
        SystemClock,
        Arc::clone(&events),
        transcript,
        RunnerOptions {
            dry_run: config.dry_run,
            review_stall_polls: config.review_stall_polls,
            blocked_retry_minutes: config.blocked_retry_minutes,
            watchdog_timeout_s: config.watchdog_timeout_s,
            ..RunnerOptions::default()
        },
    ));

    let startup = runner.reconcile_startup_state(&config.sprint).await;
    events.emit(json!({"type": "STARTUP_RECONCILIATION", "result": startup}));

    let mut workers = Vec::new();
    for _ in 0..config.max_executors {
        let runner = Arc::clone(&runner);
        workers.push(tokio::spawn(async move { runner.run_worker_loop(Role::Executor).await }));
    }
    for _ in 0..config.max_reviewers {
        let runner = Arc::clone(&runner);
        workers.push(tokio::spawn(async move { runner.run_worker_loop(Role::Reviewer).await }));
    }

    let planner_cmd = planner_command(&config);
    let mut child = match spawn_planner(&config, &planner_cmd) {
        Ok(child) => child,
        Err(error) => {
            events.emit(json!({"type": "HARD_STOP", "reason": "planner_spawn_failed", "error": error}));
            runner.hard_stop("planner spawn failed");
            return 2;
        }
    };

    events.emit(json!({
        "type": "RUNNER_STARTED",
        "dry_run": config.dry_run,
        "orchestrator_cmd": planner_cmd,
    }));

    // The stderr leg runs on its own task: raw lines are forwarded verbatim
    // for operators, JSON lines are mined for supervisory events.
    let (summary_tx, mut summary_rx) = mpsc::unbounded_channel::<Value>();
    let stderr_task = child.stderr.take().map(|stderr| {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                eprintln!("{trimmed}");
                let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
                    continue;
                };
                let kind =
                    value.get("type").and_then(Value::as_str).unwrap_or_default().to_string();
                match kind.as_str() {
                    "DISPATCH_SUMMARY" => {
                        let _ = summary_tx.send(value);
                    }
                    "END_OF_SPRINT_SUMMARY" => {
                        tracing::info!("planner reported end of sprint");
                    }
                    "ORCHESTRATOR_CYCLE_TRANSIENT_ERROR" => {
                        tracing::warn!(payload = %value, "planner cycle hit a transient error");
                    }
                    "ORCHESTRATOR_STATE_RESET_INVALID_JSON" => {
                        tracing::warn!(payload = %value, "planner reset invalid state file");
                    }
                    _ => {}
                }
            }
        })
    });

    let mut stdout_lines = child.stdout.take().map(|stdout| BufReader::new(stdout).lines());
    let mut exit_override: Option<i32> = None;

    loop {
        let Some(lines) = stdout_lines.as_mut() else {
            break;
        };
        let stop_token = runner.stop_token();
        tokio::select! {
            _ = stop_token.cancelled() => break,
            summary = summary_rx.recv() => {
                if let Some(summary) = summary {
                    runner.handle_dispatch_summary(&summary).await;
                    if let Some(code) = autopromote(&runner, backend.as_ref(), &summary, &config, &*events).await {
                        exit_override = Some(code);
                        runner.hard_stop("sanitization stopped promotion");
                        break;
                    }
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        if let Err(reason) = ingest_intent_line(&runner, trimmed, &*events) {
                            runner.hard_stop(reason);
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        tracing::warn!(error = %error, "planner stdout read failed");
                        break;
                    }
                }
            }
        }
    }

    // Graceful teardown: ask nicely, then force.
    let hard_stopped = runner.should_stop();
    if hard_stopped {
        let _ = child.start_kill();
    }
    let planner_status = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
    let planner_code = match planner_status {
        Ok(Ok(status)) => status.code(),
        _ => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            None
        }
    };

    runner.stop_token().cancel();
    for worker in workers {
        let _ = tokio::time::timeout(Duration::from_secs(5), worker).await;
    }
    if let Some(task) = stderr_task {
        let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    }
    if let Some(sink) = transcript_sink {
        sink.close().await;
    }

    if let Some(code) = exit_override {
        events.emit(json!({"type": "HARD_STOP", "reason": runner.stop_reason(), "exit_code": code}));
        return code;
    }
    if hard_stopped {
        events.emit(json!({"type": "HARD_STOP", "reason": runner.stop_reason()}));
        return 2;
    }

    match planner_code {
        Some(0) => 0,
        Some(code @ (2 | 3 | 4)) => {
            events.emit(json!({
                "type": "HARD_STOP",
                "reason": "orchestrator_nonzero_exit",
                "exit_code": code,
            }));
            code
        }
        other => {
            events.emit(json!({
                "type": "HARD_STOP",
                "reason": "orchestrator_nonzero_exit",
                "exit_code": other,
            }));
            2
        }
    }
}

/// Parse, record, ledger-gate, and enqueue one intent line. An invalid line
/// is a hard stop with the intent error code as the reason.
fn ingest_intent_line<B, W, C>(
    runner: &Runner<B, W, C>,
    line: &str,
    events: &dyn EventSink,
) -> Result<(), String>
where
    B: BackendApi + 'static,
    W: sf_adapters::WorkerDriver + 'static,
    C: sf_core::Clock + 'static,
{
    let intent = parse_json_line(line)
        .and_then(parse_intent)
        .map_err(|e| format!("intent_error: {}: {}", e.code(), e))?;

    events.emit(json!({
        "type": "INTENT_RECEIVED",
        "role": intent.role.as_str(),
        "run_id": intent.run_id,
        "endpoint": intent.endpoint,
        "intent_hash": intent.intent_hash(),
    }));

    if let Some(ledger) = &runner.ledger {
        if let Ok(Some(row)) = ledger.get(&intent.run_id) {
            if row.status == RunState::Succeeded {
                events.emit(json!({
                    "type": "LEDGER_SKIP",
                    "run_id": intent.run_id,
                    "reason": "already_succeeded",
                }));
                return Ok(());
            }
        }
    }

    runner.enqueue(intent);
    Ok(())
}

/// Ready-buffer autopromotion after reconciliation. Sanitizer verdicts map
/// to dedicated exit codes; backend failures follow the usual taxonomy.
async fn autopromote(
    runner: &Arc<ProdRunner>,
    backend: &BackendClient,
    summary: &Value,
    config: &SupervisorConfig,
    events: &dyn EventSink,
) -> Option<i32> {
    let state = runner.state.load();
    let plan_raw = state.sprint_plan.clone();
    let plan = match &plan_raw {
        Some(raw) if !raw.is_null() => match parse_sprint_plan(raw) {
            Ok(plan) => Some(plan),
            Err(error) => {
                events.emit(json!({
                    "type": "HARD_STOP",
                    "reason": "sprint_plan_malformed",
                    "error": error.to_string(),
                }));
                return Some(error.exit_code());
            }
        },
        _ => None,
    };

    let options = PromoteOptions {
        dry_run: config.dry_run,
        ready_target: config.ready_target,
        sanitization_regen_attempts: config.sanitization_regen_attempts,
        state_path: config.state_path.clone().into(),
    };
    match autopromote_ready(backend, summary, plan.as_ref(), plan_raw.as_ref(), &options, events)
        .await
    {
        Ok(()) => None,
        Err(PromoteError::Sanitize(error)) => {
            events.emit(json!({
                "type": "HARD_STOP",
                "reason": "sanitization_failed",
                "error": error.to_string(),
            }));
            Some(error.exit_code())
        }
        Err(PromoteError::Http(error)) => {
            let classification = classify_http(&error);
            if classification == FailureClass::HardStop {
                events.emit(json!({
                    "type": "HARD_STOP",
                    "reason": "promotion_backend_error",
                    "error": error.to_string(),
                }));
                Some(2)
            } else {
                // Transient promotion failures retry on the next poll.
                tracing::warn!(error = %error, "promotion attempt failed; will retry next poll");
                None
            }
        }
    }
}

fn classify_http(error: &HttpError) -> FailureClass {
    match error {
        HttpError::Unreachable { .. } => FailureClass::Transient,
        HttpError::Status { status, .. } if *status == 409 => FailureClass::ItemStop,
        HttpError::Status { status, .. } if *status >= 500 => FailureClass::Transient,
        HttpError::Status { .. } | HttpError::InvalidPayload { .. } => FailureClass::HardStop,
    }
}

/// `--once` rewrites a looping planner command into a single cycle.
fn planner_command(config: &SupervisorConfig) -> String {
    if !config.once {
        return config.planner_cmd.clone();
    }
    if config.planner_cmd.contains("--loop") {
        config.planner_cmd.replace("--loop", "--once")
    } else if config.planner_cmd.contains("--once") {
        config.planner_cmd.clone()
    } else {
        format!("{} --once", config.planner_cmd)
    }
}

/// Spawn the planner through the shell with the documented environment.
fn spawn_planner(config: &SupervisorConfig, cmd: &str) -> Result<Child, String> {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(cmd)
        .env("ORCHESTRATOR_SPRINT", &config.sprint)
        .env("ORCHESTRATOR_BACKEND_BASE_URL", &config.backend_base_url)
        .env("ORCHESTRATOR_STATE_PATH", &config.state_path)
        .env("ORCHESTRATOR_EXECUTOR_CAP", config.max_executors.to_string())
        .env("ORCHESTRATOR_REVIEWER_CAP", config.max_reviewers.to_string())
        .env("ORCHESTRATOR_REVIEWER_DISPATCH_CAP", config.reviewer_dispatch_cap.to_string())
        .env("ORCHESTRATOR_REVIEWER_RETRY_POLLS", config.reviewer_retry_polls.to_string())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    command.spawn().map_err(|e| e.to_string())
}

#[cfg(test)]
#[path = "wiring_tests.rs"]
mod tests;
