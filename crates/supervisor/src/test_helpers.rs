// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared stubs for supervisor tests.

use crate::runner::{Runner, RunnerOptions};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use sf_adapters::{BackendApi, CodexWorkerError, HttpError, TranscriptHandle, WorkerDriver};
use sf_core::{EventSink, FakeClock, MemorySink, RunIntent, WorkerResult};
use sf_storage::{RunLedger, StateStore};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Backend stub: records every POST, answers resolve-linked-pr with a fixed
/// project item id, and hands out empty agent bundles.
pub(crate) struct StubBackend {
    pub(crate) calls: Mutex<Vec<(String, Value)>>,
    pub(crate) resolve_project_item_id: String,
    /// Paths that answer with HTTP 500 instead of success.
    pub(crate) failing_paths: Vec<String>,
}

impl Default for StubBackend {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            resolve_project_item_id: "PVTI_2".to_string(),
            failing_paths: Vec::new(),
        }
    }
}

impl StubBackend {
    pub(crate) fn update_calls(&self) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter(|(path, _)| path == "/internal/project-item/update-field")
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub(crate) fn calls_to(&self, path: &str) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl BackendApi for StubBackend {
    fn base_url(&self) -> &str {
        "http://localhost:4000"
    }

    async fn get_json(&self, path: &str, params: &[(&str, &str)]) -> Result<Value, HttpError> {
        if path == "/internal/agent-context" {
            let role = params
                .iter()
                .find(|(k, _)| *k == "role")
                .map(|(_, v)| *v)
                .unwrap_or_default();
            return Ok(json!({"role": role, "files": []}));
        }
        Ok(json!({"ok": true}))
    }

    async fn post_json(&self, path: &str, body: Value) -> Result<Value, HttpError> {
        self.calls.lock().push((path.to_string(), body.clone()));
        if self.failing_paths.iter().any(|p| p == path) {
            return Err(HttpError::Status { status: 500, payload: json!({"error": "boom"}) });
        }
        if path == "/internal/reviewer/resolve-linked-pr" {
            let issue_number = body.get("issue_number").cloned().unwrap_or(Value::Null);
            return Ok(json!({
                "pr_number": 55,
                "pr_url": format!(
                    "https://github.com/example/repo/pull/{}",
                    issue_number.as_i64().unwrap_or(0)
                ),
                "issue_number": issue_number,
                "project_item_id": self.resolve_project_item_id,
                "run_id": "linked-run",
            }));
        }
        if path == "/internal/project-item/update-field" {
            return Ok(json!({"updated": {"Status": body.get("value")}}));
        }
        Ok(json!({"ok": true}))
    }
}

/// Driver stub answering by run id.
#[derive(Default)]
pub(crate) struct MapDriver {
    pub(crate) results: Mutex<HashMap<String, WorkerResult>>,
}

impl MapDriver {
    pub(crate) fn with_result(result: WorkerResult) -> Self {
        let driver = Self::default();
        driver.results.lock().insert(result.run_id.clone(), result);
        driver
    }
}

#[async_trait]
impl WorkerDriver for MapDriver {
    async fn run_intent(
        &self,
        _bundle: &Value,
        intent: &RunIntent,
        _backend_base_url: &str,
        _transcript: TranscriptHandle,
    ) -> Result<WorkerResult, CodexWorkerError> {
        self.results
            .lock()
            .get(&intent.run_id)
            .cloned()
            .ok_or_else(|| CodexWorkerError::InvalidOutput("no scripted result".to_string()))
    }
}

pub(crate) type TestRunner = Runner<StubBackend, MapDriver, FakeClock>;

pub(crate) struct Fixture {
    pub(crate) backend: Arc<StubBackend>,
    pub(crate) sink: Arc<MemorySink>,
    pub(crate) runner: TestRunner,
}

pub(crate) fn fixture(
    state_path: &Path,
    ledger: Option<Arc<RunLedger>>,
    options: RunnerOptions,
) -> Fixture {
    fixture_with(StubBackend::default(), MapDriver::default(), state_path, ledger, options)
}

pub(crate) fn fixture_with(
    backend: StubBackend,
    driver: MapDriver,
    state_path: &Path,
    ledger: Option<Arc<RunLedger>>,
    options: RunnerOptions,
) -> Fixture {
    let backend = Arc::new(backend);
    let sink = Arc::new(MemorySink::new());
    let clock = FakeClock::at("2026-02-27T01:00:00.000Z");
    let mut options = options;
    options.issue_resolve_timeout = Duration::ZERO;
    options.issue_resolve_poll = Duration::from_millis(1);
    let runner = Runner::new(
        Arc::clone(&backend),
        Arc::new(driver),
        ledger,
        StateStore::new(state_path),
        clock,
        Arc::clone(&sink) as Arc<dyn EventSink>,
        TranscriptHandle::disabled(),
        options,
    );
    Fixture { backend, sink, runner }
}

pub(crate) fn executor_intent(run_id: &str) -> RunIntent {
    sf_core::parse_intent(json!({
        "type": "RUN_INTENT",
        "role": "EXECUTOR",
        "run_id": run_id,
        "endpoint": "/internal/executor/claim-ready-item",
        "body": {"role": "EXECUTOR", "run_id": run_id, "sprint": "M1"},
    }))
    .unwrap()
}

pub(crate) fn reviewer_intent(run_id: &str, issue_number: i64) -> RunIntent {
    sf_core::parse_intent(json!({
        "type": "RUN_INTENT",
        "role": "REVIEWER",
        "run_id": run_id,
        "endpoint": "/internal/reviewer/resolve-linked-pr",
        "body": {"role": "REVIEWER", "run_id": run_id, "issue_number": issue_number},
    }))
    .unwrap()
}

pub(crate) fn worker_result(
    run_id: &str,
    role: sf_core::Role,
    status: sf_core::RunStatus,
) -> WorkerResult {
    WorkerResult {
        run_id: run_id.to_string(),
        role,
        status,
        outcome: None,
        summary: "done".to_string(),
        urls: Default::default(),
        errors: vec![],
        marker_verified: None,
    }
}
