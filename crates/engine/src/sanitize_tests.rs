// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tests for the dependency sanitizer

use super::*;
use crate::plan::{IsolationMode, ScopeEntry};
use serde_json::json;
use sf_core::MemorySink;
use std::collections::BTreeMap;
use tempfile::TempDir;

fn entry(owns: &[&str], touches: &[&str], deps: &[i64]) -> ScopeEntry {
    ScopeEntry {
        touch_paths: touches.iter().map(|s| s.to_string()).collect(),
        owns_paths: owns.iter().map(|s| s.to_string()).collect(),
        conflicts_with: vec![],
        depends_on: deps.to_vec(),
        group_id: String::new(),
        isolation_mode: IsolationMode::Chained,
    }
}

#[yare::parameterized(
    backslashes = { "apps\\api\\src", "apps/api/src" },
    leading_dot_slash = { "./apps/api", "apps/api" },
    leading_slash = { "/apps/api", "apps/api" },
    trailing_slash = { "apps/api/", "apps/api" },
    stacked_prefixes = { "././apps/api/", "apps/api" },
    plain = { "apps/api", "apps/api" },
)]
fn path_normalization(input: &str, expected: &str) {
    assert_eq!(normalize_path(input), expected);
}

#[yare::parameterized(
    equal = { "apps/api", "apps/api", true },
    parent_child = { "apps/api", "apps/api/src", true },
    child_parent = { "apps/api/src", "apps/api", true },
    siblings = { "apps/api", "apps/web", false },
    shared_prefix_not_dir = { "apps/api", "apps/api2", false },
    normalized_forms = { "./apps/api/", "apps\\api\\src", true },
    empty = { "", "apps/api", false },
)]
fn overlap_is_prefix_based(a: &str, b: &str, expected: bool) {
    assert_eq!(paths_overlap(a, b), expected);
}

#[test]
fn dead_ref_edges_are_pruned() {
    let mut plan = BTreeMap::new();
    plan.insert(2, entry(&["apps/api"], &["apps/api/a.ts"], &[99]));
    let report = sanitize_scope_plan(&plan).unwrap();
    assert!(report.plan[&2].depends_on.is_empty());
    assert_eq!(
        report.removed_edges,
        vec![RemovedEdge { from: 2, to: 99, reason: PruneReason::DeadRef }]
    );
}

#[test]
fn doc_blocker_edges_are_pruned() {
    let mut plan = BTreeMap::new();
    plan.insert(2, entry(&["apps/api"], &["apps/api/a.ts"], &[3]));
    plan.insert(3, entry(&["apps/api"], &["docs/guide.md", "README.txt"], &[]));
    let report = sanitize_scope_plan(&plan).unwrap();
    assert_eq!(report.removed_edges[0].reason, PruneReason::DocBlocker);
    assert!(report.plan[&2].depends_on.is_empty());
}

#[test]
fn doc_only_source_keeps_doc_dependency() {
    let mut plan = BTreeMap::new();
    plan.insert(2, entry(&["docs"], &["docs/a.md"], &[3]));
    plan.insert(3, entry(&["docs"], &["docs/b.md"], &[]));
    let report = sanitize_scope_plan(&plan).unwrap();
    assert_eq!(report.plan[&2].depends_on, vec![3]);
    assert!(report.removed_edges.is_empty());
}

#[test]
fn no_overlap_edges_are_pruned() {
    let mut plan = BTreeMap::new();
    plan.insert(2, entry(&["apps/api"], &["apps/api/a.ts"], &[3]));
    plan.insert(3, entry(&["apps/web"], &["apps/web/b.ts"], &[]));
    let report = sanitize_scope_plan(&plan).unwrap();
    assert_eq!(report.removed_edges[0].reason, PruneReason::NoOverlap);
    assert!(report.plan[&2].depends_on.is_empty());
}

#[test]
fn items_without_touch_paths_are_not_doc_only() {
    let mut plan = BTreeMap::new();
    plan.insert(2, entry(&["apps/api"], &["apps/api/a.ts"], &[3]));
    plan.insert(3, entry(&["apps/api"], &[], &[]));
    let report = sanitize_scope_plan(&plan).unwrap();
    assert!(report.removed_edges.is_empty());
    assert_eq!(report.plan[&2].depends_on, vec![3]);
}

#[test]
fn clean_graph_passes_through() {
    let mut plan = BTreeMap::new();
    plan.insert(2, entry(&["apps/api"], &["apps/api/a.ts"], &[]));
    plan.insert(3, entry(&["apps/api/src"], &["apps/api/src/b.ts"], &[2]));
    let report = sanitize_scope_plan(&plan).unwrap();
    assert!(report.removed_edges.is_empty());
    assert_eq!(report.plan[&3].depends_on, vec![2]);
}

#[test]
fn two_node_cycle_is_detected_in_order() {
    let mut plan = BTreeMap::new();
    plan.insert(2, entry(&["apps/api"], &["apps/api/a.ts"], &[3]));
    plan.insert(3, entry(&["apps/api/src"], &["apps/api/src/b.ts"], &[2]));
    let found = sanitize_scope_plan(&plan).unwrap_err();
    assert_eq!(found.cycles, vec![vec![2, 3]]);
}

#[test]
fn self_loop_is_a_cycle() {
    let mut plan = BTreeMap::new();
    plan.insert(4, entry(&["apps/api"], &["apps/api/a.ts"], &[4]));
    let found = sanitize_scope_plan(&plan).unwrap_err();
    assert_eq!(found.cycles, vec![vec![4]]);
}

#[test]
fn pruning_can_break_an_apparent_cycle() {
    // 2 -> 3 has no ownership overlap and is pruned; what remains is acyclic.
    let mut plan = BTreeMap::new();
    plan.insert(2, entry(&["apps/api"], &["apps/api/a.ts"], &[3]));
    plan.insert(3, entry(&["apps/web"], &["apps/web/b.ts"], &[2]));
    let report = sanitize_scope_plan(&plan).unwrap();
    assert_eq!(report.removed_edges.len(), 2);
    assert!(report.plan.values().all(|e| e.depends_on.is_empty()));
}

#[test]
fn regen_disabled_returns_cycle_error_without_events() {
    let dir = TempDir::new().unwrap();
    let sink = MemorySink::new();
    let mut plan = BTreeMap::new();
    plan.insert(2, entry(&["apps/api"], &["apps/api/a.ts"], &[3]));
    plan.insert(3, entry(&["apps/api/src"], &["apps/api/src/b.ts"], &[2]));

    let err = sanitize_with_regen(&plan, None, 0, &dir.path().join("state.json"), &sink)
        .unwrap_err();
    assert!(matches!(err, SanitizeError::CycleDetected { .. }));
    assert_eq!(err.exit_code(), 3);
    assert!(sink.snapshot().is_empty());
}

#[test]
fn deterministic_patch_resolves_two_node_cycle() {
    let dir = TempDir::new().unwrap();
    let sink = MemorySink::new();
    let mut plan = BTreeMap::new();
    plan.insert(2, entry(&["apps/api"], &["apps/api/a.ts"], &[3]));
    plan.insert(3, entry(&["apps/api/src"], &["apps/api/src/b.ts"], &[2]));

    let report =
        sanitize_with_regen(&plan, None, 2, &dir.path().join("state.json"), &sink).unwrap();
    assert_eq!(report.plan[&2].depends_on, vec![3]);
    assert!(report.plan[&3].depends_on.is_empty());

    let success = sink.of_type("sanitization_regen_succeeded");
    assert_eq!(success.len(), 1);
    assert_eq!(success[0]["attempts"], 1);
    let history = success[0]["history"].as_array().unwrap();
    assert_eq!(history[0]["tier"], "DETERMINISTIC_PATCH");
    assert_eq!(history[0]["edges_removed"], json!([{"from": 3, "to": 2}]));
}

#[test]
fn patch_removes_last_to_first_edge_only() {
    let dir = TempDir::new().unwrap();
    let sink = MemorySink::new();
    let mut plan = BTreeMap::new();
    plan.insert(2, entry(&["apps/api"], &["apps/api/a.ts"], &[3]));
    plan.insert(3, entry(&["apps/api/src"], &["apps/api/src/b.ts"], &[4]));
    plan.insert(4, entry(&["apps/api/src/internal"], &["apps/api/src/c.ts"], &[2]));
    plan.insert(5, entry(&["apps/api/src/other"], &["apps/api/src/d.ts"], &[2]));

    sanitize_with_regen(&plan, None, 2, &dir.path().join("state.json"), &sink).unwrap();

    let success = sink.of_type("sanitization_regen_succeeded");
    let patch = &success[0]["history"][0];
    assert_eq!(patch["edges_removed"], json!([{"from": 4, "to": 2}]));
    let patched = patch["patched_items"].as_array().unwrap();
    let item4 = patched.iter().find(|i| i["number"] == 4).unwrap();
    let item5 = patched.iter().find(|i| i["number"] == 5).unwrap();
    assert_eq!(item4["depends_on"], json!([]));
    assert_eq!(item5["depends_on"], json!([2]));
}

fn tangled_plan() -> BTreeMap<i64, ScopeEntry> {
    // The deterministic patch breaks one cycle but another survives.
    let mut plan = BTreeMap::new();
    plan.insert(2, entry(&["apps/api"], &["apps/api/a.ts"], &[3]));
    plan.insert(3, entry(&["apps/api/src"], &["apps/api/src/b.ts"], &[2, 4]));
    plan.insert(4, entry(&["apps/api/src/internal"], &["apps/api/src/c.ts"], &[2]));
    plan
}

#[test]
fn handoff_is_requested_when_patch_is_not_enough() {
    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("orchestrator-state.json");
    let sink = MemorySink::new();
    let previous = json!({"sprint_plan": {"2": {"depends_on": [3]}}});

    let err = sanitize_with_regen(&tangled_plan(), Some(&previous), 2, &state_path, &sink)
        .unwrap_err();
    assert_eq!(err.exit_code(), 6);
    match &err {
        SanitizeError::RegenHandoffRequested { attempt, history } => {
            assert_eq!(*attempt, 1);
            assert_eq!(history[0]["tier"], "DETERMINISTIC_PATCH");
            assert_eq!(history[1]["tier"], "PLANNER_REGEN");
            assert_eq!(history[1]["attempt"], 1);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let sidecar = dir.path().join("orchestrator-state.json.regen-request.json");
    assert!(sidecar.exists());
    let request: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&sidecar).unwrap()).unwrap();
    assert_eq!(request["previous_plan"], previous);
    assert!(request["cycle_error"]["cycles"].is_array());
    assert!(request["history"].is_array());

    assert_eq!(sink.of_type("sanitization_regen_handoff_requested").len(), 1);
}

#[test]
fn exhausted_budget_reports_history_and_exit_five() {
    let dir = TempDir::new().unwrap();
    let sink = MemorySink::new();

    let err = sanitize_with_regen(
        &tangled_plan(),
        None,
        1,
        &dir.path().join("orchestrator-state.json"),
        &sink,
    )
    .unwrap_err();
    assert_eq!(err.exit_code(), 5);

    let exhausted = sink.of_type("sanitization_regen_exhausted");
    assert_eq!(exhausted.len(), 1);
    let history = exhausted[0]["history"].as_array().unwrap();
    assert_eq!(history[0]["tier"], "DETERMINISTIC_PATCH");
    assert_eq!(history[history.len() - 1]["tier"], "FINAL_SANITIZATION_FAILED");
}
