// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tests for sprint-plan parsing

use super::*;
use serde_json::json;

#[test]
fn parses_tasks_and_scope() {
    let raw = json!({
        "sprint": "M1",
        "tasks": [
            {
                "title": "[TASK] API",
                "issue_number": 2,
                "project_item_id": "PVTI_2",
                "priority": "P0",
                "depends_on_titles": [],
            },
        ],
        "sprint_plan": {
            "2": {
                "touch_paths": ["apps/api/src/a.ts"],
                "owns_paths": ["apps/api"],
                "conflicts_with": [3],
                "depends_on": [3],
                "group_id": "component:apps/api",
                "isolation_mode": "CHAINED",
            },
        },
    });

    let plan = parse_sprint_plan(&raw).unwrap();
    assert_eq!(plan.sprint, "M1");
    assert_eq!(plan.tasks.len(), 1);
    assert_eq!(plan.tasks[0].issue_number, 2);
    assert_eq!(plan.tasks[0].priority, "P0");

    let entry = &plan.scope[&2];
    assert_eq!(entry.owns_paths, vec!["apps/api"]);
    assert_eq!(entry.depends_on, vec![3]);
    assert_eq!(entry.isolation_mode, IsolationMode::Chained);
}

#[test]
fn missing_sections_default_to_empty() {
    let plan = parse_sprint_plan(&json!({})).unwrap();
    assert!(plan.sprint.is_empty());
    assert!(plan.tasks.is_empty());
    assert!(plan.scope.is_empty());
}

#[test]
fn unknown_isolation_mode_defaults_to_isolated() {
    let raw = json!({
        "sprint_plan": {"7": {"isolation_mode": "SOMETHING_NEW"}},
    });
    let plan = parse_sprint_plan(&raw).unwrap();
    assert_eq!(plan.scope[&7].isolation_mode, IsolationMode::Isolated);
}

#[test]
fn non_numeric_scope_key_is_malformed() {
    let raw = json!({"sprint_plan": {"not-a-number": {}}});
    let err = parse_sprint_plan(&raw).unwrap_err();
    assert!(matches!(err, SanitizeError::MalformedSprintData(_)));
    assert_eq!(err.exit_code(), 3);
}

#[test]
fn non_object_scope_entry_is_malformed() {
    let raw = json!({"sprint_plan": {"2": "not an object"}});
    assert!(matches!(
        parse_sprint_plan(&raw).unwrap_err(),
        SanitizeError::MalformedSprintData(_)
    ));
}

#[test]
fn non_object_plan_is_malformed() {
    assert!(matches!(
        parse_sprint_plan(&json!([])).unwrap_err(),
        SanitizeError::MalformedSprintData(_)
    ));
}
