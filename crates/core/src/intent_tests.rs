// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tests for planner intent parsing

use super::*;
use serde_json::json;

fn valid_envelope() -> serde_json::Value {
    json!({
        "type": "RUN_INTENT",
        "role": "EXECUTOR",
        "run_id": "run-1",
        "endpoint": "/internal/executor/claim-ready-item",
        "body": {"role": "EXECUTOR", "run_id": "run-1", "sprint": "M1"},
    })
}

#[test]
fn parses_valid_executor_intent() {
    let intent = parse_intent(valid_envelope()).unwrap();
    assert_eq!(intent.role, Role::Executor);
    assert_eq!(intent.run_id, "run-1");
    assert_eq!(intent.endpoint, "/internal/executor/claim-ready-item");
    assert_eq!(intent.body.get("sprint").and_then(serde_json::Value::as_str), Some("M1"));
}

#[test]
fn normalizes_role_case_and_whitespace() {
    let mut envelope = valid_envelope();
    envelope["role"] = json!("  executor ");
    let intent = parse_intent(envelope).unwrap();
    assert_eq!(intent.role, Role::Executor);
}

#[test]
fn rejects_unknown_fields_sorted() {
    let mut envelope = valid_envelope();
    envelope["zzz"] = json!(1);
    envelope["aaa"] = json!(2);
    let err = parse_intent(envelope).unwrap_err();
    assert_eq!(err.code(), "intent_unknown_fields");
    match err {
        IntentError::UnknownFields(fields) => assert_eq!(fields, vec!["aaa", "zzz"]),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[yare::parameterized(
    wrong_type = { json!({"type": "OTHER", "role": "EXECUTOR", "run_id": "r", "endpoint": "/internal/executor/claim-ready-item", "body": {"role": "EXECUTOR", "run_id": "r"}}), "intent_type_mismatch" },
    bad_role = { json!({"type": "RUN_INTENT", "role": "PLANNER", "run_id": "r", "endpoint": "/internal/executor/claim-ready-item", "body": {"role": "PLANNER", "run_id": "r"}}), "intent_invalid_role" },
    empty_run_id = { json!({"type": "RUN_INTENT", "role": "EXECUTOR", "run_id": "  ", "endpoint": "/internal/executor/claim-ready-item", "body": {"role": "EXECUTOR", "run_id": "  "}}), "intent_missing_run_id" },
    external_endpoint = { json!({"type": "RUN_INTENT", "role": "EXECUTOR", "run_id": "r", "endpoint": "/public/anything", "body": {"role": "EXECUTOR", "run_id": "r"}}), "intent_invalid_endpoint" },
    body_not_object = { json!({"type": "RUN_INTENT", "role": "EXECUTOR", "run_id": "r", "endpoint": "/internal/executor/claim-ready-item", "body": "x"}), "intent_invalid_body" },
    body_role_mismatch = { json!({"type": "RUN_INTENT", "role": "EXECUTOR", "run_id": "r", "endpoint": "/internal/executor/claim-ready-item", "body": {"role": "REVIEWER", "run_id": "r"}}), "intent_role_mismatch" },
    body_run_id_mismatch = { json!({"type": "RUN_INTENT", "role": "EXECUTOR", "run_id": "r", "endpoint": "/internal/executor/claim-ready-item", "body": {"role": "EXECUTOR", "run_id": "other"}}), "intent_run_id_mismatch" },
)]
fn rejects_invalid_envelopes(envelope: serde_json::Value, expected_code: &str) {
    let err = parse_intent(envelope).unwrap_err();
    assert_eq!(err.code(), expected_code);
}

#[test]
fn reviewer_may_not_claim_ready_items() {
    let envelope = json!({
        "type": "RUN_INTENT",
        "role": "REVIEWER",
        "run_id": "r",
        "endpoint": "/internal/executor/claim-ready-item",
        "body": {"role": "REVIEWER", "run_id": "r"},
    });
    let err = parse_intent(envelope).unwrap_err();
    assert_eq!(err.code(), "intent_endpoint_not_allowed");
}

#[test]
fn executor_may_resolve_linked_pr() {
    let envelope = json!({
        "type": "RUN_INTENT",
        "role": "EXECUTOR",
        "run_id": "r",
        "endpoint": "/internal/reviewer/resolve-linked-pr",
        "body": {"role": "EXECUTOR", "run_id": "r", "issue_number": 2},
    });
    let intent = parse_intent(envelope).unwrap();
    assert_eq!(intent.issue_number(), Some(2));
}

#[test]
fn parse_json_line_rejects_non_object() {
    assert_eq!(parse_json_line("[1,2]").unwrap_err().code(), "intent_invalid_type");
    assert_eq!(parse_json_line("{not json").unwrap_err().code(), "intent_invalid_json");
}

#[test]
fn intent_hash_ignores_key_order() {
    let a = parse_intent(valid_envelope()).unwrap();
    let reordered: serde_json::Value = serde_json::from_str(
        r#"{"body":{"run_id":"run-1","sprint":"M1","role":"EXECUTOR"},
            "endpoint":"/internal/executor/claim-ready-item",
            "run_id":"run-1","role":"EXECUTOR","type":"RUN_INTENT"}"#,
    )
    .unwrap();
    let b = parse_intent(reordered).unwrap();
    assert_eq!(a.intent_hash(), b.intent_hash());
    assert_eq!(a.intent_hash().len(), 64);
}

#[test]
fn intent_hash_differs_for_different_envelopes() {
    let a = parse_intent(valid_envelope()).unwrap();
    let mut other = valid_envelope();
    other["run_id"] = json!("run-2");
    other["body"]["run_id"] = json!("run-2");
    let b = parse_intent(other).unwrap();
    assert_ne!(a.intent_hash(), b.intent_hash());
}
