// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tests for canonical JSON serialization

use super::*;
use serde_json::json;

#[test]
fn sorts_keys_at_every_level() {
    let value = json!({"b": 1, "a": {"z": true, "m": [1, 2]}});
    assert_eq!(canonical_json(&value), r#"{"a":{"m":[1,2],"z":true},"b":1}"#);
}

#[test]
fn key_order_and_whitespace_do_not_change_output() {
    let a: serde_json::Value =
        serde_json::from_str(r#"{ "role": "EXECUTOR",  "run_id": "r-1" }"#).unwrap();
    let b: serde_json::Value =
        serde_json::from_str(r#"{"run_id":"r-1","role":"EXECUTOR"}"#).unwrap();
    assert_eq!(canonical_json(&a), canonical_json(&b));
}

#[test]
fn escapes_non_ascii_as_unicode_escapes() {
    let value = json!({"summary": "caf\u{e9}"});
    assert_eq!(canonical_json(&value), "{\"summary\":\"caf\\u00e9\"}");
}

#[test]
fn escapes_astral_plane_as_surrogate_pair() {
    let value = json!("\u{1f600}");
    assert_eq!(canonical_json(&value), "\"\\ud83d\\ude00\"");
}

#[yare::parameterized(
    quote = { "a\"b", "\"a\\\"b\"" },
    backslash = { "a\\b", "\"a\\\\b\"" },
    newline = { "a\nb", "\"a\\nb\"" },
    tab = { "a\tb", "\"a\\tb\"" },
    control = { "a\u{01}b", "\"a\\u0001b\"" },
)]
fn escapes_special_characters(input: &str, expected: &str) {
    assert_eq!(canonical_json(&json!(input)), expected);
}

#[test]
fn scalars_render_minimally() {
    assert_eq!(canonical_json(&json!(null)), "null");
    assert_eq!(canonical_json(&json!(true)), "true");
    assert_eq!(canonical_json(&json!(42)), "42");
    assert_eq!(canonical_json(&json!([])), "[]");
    assert_eq!(canonical_json(&json!({})), "{}");
}
