// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tests for stderr observation

use super::*;

#[yare::parameterized(
    dollar_prompt = { "$ cargo test --workspace", "cargo test --workspace" },
    command_label = { "command: git push origin main", "git push origin main" },
    running_command = { "running command: ls -la", "ls -la" },
    run_command = { "run command: make check", "make check" },
)]
fn shell_shaped_lines_are_commands(line: &str, expected: &str) {
    let observer = StderrObserver::new();
    assert_eq!(observer.scan(line), Some(Observation::Command(expected.to_string())));
}

#[test]
fn json_exec_command_payload_is_a_command() {
    let observer = StderrObserver::new();
    let line = r#"{"exec_command": "npm test", "cwd": "."}"#;
    assert!(matches!(observer.scan(line), Some(Observation::Command(_))));

    let typed = r#"{"type": "exec_command_begin", "command": "npm test"}"#;
    assert!(matches!(observer.scan(typed), Some(Observation::Command(_))));
}

#[yare::parameterized(
    error = { "Error: connection refused" },
    failed = { "the task failed with status 1" },
    traceback = { "Traceback (most recent call last):" },
    timeout = { "request timeout after 30s" },
    unreachable = { "host unreachable" },
)]
fn errorish_lines_are_observed(line: &str) {
    let observer = StderrObserver::new();
    assert!(matches!(observer.scan(line), Some(Observation::Errorish(_))));
}

#[test]
fn mundane_lines_are_ignored() {
    let observer = StderrObserver::new();
    assert_eq!(observer.scan("fetching metadata"), None);
    assert_eq!(observer.scan(""), None);
    assert_eq!(observer.scan("   "), None);
}

#[test]
fn observations_are_clipped_to_600_chars() {
    let observer = StderrObserver::new();
    let long = format!("error: {}", "x".repeat(2000));
    match observer.scan(&long) {
        Some(Observation::Errorish(text)) => assert_eq!(text.chars().count(), 600),
        other => panic!("unexpected observation: {other:?}"),
    }
}
