// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tests for configuration loading

use super::*;
use std::collections::HashMap;

fn base_env() -> HashMap<String, String> {
    HashMap::from([
        ("BACKEND_BASE_URL".to_string(), "http://localhost:4000/".to_string()),
        ("ORCHESTRATOR_SPRINT".to_string(), "M1".to_string()),
    ])
}

#[test]
fn minimal_env_uses_defaults() {
    let config = load_config(&base_env(), &CliFlags::default()).unwrap();
    assert_eq!(config.backend_base_url, "http://localhost:4000");
    assert_eq!(config.sprint, "M1");
    assert_eq!(config.max_executors, 1);
    assert_eq!(config.max_reviewers, 1);
    assert!(!config.dry_run);
    assert_eq!(config.ledger_path, "./.runner-ledger.json");
    assert_eq!(config.state_path, "./.orchestrator-state.json");
    assert_eq!(config.planner_cmd, "node apps/orchestrator/src/cli.js --loop");
    assert_eq!(config.codex_bin, "codex");
    assert_eq!(config.codex_mcp_args, "mcp-server");
    assert_eq!(config.tools_call_timeout_s, 600);
    assert_eq!(config.reply_timeout_s, 180);
    assert_eq!(config.ready_target, 2);
    assert_eq!(config.review_stall_polls, 50);
    assert_eq!(config.blocked_retry_minutes, 15);
    assert_eq!(config.watchdog_timeout_s, 900);
    assert_eq!(config.sanitization_regen_attempts, 2);
    assert_eq!(config.backend_timeout_s, 15);
}

#[yare::parameterized(
    backend_url = { "BACKEND_BASE_URL" },
    sprint = { "ORCHESTRATOR_SPRINT" },
)]
fn required_keys_are_enforced(key: &str) {
    let mut env = base_env();
    env.remove(key);
    let err = load_config(&env, &CliFlags::default()).unwrap_err();
    assert!(matches!(err, ConfigError::Missing(_)));

    env.insert(key.to_string(), "   ".to_string());
    assert!(load_config(&env, &CliFlags::default()).is_err());
}

#[test]
fn sprint_flag_overrides_env() {
    let flags = CliFlags { sprint: Some("M3".to_string()), ..CliFlags::default() };
    let config = load_config(&base_env(), &flags).unwrap();
    assert_eq!(config.sprint, "M3");

    // Flag alone is enough; the env key becomes optional.
    let mut env = base_env();
    env.remove("ORCHESTRATOR_SPRINT");
    assert_eq!(load_config(&env, &flags).unwrap().sprint, "M3");
}

#[yare::parameterized(
    zero = { "0" },
    negative = { "-2" },
    word = { "two" },
)]
fn worker_counts_must_be_positive_integers(raw: &str) {
    let mut env = base_env();
    env.insert("RUNNER_MAX_EXECUTORS".to_string(), raw.to_string());
    let err = load_config(&env, &CliFlags::default()).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidInt { key: "RUNNER_MAX_EXECUTORS" }));
}

#[test]
fn regen_attempts_zero_is_allowed() {
    let mut env = base_env();
    env.insert("RUNNER_SANITIZATION_REGEN_ATTEMPTS".to_string(), "0".to_string());
    let config = load_config(&env, &CliFlags::default()).unwrap();
    assert_eq!(config.sanitization_regen_attempts, 0);
}

#[yare::parameterized(
    one = { "1", true },
    true_word = { "true", true },
    yes = { "YES", true },
    on = { "on", true },
    zero = { "0", false },
    off = { "off", false },
    empty = { "", false },
)]
fn dry_run_env_parsing(raw: &str, expected: bool) {
    let mut env = base_env();
    env.insert("RUNNER_DRY_RUN".to_string(), raw.to_string());
    let config = load_config(&env, &CliFlags::default()).unwrap();
    assert_eq!(config.dry_run, expected);
}

#[test]
fn dry_run_flag_wins_over_env() {
    let flags = CliFlags { dry_run: true, ..CliFlags::default() };
    let config = load_config(&base_env(), &flags).unwrap();
    assert!(config.dry_run);
}

#[test]
fn ready_target_flag_overrides_env() {
    let mut env = base_env();
    env.insert("RUNNER_READY_TARGET".to_string(), "4".to_string());
    let flags = CliFlags { ready_target: Some(1), ..CliFlags::default() };
    assert_eq!(load_config(&env, &flags).unwrap().ready_target, 1);
    assert_eq!(load_config(&env, &CliFlags::default()).unwrap().ready_target, 4);
}

#[test]
fn dotenv_parses_comments_quotes_and_blanks() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join(".env");
    std::fs::write(
        &path,
        "# supervisor settings\n\
         BACKEND_BASE_URL=http://localhost:4000\n\
         \n\
         ORCHESTRATOR_SPRINT=\"M2\"\n\
         CODEX_BIN='my-codex'\n\
         not a key value line\n\
         EMPTY=\n",
    )
    .unwrap();

    let values = load_dotenv(&path);
    assert_eq!(values["BACKEND_BASE_URL"], "http://localhost:4000");
    assert_eq!(values["ORCHESTRATOR_SPRINT"], "M2");
    assert_eq!(values["CODEX_BIN"], "my-codex");
    assert_eq!(values["EMPTY"], "");
    assert!(!values.contains_key("not a key value line"));
}

#[test]
fn missing_dotenv_is_empty() {
    let dir = tempfile::TempDir::new().unwrap();
    assert!(load_dotenv(&dir.path().join(".env")).is_empty());
}
