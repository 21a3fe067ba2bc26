// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Environment-driven supervisor configuration.
//!
//! A minimal `.env` loader runs first (real environment wins), then required
//! keys are validated and tunables fall back to documented defaults. CLI
//! flags override both.

use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{key} must be a positive integer")]
    InvalidInt { key: &'static str },
}

/// Flags parsed from the command line (see `sfd --help`).
#[derive(Debug, Clone, Default)]
pub struct CliFlags {
    pub dry_run: bool,
    pub once: bool,
    pub sprint: Option<String>,
    pub ready_target: Option<u32>,
}

/// Fully-resolved supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub backend_base_url: String,
    pub sprint: String,
    pub max_executors: u32,
    pub max_reviewers: u32,
    pub dry_run: bool,
    pub once: bool,
    pub ledger_path: String,
    pub state_path: String,
    pub planner_cmd: String,
    pub codex_bin: String,
    pub codex_mcp_args: String,
    pub tools_call_timeout_s: u64,
    /// Distinct, shorter timeout for the one strict re-ask.
    pub reply_timeout_s: u64,
    pub ready_target: u32,
    pub review_stall_polls: u64,
    pub blocked_retry_minutes: i64,
    pub watchdog_timeout_s: i64,
    pub sanitization_regen_attempts: u32,
    pub backend_timeout_s: u64,
    pub reviewer_dispatch_cap: u32,
    pub reviewer_retry_polls: u32,
}

/// Resolve configuration from an environment map plus CLI flags.
pub fn load_config(
    env: &HashMap<String, String>,
    flags: &CliFlags,
) -> Result<SupervisorConfig, ConfigError> {
    let backend_base_url = require(env, "BACKEND_BASE_URL")?.trim_end_matches('/').to_string();
    let sprint = match &flags.sprint {
        Some(sprint) if !sprint.trim().is_empty() => sprint.trim().to_string(),
        _ => require(env, "ORCHESTRATOR_SPRINT")?,
    };

    Ok(SupervisorConfig {
        backend_base_url,
        sprint,
        max_executors: positive(env, "RUNNER_MAX_EXECUTORS", 1)?,
        max_reviewers: positive(env, "RUNNER_MAX_REVIEWERS", 1)?,
        dry_run: flags.dry_run || boolean(env, "RUNNER_DRY_RUN"),
        once: flags.once,
        ledger_path: with_default(env, "RUNNER_LEDGER_PATH", "./.runner-ledger.json"),
        state_path: with_default(env, "RUNNER_ORCHESTRATOR_STATE_PATH", "./.orchestrator-state.json"),
        planner_cmd: with_default(
            env,
            "RUNNER_ORCHESTRATOR_CMD",
            "node apps/orchestrator/src/cli.js --loop",
        ),
        codex_bin: with_default(env, "CODEX_BIN", "codex"),
        codex_mcp_args: with_default(env, "CODEX_MCP_ARGS", "mcp-server"),
        tools_call_timeout_s: positive(env, "RUNNER_TOOLS_CALL_TIMEOUT_S", 600)? as u64,
        reply_timeout_s: positive(env, "RUNNER_REPLY_TIMEOUT_S", 180)? as u64,
        ready_target: flags.ready_target.unwrap_or(positive(env, "RUNNER_READY_TARGET", 2)?),
        review_stall_polls: positive(env, "RUNNER_REVIEW_STALL_POLLS", 50)? as u64,
        blocked_retry_minutes: positive(env, "RUNNER_BLOCKED_RETRY_MINUTES", 15)? as i64,
        watchdog_timeout_s: positive(env, "RUNNER_WATCHDOG_TIMEOUT_S", 900)? as i64,
        sanitization_regen_attempts: int_with_default(env, "RUNNER_SANITIZATION_REGEN_ATTEMPTS", 2)?,
        backend_timeout_s: positive(env, "BACKEND_TIMEOUT_S", 15)? as u64,
        reviewer_dispatch_cap: positive(env, "RUNNER_REVIEWER_DISPATCH_CAP", 2)?,
        reviewer_retry_polls: positive(env, "RUNNER_REVIEWER_RETRY_POLLS", 2)?,
    })
}

/// Parse a `.env` file: `KEY=VALUE` lines, `#` comments, optional single or
/// double quotes around the value. No interpolation.
pub fn load_dotenv(path: &Path) -> HashMap<String, String> {
    let mut values = HashMap::new();
    let Ok(raw) = std::fs::read_to_string(path) else {
        return values;
    };
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let mut value = value.trim();
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = &value[1..value.len() - 1];
        }
        values.insert(key.to_string(), value.to_string());
    }
    values
}

/// Process environment merged over `.env` values (environment wins).
pub fn merged_env(dotenv: HashMap<String, String>) -> HashMap<String, String> {
    let mut merged = dotenv;
    for (key, value) in std::env::vars() {
        merged.insert(key, value);
    }
    merged
}

fn require(env: &HashMap<String, String>, key: &'static str) -> Result<String, ConfigError> {
    match env.get(key).map(|v| v.trim()) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(ConfigError::Missing(key)),
    }
}

fn with_default(env: &HashMap<String, String>, key: &str, default: &str) -> String {
    match env.get(key).map(|v| v.trim()) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => default.to_string(),
    }
}

fn positive(env: &HashMap<String, String>, key: &'static str, default: u32) -> Result<u32, ConfigError> {
    match env.get(key).map(|v| v.trim()) {
        Some(value) if !value.is_empty() => match value.parse::<u32>() {
            Ok(parsed) if parsed > 0 => Ok(parsed),
            _ => Err(ConfigError::InvalidInt { key }),
        },
        _ => Ok(default),
    }
}

/// Like [`positive`] but zero is meaningful (e.g. regeneration disabled).
fn int_with_default(
    env: &HashMap<String, String>,
    key: &'static str,
    default: u32,
) -> Result<u32, ConfigError> {
    match env.get(key).map(|v| v.trim()) {
        Some(value) if !value.is_empty() => {
            value.parse::<u32>().map_err(|_| ConfigError::InvalidInt { key })
        }
        _ => Ok(default),
    }
}

fn boolean(env: &HashMap<String, String>, key: &str) -> bool {
    env.get(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on"))
        .unwrap_or(false)
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
