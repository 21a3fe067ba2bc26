// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker stderr observer.
//!
//! Reads the agent's stderr to EOF on a dedicated task, surfacing
//! transcript-worthy signals (executed commands, error-ish text) without ever
//! blocking or failing the run.

use crate::transcript::TranscriptHandle;
use regex::Regex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStderr;
use tokio::task::JoinHandle;

const OBSERVATION_MAX_CHARS: usize = 600;

/// Scanners are compiled once; a pattern that fails to compile simply
/// disables that scanner.
pub(super) struct StderrObserver {
    command_re: Option<Regex>,
    errorish_re: Option<Regex>,
}

#[derive(Debug, PartialEq)]
pub(super) enum Observation {
    Command(String),
    Errorish(String),
}

impl StderrObserver {
    pub(super) fn new() -> Self {
        Self {
            command_re: Regex::new(r"^(\$|command:|running command:|run command:)\s*(.+)$").ok(),
            errorish_re: Regex::new(r"(?i)error|failed|exception|traceback|timeout|refused|unreachable")
                .ok(),
        }
    }

    /// Classify one stderr line. JSON payloads naming `exec_command` and
    /// shell-prompt-shaped lines are commands; anything error-ish is noise
    /// worth a transcript entry.
    pub(super) fn scan(&self, line: &str) -> Option<Observation> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            if value.is_object() && mentions_exec_command(&value) {
                return Some(Observation::Command(clip(trimmed)));
            }
        }

        if let Some(re) = &self.command_re {
            if let Some(captures) = re.captures(trimmed) {
                if let Some(cmd) = captures.get(2) {
                    return Some(Observation::Command(clip(cmd.as_str())));
                }
            }
        }

        if let Some(re) = &self.errorish_re {
            if re.is_match(trimmed) {
                return Some(Observation::Errorish(clip(trimmed)));
            }
        }

        None
    }
}

fn mentions_exec_command(value: &Value) -> bool {
    let Some(map) = value.as_object() else {
        return false;
    };
    if map.contains_key("exec_command") {
        return true;
    }
    map.get("type")
        .and_then(Value::as_str)
        .is_some_and(|t| t.contains("exec_command"))
}

fn clip(text: &str) -> String {
    if text.chars().count() <= OBSERVATION_MAX_CHARS {
        return text.to_string();
    }
    text.chars().take(OBSERVATION_MAX_CHARS).collect()
}

/// Spawn the observer task for a worker's stderr. The task ends at EOF; all
/// failures are swallowed.
pub(super) fn spawn(stderr: ChildStderr, transcript: TranscriptHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let observer = StderrObserver::new();
        let mut lines = BufReader::new(stderr).lines();
        let mut last_emitted: Option<String> = None;
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "worker stderr read ended");
                    break;
                }
            };
            let Some(observation) = observer.scan(&line) else {
                continue;
            };
            let (kind, text) = match observation {
                Observation::Command(text) => ("command", text),
                Observation::Errorish(text) => ("stderr", text),
            };
            if last_emitted.as_deref() == Some(text.as_str()) {
                continue;
            }
            last_emitted = Some(text.clone());
            transcript.publish(serde_json::json!({
                "type": "WORKER_OBSERVATION",
                "kind": kind,
                "text": text,
            }));
        }
    })
}

#[cfg(test)]
#[path = "observer_tests.rs"]
mod tests;
