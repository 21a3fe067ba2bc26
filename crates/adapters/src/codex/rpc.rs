// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Line-delimited JSON-RPC 2.0 over the worker's stdio.
//!
//! One request is in flight at a time. The receive loop is deadline-bounded
//! and ignores messages whose id does not match the in-flight request
//! (notifications, out-of-order replies). Non-JSON lines and non-object JSON
//! values are hard errors for that call.

use super::CodexWorkerError;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::time::Instant;

pub(super) struct JsonRpcClient {
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: i64,
}

impl JsonRpcClient {
    pub(super) fn new(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self { stdin, stdout: BufReader::new(stdout).lines(), next_id: 1 }
    }

    /// Issue a request and wait for its matching response object.
    pub(super) async fn call(
        &mut self,
        method: &'static str,
        params: Value,
        timeout: std::time::Duration,
    ) -> Result<Value, CodexWorkerError> {
        let request_id = self.next_id;
        self.next_id += 1;
        self.send(serde_json::json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "method": method,
            "params": params,
        }))
        .await?;

        let deadline = Instant::now() + timeout;
        loop {
            let Some(message) = self.recv_one(deadline, method).await? else {
                continue;
            };
            if message.get("id").and_then(Value::as_i64) != Some(request_id) {
                continue;
            }
            if let Some(error) = message.get("error") {
                return Err(CodexWorkerError::McpErrorResponse {
                    method,
                    error: error.clone(),
                });
            }
            return match message.get("result") {
                Some(result) if result.is_object() => Ok(result.clone()),
                _ => Err(CodexWorkerError::McpInvalidResult { method }),
            };
        }
    }

    /// Fire a notification (no id, no reply).
    pub(super) async fn notify(
        &mut self,
        method: &'static str,
        params: Value,
    ) -> Result<(), CodexWorkerError> {
        self.send(serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }))
        .await
    }

    async fn send(&mut self, payload: Value) -> Result<(), CodexWorkerError> {
        let mut line = payload.to_string();
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|_| CodexWorkerError::McpStdioUnavailable)?;
        self.stdin.flush().await.map_err(|_| CodexWorkerError::McpStdioUnavailable)
    }

    /// Read one message before the deadline. `Ok(None)` means an ignorable
    /// blank line; EOF and timeouts are errors.
    async fn recv_one(
        &mut self,
        deadline: Instant,
        method: &'static str,
    ) -> Result<Option<Value>, CodexWorkerError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CodexWorkerError::McpTimeout { method });
        }
        let line = tokio::time::timeout(remaining, self.stdout.next_line())
            .await
            .map_err(|_| CodexWorkerError::McpTimeout { method })?
            .map_err(|_| CodexWorkerError::McpStdioUnavailable)?
            .ok_or(CodexWorkerError::McpStdioUnavailable)?;

        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let value: Value = serde_json::from_str(line)
            .map_err(|_| CodexWorkerError::McpInvalidJson { line: line.to_string() })?;
        if !value.is_object() {
            return Err(CodexWorkerError::McpInvalidJson { line: line.to_string() });
        }
        Ok(Some(value))
    }
}
