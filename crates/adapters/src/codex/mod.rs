// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent worker driver: one codex MCP server per run, driven over
//! line-delimited JSON-RPC on stdio.
//!
//! The driver owns the full lifecycle: spawn, handshake, tool call, result
//! extraction with a single strict re-ask, and best-effort teardown. Its
//! stderr is observed (never inherited) so command traces reach the
//! transcript without risking pipe deadlocks on the RPC channel.

mod observer;
pub mod prompt;
mod rpc;

use crate::transcript::TranscriptHandle;
use async_trait::async_trait;
use rpc::JsonRpcClient;
use serde_json::{json, Value};
use sf_core::{parse_worker_result, RunIntent, WorkerResult, WorkerResultError};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// Protocol version announced in `initialize`; the server must echo it.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Worker-side failure. The supervisor classifies these by `code`.
#[derive(Debug, Error)]
pub enum CodexWorkerError {
    #[error("mcp call timed out: {method}")]
    McpTimeout { method: &'static str },
    #[error("mcp server returned error for {method}: {error}")]
    McpErrorResponse { method: &'static str, error: Value },
    #[error("mcp server returned invalid result type for {method}")]
    McpInvalidResult { method: &'static str },
    #[error("mcp server emitted non-json output: {line}")]
    McpInvalidJson { line: String },
    #[error("mcp server stdio is not available")]
    McpStdioUnavailable,
    #[error("mcp protocol version mismatch (expected {expected}, got {actual:?})")]
    McpProtocolMismatch { expected: &'static str, actual: Option<String> },
    #[error("mcp tools/list returned invalid tools")]
    McpInvalidTools,
    #[error("codex tool not available on mcp server")]
    MissingCodexTool,
    #[error("failed to spawn codex mcp server: {0}")]
    SpawnFailed(String),
    #[error("{0}")]
    InvalidOutput(String),
    #[error("worker result identity mismatch")]
    IdentityMismatch,
    #[error("intent is not executable: {0}")]
    InvalidIntent(String),
    #[error("agent context bundle invalid: {0}")]
    BundleInvalid(String),
    #[error("failed to check codex mcp configuration: {0}")]
    McpCheckFailed(String),
    #[error("required codex mcp servers are not enabled: {missing:?}")]
    McpServersMissing { missing: Vec<String> },
}

impl CodexWorkerError {
    /// Stable wire code, recorded in events and the ledger.
    pub fn code(&self) -> &'static str {
        match self {
            CodexWorkerError::McpTimeout { .. } => "mcp_timeout",
            CodexWorkerError::McpErrorResponse { .. } => "mcp_error_response",
            CodexWorkerError::McpInvalidResult { .. } => "mcp_invalid_result",
            CodexWorkerError::McpInvalidJson { .. } => "mcp_invalid_json",
            CodexWorkerError::McpStdioUnavailable => "mcp_stdio_unavailable",
            CodexWorkerError::McpProtocolMismatch { .. } => "mcp_protocol_mismatch",
            CodexWorkerError::McpInvalidTools => "mcp_invalid_tools",
            CodexWorkerError::MissingCodexTool => "mcp_missing_codex_tool",
            CodexWorkerError::SpawnFailed(_) => "mcp_spawn_failed",
            CodexWorkerError::InvalidOutput(_) => "worker_invalid_output",
            CodexWorkerError::IdentityMismatch => "worker_identity_mismatch",
            CodexWorkerError::InvalidIntent(_) => "worker_invalid_intent",
            CodexWorkerError::BundleInvalid(_) => "bundle_invalid",
            CodexWorkerError::McpCheckFailed(_) => "codex_mcp_check_failed",
            CodexWorkerError::McpServersMissing { .. } => "codex_mcp_servers_missing",
        }
    }
}

impl From<WorkerResultError> for CodexWorkerError {
    fn from(err: WorkerResultError) -> Self {
        match err {
            WorkerResultError::IdentityMismatch { .. } => CodexWorkerError::IdentityMismatch,
            other => CodexWorkerError::InvalidOutput(other.to_string()),
        }
    }
}

/// Driver configuration. The re-ask path deliberately uses a shorter timeout
/// than the primary call.
#[derive(Debug, Clone)]
pub struct CodexConfig {
    pub codex_bin: String,
    pub mcp_args: String,
    pub tools_call_timeout: Duration,
    pub reply_timeout: Duration,
}

impl Default for CodexConfig {
    fn default() -> Self {
        Self {
            codex_bin: "codex".to_string(),
            mcp_args: "mcp-server".to_string(),
            tools_call_timeout: Duration::from_secs(600),
            reply_timeout: Duration::from_secs(180),
        }
    }
}

/// Seam the supervisor drives workers through; stubbed in tests.
#[async_trait]
pub trait WorkerDriver: Send + Sync {
    async fn run_intent(
        &self,
        bundle: &Value,
        intent: &RunIntent,
        backend_base_url: &str,
        transcript: TranscriptHandle,
    ) -> Result<WorkerResult, CodexWorkerError>;
}

/// Production driver spawning `codex mcp-server` per intent.
pub struct CodexDriver {
    config: CodexConfig,
}

impl CodexDriver {
    pub fn new(config: CodexConfig) -> Self {
        Self { config }
    }

    fn spawn_server(&self) -> Result<Child, CodexWorkerError> {
        let mut command = Command::new(&self.config.codex_bin);
        command
            .args(self.config.mcp_args.split_whitespace())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        command.spawn().map_err(|e| CodexWorkerError::SpawnFailed(e.to_string()))
    }

    async fn drive(
        &self,
        client: &mut JsonRpcClient,
        bundle: &Value,
        intent: &RunIntent,
        backend_base_url: &str,
    ) -> Result<WorkerResult, CodexWorkerError> {
        let init = client
            .call(
                "initialize",
                json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "sprint-foreman-runner",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
                HANDSHAKE_TIMEOUT,
            )
            .await?;
        let announced = init.get("protocolVersion").and_then(Value::as_str);
        if announced != Some(MCP_PROTOCOL_VERSION) {
            return Err(CodexWorkerError::McpProtocolMismatch {
                expected: MCP_PROTOCOL_VERSION,
                actual: announced.map(str::to_string),
            });
        }

        client.notify("notifications/initialized", json!({})).await?;

        let tools = client.call("tools/list", json!({}), HANDSHAKE_TIMEOUT).await?;
        let tools = tools.get("tools").and_then(Value::as_array).ok_or(CodexWorkerError::McpInvalidTools)?;
        let has_codex = tools
            .iter()
            .any(|t| t.get("name").and_then(Value::as_str) == Some("codex"));
        if !has_codex {
            return Err(CodexWorkerError::MissingCodexTool);
        }

        let worker_prompt =
            prompt::build_worker_prompt(intent.role, &intent.run_id, intent.raw(), backend_base_url);
        let base_instructions = prompt::bundle_to_base_instructions(bundle)?;

        let tool_result = client
            .call(
                "tools/call",
                json!({
                    "name": "codex",
                    "arguments": {
                        "prompt": worker_prompt,
                        "base-instructions": base_instructions,
                        "developer-instructions": prompt::developer_instructions(),
                        "cwd": ".",
                        "sandbox": prompt::sandbox_for_role(intent.role),
                        "approval-policy": "never",
                    },
                }),
                self.config.tools_call_timeout,
            )
            .await?;

        let thread_id = extract_thread_id(&tool_result)?;
        let text = extract_text(&tool_result)?;
        match parse_worker_result(&text, &intent.run_id, intent.role) {
            Ok(result) => Ok(result),
            Err(first_error) => {
                // One strict re-ask to remove ambiguity about output shape; a
                // second failure is terminal for the run.
                tracing::warn!(
                    run_id = %intent.run_id,
                    error = %first_error,
                    "worker output malformed; issuing strict re-ask"
                );
                let retry_result = client
                    .call(
                        "tools/call",
                        json!({
                            "name": "codex-reply",
                            "arguments": {
                                "threadId": thread_id,
                                "prompt": prompt::reply_prompt(),
                            },
                        }),
                        self.config.reply_timeout,
                    )
                    .await?;
                let retry_text = extract_text(&retry_result)?;
                parse_worker_result(&retry_text, &intent.run_id, intent.role)
                    .map_err(CodexWorkerError::from)
            }
        }
    }
}

#[async_trait]
impl WorkerDriver for CodexDriver {
    async fn run_intent(
        &self,
        bundle: &Value,
        intent: &RunIntent,
        backend_base_url: &str,
        transcript: TranscriptHandle,
    ) -> Result<WorkerResult, CodexWorkerError> {
        if backend_base_url.trim().is_empty() {
            return Err(CodexWorkerError::InvalidIntent("backend_base_url is required".to_string()));
        }

        let mut child = self.spawn_server()?;
        let stdin = child.stdin.take().ok_or(CodexWorkerError::McpStdioUnavailable)?;
        let stdout = child.stdout.take().ok_or(CodexWorkerError::McpStdioUnavailable)?;
        let observer_task = child.stderr.take().map(|stderr| observer::spawn(stderr, transcript));

        let mut client = JsonRpcClient::new(stdin, stdout);
        let outcome = self.drive(&mut client, bundle, intent, backend_base_url).await;
        teardown(client, child, observer_task).await;
        outcome
    }
}

/// Extract the tool's text payload: `structuredContent.content`, then a
/// top-level `content` string, then a `content` array of text blocks.
fn extract_text(tool_result: &Value) -> Result<String, CodexWorkerError> {
    if let Some(text) = tool_result
        .get("structuredContent")
        .and_then(|s| s.get("content"))
        .and_then(Value::as_str)
        .filter(|t| !t.trim().is_empty())
    {
        return Ok(text.to_string());
    }

    match tool_result.get("content") {
        Some(Value::String(text)) if !text.trim().is_empty() => return Ok(text.clone()),
        Some(Value::Array(blocks)) => {
            let chunks: Vec<&str> = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            let joined = chunks.join("\n");
            if !joined.trim().is_empty() {
                return Ok(joined);
            }
        }
        _ => {}
    }

    Err(CodexWorkerError::InvalidOutput("codex tool returned no text content".to_string()))
}

/// The thread id is required so the re-ask can address the same conversation.
fn extract_thread_id(tool_result: &Value) -> Result<String, CodexWorkerError> {
    tool_result
        .get("structuredContent")
        .and_then(|s| s.get("threadId"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            CodexWorkerError::InvalidOutput(
                "codex tool result missing structuredContent.threadId".to_string(),
            )
        })
}

/// Best-effort shutdown: polite RPC first, then a bounded wait, then kill.
async fn teardown(mut client: JsonRpcClient, mut child: Child, observer: Option<JoinHandle<()>>) {
    let _ = client.call("shutdown", json!({}), SHUTDOWN_TIMEOUT).await;
    let _ = client.notify("exit", json!({})).await;
    drop(client);

    if tokio::time::timeout(EXIT_GRACE, child.wait()).await.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
    if let Some(task) = observer {
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }
}

/// Fail closed if the codex CLI is not configured with the GitHub MCP tools
/// the worker runbooks rely on.
pub async fn assert_codex_github_mcp_available(codex_bin: &str) -> Result<(), CodexWorkerError> {
    let output = tokio::time::timeout(
        Duration::from_secs(10),
        Command::new(codex_bin).args(["mcp", "list"]).output(),
    )
    .await
    .map_err(|_| CodexWorkerError::McpCheckFailed("codex mcp list timed out".to_string()))?
    .map_err(|e| CodexWorkerError::McpCheckFailed(e.to_string()))?;

    let combined = format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    if !output.status.success() {
        return Err(CodexWorkerError::McpCheckFailed(format!(
            "codex mcp list failed: {}",
            combined.trim()
        )));
    }

    let has_enabled = |name: &str| {
        combined
            .lines()
            .any(|line| line.trim().starts_with(name) && line.contains("enabled"))
    };
    let missing: Vec<String> = ["github", "github_projects"]
        .iter()
        .filter(|&&name| !has_enabled(name))
        .map(|name| name.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(CodexWorkerError::McpServersMissing { missing });
    }
    Ok(())
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
