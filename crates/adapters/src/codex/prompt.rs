// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker prompt assembly.
//!
//! The backend's bundle is the executable contract and is injected verbatim
//! as base instructions; the prompt adds runner-level guardrails and the
//! exact JSON-only result shape.

use super::CodexWorkerError;
use serde_json::Value;
use sf_core::Role;

/// Sandbox mode for a worker role. The worker must be able to reach a
/// locally-running backend, which stricter codex sandboxes block.
pub fn sandbox_for_role(role: Role) -> &'static str {
    match role {
        Role::Executor | Role::Reviewer => "danger-full-access",
    }
}

/// Render the agent context bundle into base instructions, verbatim.
pub fn bundle_to_base_instructions(bundle: &Value) -> Result<String, CodexWorkerError> {
    let role = bundle
        .get("role")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .ok_or_else(|| CodexWorkerError::BundleInvalid("missing role".to_string()))?;
    let files = bundle
        .get("files")
        .and_then(Value::as_array)
        .ok_or_else(|| CodexWorkerError::BundleInvalid("missing files array".to_string()))?;

    let mut parts: Vec<String> = Vec::with_capacity(files.len() * 3 + 3);
    parts.push(format!("ROLE: {role}"));
    parts.push("BUNDLE_FILES_BEGIN".to_string());
    for entry in files {
        let path = entry
            .get("path")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| CodexWorkerError::BundleInvalid("bundle file missing path".to_string()))?;
        let content = entry.get("content").and_then(Value::as_str).ok_or_else(|| {
            CodexWorkerError::BundleInvalid(format!("bundle file missing content: {path}"))
        })?;
        parts.push(format!("FILE_BEGIN {path}"));
        parts.push(content.to_string());
        parts.push(format!("FILE_END {path}"));
    }
    parts.push("BUNDLE_FILES_END".to_string());
    Ok(parts.join("\n"))
}

/// Runner-level guardrails passed as developer instructions on every call.
pub fn developer_instructions() -> &'static str {
    "Treat base-instructions as executable contract. Do not rewrite or summarize it. \
     Do not attempt to start the backend server. \
     Never merge PRs or close issues. Fail closed on ambiguity."
}

/// Build the prompt for one RUN_INTENT.
pub fn build_worker_prompt(role: Role, run_id: &str, intent_raw: &Value, backend_base_url: &str) -> String {
    let intent_json = serde_json::to_string_pretty(intent_raw).unwrap_or_default();

    let role_specific_rules = match role {
        Role::Reviewer => {
            "Reviewer-specific constraints:\n\
             - Leave feedback as GitHub ISSUE comments only.\n\
             - Do NOT call github.pull_request_review_write and do NOT submit approvals.\n\
             - For findings, use checklist IDs (R1, R2, ...) and include explicit done conditions.\n\
             - End feedback with: Reviewer: addressed (requesting evidence per item ID).\n\
             - Set \"outcome\" to PASS, FAIL, or INCOMPLETE; it is required.\n"
        }
        Role::Executor => {
            "Executor-specific constraints:\n\
             - If you opened or updated a pull request, include its URL under urls \
             and set \"marker_verified\": true only after confirming the PR body \
             carries the run marker.\n"
        }
    };

    format!(
        "You are a Codex worker executing exactly one RUN_INTENT.\n\
         Non-negotiable rules:\n\
         - Treat the provided bundle as executable contract; do not summarize, rewrite, or omit any content.\n\
         - Do not merge PRs. Do not close issues. Do not use auto-close keywords.\n\
         - Never bypass backend policy gates; all state changes must go through backend endpoints.\n\
         - Do NOT attempt to start or run the backend server; if the backend endpoint is unreachable, fail closed.\n\
         - Fail closed on ambiguity.\n\n\
         Backend base URL: {backend_base_url}\n\n\
         {role_specific_rules}\n\
         RUN_INTENT (verbatim):\n\
         {intent_json}\n\n\
         Execution requirement:\n\
         - Call the backend endpoint at: <backend base URL> + intent.endpoint with JSON body intent.body.\n\
         - Then follow the role runbook (from base-instructions) to complete the workflow.\n\n\
         Return EXACTLY one JSON object and nothing else (no prose, no markdown, no wrappers) with this exact shape:\n\
         {{\n\
           \"run_id\": \"{run_id}\",\n\
           \"role\": \"{role}\",\n\
           \"status\": \"succeeded\"|\"failed\",\n\
           \"outcome\": \"PASS\"|\"FAIL\"|\"INCOMPLETE\",\n\
           \"summary\": \"...\",\n\
           \"urls\": {{\"key\":\"value\"}},\n\
           \"errors\": [{{\"code\":\"...\",\"message\":\"...\"}}],\n\
           \"marker_verified\": true|false\n\
         }}\n"
    )
}

/// Prompt for the single strict re-ask after malformed output.
pub fn reply_prompt() -> &'static str {
    "Re-output the final result as JSON only with keys: run_id, role, status, outcome, \
     summary, urls, errors, marker_verified. No prose."
}

#[cfg(test)]
#[path = "prompt_tests.rs"]
mod tests;
