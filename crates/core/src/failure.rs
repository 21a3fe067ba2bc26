// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Failure classification and the exit-code contract.
//!
//! Every error is classified exactly once where it crosses a component
//! boundary. Anything not positively identified is HARD_STOP (fail closed).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Worker error codes that stop the current item but leave the pool running.
pub const ITEM_STOP_WORKER_CODES: [&str; 7] = [
    "mcp_timeout",
    "mcp_error_response",
    "mcp_invalid_result",
    "mcp_invalid_json",
    "worker_invalid_output",
    "worker_identity_mismatch",
    "mcp_stdio_unavailable",
];

/// Error codes whose failures may be re-promoted by the Blocked-retry cooldown.
pub const RETRYABLE_ERROR_CODES: [&str; 4] =
    ["mcp_timeout", "backend_unreachable", "mcp_stdio_unavailable", "mcp_error_response"];

/// How a failure affects the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureClass {
    /// Drain workers and exit 2.
    #[serde(rename = "HARD_STOP")]
    HardStop,
    /// Give up on the current item; the pool keeps running.
    #[serde(rename = "ITEM_STOP")]
    ItemStop,
    /// Same run behavior as ITEM_STOP; eligible for cooldown retry.
    #[serde(rename = "TRANSIENT")]
    Transient,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::HardStop => "HARD_STOP",
            FailureClass::ItemStop => "ITEM_STOP",
            FailureClass::Transient => "TRANSIENT",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a recorded failure is eligible for the Blocked-retry cooldown.
///
/// Pure over the strings the ledger stores, so reconciliation can evaluate
/// rows written by earlier supervisor processes.
pub fn is_retryable(classification: &str, error_code: &str) -> bool {
    classification == "TRANSIENT" || RETRYABLE_ERROR_CODES.contains(&error_code)
}

/// Process exit code for a top-level failure of the given class.
pub fn exit_code_for(class: FailureClass) -> i32 {
    match class {
        FailureClass::Transient => 4,
        FailureClass::HardStop => 2,
        FailureClass::ItemStop => 0,
    }
}

#[cfg(test)]
#[path = "failure_tests.rs"]
mod tests;
