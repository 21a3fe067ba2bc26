// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! sf-adapters: external collaborators of the supervisor.
//!
//! The policy backend (HTTP/JSON), the agent worker (JSON-RPC over stdio),
//! and the best-effort transcript stream. Each adapter exposes a trait seam
//! so the supervisor can be exercised with stubs.

pub mod backend;
pub mod codex;
pub mod transcript;

pub use backend::{BackendApi, BackendClient, HttpError};
pub use codex::{CodexConfig, CodexDriver, CodexWorkerError, WorkerDriver, MCP_PROTOCOL_VERSION};
pub use transcript::{TranscriptHandle, TranscriptSink};
