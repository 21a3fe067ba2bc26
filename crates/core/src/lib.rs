// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! sf-core: schema and taxonomy for the Sprint Foreman supervisor.
//!
//! Planner intents and agent worker results are validated here at the process
//! boundary and projected into typed records; everything downstream operates
//! on those records only.

pub mod canonical;
pub mod clock;
pub mod events;
pub mod failure;
pub mod intent;
pub mod result;

pub use canonical::canonical_json;
pub use clock::{format_iso, parse_iso, Clock, FakeClock, SystemClock};
pub use events::{EventSink, StderrSink};
#[cfg(any(test, feature = "test-support"))]
pub use events::MemorySink;
pub use failure::{exit_code_for, is_retryable, FailureClass, ITEM_STOP_WORKER_CODES};
pub use intent::{parse_intent, parse_json_line, IntentError, Role, RunIntent};
pub use result::{
    parse_worker_result, ReviewerOutcome, RunStatus, WorkerResult, WorkerResultError, PR_URL_KEYS,
};
