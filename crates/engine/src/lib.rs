// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! sf-engine: board policy — dependency sanitization and Ready-buffer
//! promotion.
//!
//! `depends_on` edges exist only to sequence writers that share ownership;
//! everything else is pruned before any promotion decision is made.

pub mod plan;
pub mod promote;
pub mod sanitize;

pub use plan::{parse_sprint_plan, IsolationMode, ScopeEntry, SprintPlan, TaskRow};
pub use promote::{autopromote_ready, PromoteError, PromoteOptions};
pub use sanitize::{
    normalize_path, paths_overlap, sanitize_scope_plan, sanitize_with_regen, CycleFound,
    PruneReason, RemovedEdge, SanitizeError, SanitizeReport,
};
