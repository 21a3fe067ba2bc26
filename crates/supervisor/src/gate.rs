// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-issue serialization gate.
//!
//! One map plus one notifier, not a lock per issue: memory stays bounded and
//! wakeups are coarse. At most one run (executor or reviewer) holds an
//! issue's slot at a time; reviewer and executor runs therefore serialize.
//! Waiters report head-of-line blocking every five seconds.

use parking_lot::Mutex;
use serde_json::json;
use sf_core::{EventSink, Role};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

const WAIT_DIAGNOSTIC_EVERY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct SlotOwner {
    run_id: String,
    role: Role,
}

/// Issue-keyed in-flight slots.
#[derive(Default)]
pub struct IssueGate {
    slots: Mutex<HashMap<i64, SlotOwner>>,
    released: Notify,
}

impl IssueGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the issue's slot is free or already owned by this run.
    pub async fn reserve(&self, issue_number: i64, run_id: &str, role: Role, events: &dyn EventSink) {
        let started = Instant::now();
        loop {
            // Arm the wakeup before checking so a release between the check
            // and the await is never lost.
            let released = self.released.notified();
            {
                let mut slots = self.slots.lock();
                match slots.get(&issue_number) {
                    None => {
                        slots.insert(
                            issue_number,
                            SlotOwner { run_id: run_id.to_string(), role },
                        );
                        return;
                    }
                    Some(owner) if owner.run_id == run_id => return,
                    Some(_) => {}
                }
            }
            if tokio::time::timeout(WAIT_DIAGNOSTIC_EVERY, released).await.is_err() {
                let holder = {
                    let slots = self.slots.lock();
                    slots
                        .get(&issue_number)
                        .map(|owner| json!({"run_id": owner.run_id, "role": owner.role.as_str()}))
                };
                events.emit(json!({
                    "type": "WORKER_WAITING",
                    "issue_number": issue_number,
                    "run_id": run_id,
                    "role": role.as_str(),
                    "waited_s": started.elapsed().as_secs(),
                    "holder": holder,
                }));
            }
        }
    }

    /// Release the slot if this run holds it, waking all waiters.
    pub fn release(&self, issue_number: i64, run_id: &str) {
        {
            let mut slots = self.slots.lock();
            let held_by_caller = slots
                .get(&issue_number)
                .map(|owner| owner.run_id == run_id)
                .unwrap_or(false);
            if held_by_caller {
                slots.remove(&issue_number);
            }
        }
        self.released.notify_waiters();
    }

    /// Current holder's run id, for diagnostics.
    pub fn holder(&self, issue_number: i64) -> Option<String> {
        self.slots.lock().get(&issue_number).map(|owner| owner.run_id.clone())
    }
}

#[cfg(test)]
#[path = "gate_tests.rs"]
mod tests;
