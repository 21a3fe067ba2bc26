// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Operator event stream.
//!
//! The supervisor's stderr is a protocol surface: one JSON object per line,
//! consumed by operators and by the process that launched us. Production code
//! writes through [`StderrSink`]; tests capture events with [`MemorySink`].

use serde_json::Value;
use std::io::Write;

/// Destination for operator-facing JSONL events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Value);
}

/// Writes compact JSON lines to stderr. Emission failures are ignored; the
/// event stream is not a reliability boundary.
#[derive(Debug, Default, Clone)]
pub struct StderrSink;

impl EventSink for StderrSink {
    fn emit(&self, event: Value) {
        let mut stderr = std::io::stderr().lock();
        let _ = serde_json::to_writer(&mut stderr, &event);
        let _ = stderr.write_all(b"\n");
        let _ = stderr.flush();
    }
}

/// Collects events in memory for assertions.
#[cfg(any(test, feature = "test-support"))]
#[derive(Debug, Default)]
pub struct MemorySink {
    events: parking_lot::Mutex<Vec<Value>>,
}

#[cfg(any(test, feature = "test-support"))]
impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events emitted so far.
    pub fn snapshot(&self) -> Vec<Value> {
        self.events.lock().clone()
    }

    /// Events whose `type` field equals `kind`.
    pub fn of_type(&self, kind: &str) -> Vec<Value> {
        self.snapshot()
            .into_iter()
            .filter(|e| e.get("type").and_then(Value::as_str) == Some(kind))
            .collect()
    }
}

#[cfg(any(test, feature = "test-support"))]
impl EventSink for MemorySink {
    fn emit(&self, event: Value) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
