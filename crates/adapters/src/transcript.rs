// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Best-effort transcript streaming to the backend.
//!
//! A bounded queue feeds one sender task. Fresh events are worth more than a
//! stale backlog, so an enqueue that would exceed the cap evicts the oldest
//! entry first. Post failures are swallowed; this sink is not a reliability
//! boundary.

use crate::backend::BackendApi;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const QUEUE_CAP: usize = 1024;

struct Inner {
    queue: Mutex<VecDeque<Value>>,
    notify: Notify,
    closed: AtomicBool,
    cap: usize,
}

/// Owning side of the transcript stream; holds the sender task.
pub struct TranscriptSink {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TranscriptSink {
    /// Start the sender task against the given backend.
    pub fn start(backend: Arc<dyn BackendApi>) -> Self {
        Self::start_with_cap(backend, QUEUE_CAP)
    }

    pub fn start_with_cap(backend: Arc<dyn BackendApi>, cap: usize) -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            cap: cap.max(1),
        });
        let sender_inner = Arc::clone(&inner);
        let task = tokio::spawn(async move {
            loop {
                let next = sender_inner.queue.lock().pop_front();
                match next {
                    Some(event) => {
                        if let Err(e) = backend.post_transcript_event(event).await {
                            tracing::debug!(error = %e, "transcript post dropped");
                        }
                    }
                    None => {
                        if sender_inner.closed.load(Ordering::Acquire) {
                            break;
                        }
                        sender_inner.notify.notified().await;
                    }
                }
            }
        });
        Self { inner, task: Mutex::new(Some(task)) }
    }

    /// Handle for producers. Cheap to clone; never blocks.
    pub fn handle(&self) -> TranscriptHandle {
        TranscriptHandle { inner: Some(Arc::clone(&self.inner)), run_id: None }
    }

    /// Stop accepting events and drain what is already queued.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Producer handle. A disabled handle (no backend configured) drops events
/// silently.
#[derive(Clone, Default)]
pub struct TranscriptHandle {
    inner: Option<Arc<Inner>>,
    run_id: Option<String>,
}

impl TranscriptHandle {
    /// Handle that drops everything; used when no backend client exists.
    pub fn disabled() -> Self {
        Self { inner: None, run_id: None }
    }

    /// A copy of this handle that stamps `run_id` onto every event.
    pub fn bind(&self, run_id: &str) -> TranscriptHandle {
        TranscriptHandle { inner: self.inner.clone(), run_id: Some(run_id.to_string()) }
    }

    /// Enqueue an event, evicting the oldest entry when the queue is full.
    pub fn publish(&self, mut event: Value) {
        let Some(inner) = &self.inner else {
            return;
        };
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        if let (Some(run_id), Some(map)) = (&self.run_id, event.as_object_mut()) {
            map.entry("run_id").or_insert_with(|| Value::String(run_id.clone()));
        }
        {
            let mut queue = inner.queue.lock();
            while queue.len() >= inner.cap {
                queue.pop_front();
            }
            queue.push_back(event);
        }
        inner.notify.notify_one();
    }
}

#[cfg(test)]
#[path = "transcript_tests.rs"]
mod tests;
