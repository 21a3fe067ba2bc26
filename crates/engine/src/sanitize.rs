// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dependency-graph sanitizer with bounded regeneration.
//!
//! `depends_on` exists only to sequence writers that share ownership. Edges
//! that cannot serve that purpose are pruned with a reason tag; any cycle
//! left afterwards goes through a tiered repair: a deterministic patch first,
//! then a planner handoff via a regen-request sidecar, bounded by the
//! configured attempt budget.

use crate::plan::ScopeEntry;
use serde::Serialize;
use serde_json::{json, Value};
use sf_core::EventSink;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Sanitization failure surfaced to the process exit-code contract.
#[derive(Debug, Error)]
pub enum SanitizeError {
    #[error("sprint scope plan is malformed: {0}")]
    MalformedSprintData(String),
    #[error("dependency cycle detected: {cycles:?}")]
    CycleDetected { cycles: Vec<Vec<i64>> },
    #[error("sanitization regeneration exhausted after {attempts} attempts")]
    RegenExhausted { attempts: u32, history: Vec<Value> },
    #[error("sanitization regeneration handoff requested (attempt {attempt})")]
    RegenHandoffRequested { attempt: u32, history: Vec<Value> },
    #[error("failed to write regen request: {0}")]
    Io(#[from] std::io::Error),
}

impl SanitizeError {
    pub fn exit_code(&self) -> i32 {
        match self {
            SanitizeError::MalformedSprintData(_) | SanitizeError::CycleDetected { .. } => 3,
            SanitizeError::RegenExhausted { .. } => 5,
            SanitizeError::RegenHandoffRequested { .. } => 6,
            SanitizeError::Io(_) => 2,
        }
    }
}

/// Why an edge was pruned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PruneReason {
    #[serde(rename = "DEAD_REF")]
    DeadRef,
    #[serde(rename = "DOC_BLOCKER")]
    DocBlocker,
    #[serde(rename = "NO_OVERLAP")]
    NoOverlap,
}

/// One pruned edge, reason-tagged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemovedEdge {
    pub from: i64,
    pub to: i64,
    pub reason: PruneReason,
}

/// Result of a clean sanitization pass.
#[derive(Debug, Clone)]
pub struct SanitizeReport {
    pub plan: BTreeMap<i64, ScopeEntry>,
    pub removed_edges: Vec<RemovedEdge>,
}

/// A pass that still carries cycles after pruning.
#[derive(Debug, Clone)]
pub struct CycleFound {
    pub report: SanitizeReport,
    /// Each cycle as an ordered walk along `depends_on` edges, starting at
    /// its smallest node.
    pub cycles: Vec<Vec<i64>>,
}

/// Slash-aware path normalization: backslashes become slashes; leading `./`,
/// leading `/`, and trailing `/` are stripped.
pub fn normalize_path(path: &str) -> String {
    let mut normalized = path.trim().replace('\\', "/");
    while let Some(stripped) = normalized.strip_prefix("./") {
        normalized = stripped.to_string();
    }
    normalized.trim_start_matches('/').trim_end_matches('/').to_string()
}

/// Two paths overlap when equal or one is a strict `"<other>/"` prefix.
pub fn paths_overlap(a: &str, b: &str) -> bool {
    let a = normalize_path(a);
    let b = normalize_path(b);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a == b || a.starts_with(&format!("{b}/")) || b.starts_with(&format!("{a}/"))
}

fn is_doc_path(path: &str) -> bool {
    let normalized = normalize_path(path).to_ascii_lowercase();
    normalized.ends_with(".md")
        || normalized.ends_with(".txt")
        || normalized.ends_with(".rst")
        || normalized.starts_with("docs/")
        || normalized.contains("/docs/")
}

/// Doc-only items never block code work. Items with no touch paths are not
/// considered doc-only.
fn is_doc_only(entry: &ScopeEntry) -> bool {
    !entry.touch_paths.is_empty() && entry.touch_paths.iter().all(|p| is_doc_path(p))
}

fn owns_overlap(a: &ScopeEntry, b: &ScopeEntry) -> bool {
    a.owns_paths
        .iter()
        .any(|own_a| b.owns_paths.iter().any(|own_b| paths_overlap(own_a, own_b)))
}

/// Prune meaningless edges, then detect remaining cycles with Tarjan SCC.
pub fn sanitize_scope_plan(
    plan: &BTreeMap<i64, ScopeEntry>,
) -> Result<SanitizeReport, Box<CycleFound>> {
    let mut pruned = plan.clone();
    let mut removed_edges = Vec::new();

    for (&number, entry) in plan {
        let mut kept = Vec::with_capacity(entry.depends_on.len());
        for &dep in &entry.depends_on {
            let reason = match plan.get(&dep) {
                None => Some(PruneReason::DeadRef),
                Some(target) => {
                    if is_doc_only(target) && !is_doc_only(entry) {
                        Some(PruneReason::DocBlocker)
                    } else if !owns_overlap(entry, target) {
                        Some(PruneReason::NoOverlap)
                    } else {
                        None
                    }
                }
            };
            match reason {
                Some(reason) => removed_edges.push(RemovedEdge { from: number, to: dep, reason }),
                None => kept.push(dep),
            }
        }
        if let Some(entry) = pruned.get_mut(&number) {
            entry.depends_on = kept;
        }
    }

    let cycles = find_cycles(&pruned);
    let report = SanitizeReport { plan: pruned, removed_edges };
    if cycles.is_empty() {
        Ok(report)
    } else {
        Err(Box::new(CycleFound { report, cycles }))
    }
}

/// Tarjan strongly-connected components over the `depends_on` graph. SCCs of
/// size >1 and self-loops are cycles, each returned as an ordered edge walk
/// starting at its smallest member.
fn find_cycles(plan: &BTreeMap<i64, ScopeEntry>) -> Vec<Vec<i64>> {
    struct Tarjan<'a> {
        plan: &'a BTreeMap<i64, ScopeEntry>,
        index: BTreeMap<i64, usize>,
        lowlink: BTreeMap<i64, usize>,
        on_stack: BTreeMap<i64, bool>,
        stack: Vec<i64>,
        counter: usize,
        components: Vec<Vec<i64>>,
    }

    impl Tarjan<'_> {
        fn strongconnect(&mut self, v: i64) {
            self.index.insert(v, self.counter);
            self.lowlink.insert(v, self.counter);
            self.counter += 1;
            self.stack.push(v);
            self.on_stack.insert(v, true);

            let deps = self.plan.get(&v).map(|e| e.depends_on.clone()).unwrap_or_default();
            for w in deps {
                if !self.plan.contains_key(&w) {
                    continue;
                }
                if !self.index.contains_key(&w) {
                    self.strongconnect(w);
                    let low = (*self.lowlink.get(&v).unwrap_or(&0))
                        .min(*self.lowlink.get(&w).unwrap_or(&0));
                    self.lowlink.insert(v, low);
                } else if self.on_stack.get(&w).copied().unwrap_or(false) {
                    let low = (*self.lowlink.get(&v).unwrap_or(&0))
                        .min(*self.index.get(&w).unwrap_or(&0));
                    self.lowlink.insert(v, low);
                }
            }

            if self.lowlink.get(&v) == self.index.get(&v) {
                let mut component = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack.insert(w, false);
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                self.components.push(component);
            }
        }
    }

    let mut tarjan = Tarjan {
        plan,
        index: BTreeMap::new(),
        lowlink: BTreeMap::new(),
        on_stack: BTreeMap::new(),
        stack: Vec::new(),
        counter: 0,
        components: Vec::new(),
    };
    for &node in plan.keys() {
        if !tarjan.index.contains_key(&node) {
            tarjan.strongconnect(node);
        }
    }

    let mut cycles = Vec::new();
    for component in tarjan.components {
        if component.len() > 1 {
            cycles.push(order_cycle(plan, &component));
        } else if let Some(&node) = component.first() {
            let self_loop = plan
                .get(&node)
                .map(|e| e.depends_on.contains(&node))
                .unwrap_or(false);
            if self_loop {
                cycles.push(vec![node]);
            }
        }
    }
    cycles.sort();
    cycles
}

/// Order an SCC as an edge walk: start at the smallest member, repeatedly
/// follow the smallest in-component dependency not yet visited.
fn order_cycle(plan: &BTreeMap<i64, ScopeEntry>, component: &[i64]) -> Vec<i64> {
    let members: std::collections::BTreeSet<i64> = component.iter().copied().collect();
    let start = match members.iter().next() {
        Some(&s) => s,
        None => return Vec::new(),
    };
    let mut ordered = vec![start];
    let mut current = start;
    loop {
        let next = plan
            .get(&current)
            .map(|e| {
                let mut candidates: Vec<i64> = e
                    .depends_on
                    .iter()
                    .copied()
                    .filter(|d| members.contains(d) && !ordered.contains(d))
                    .collect();
                candidates.sort_unstable();
                candidates.first().copied()
            })
            .unwrap_or(None);
        match next {
            Some(next) => {
                ordered.push(next);
                current = next;
            }
            None => break,
        }
    }
    ordered
}

/// Attempt 0 repair: break each cycle by dropping its `(last → first)` edge.
fn deterministic_patch(
    plan: &BTreeMap<i64, ScopeEntry>,
    cycles: &[Vec<i64>],
) -> (BTreeMap<i64, ScopeEntry>, Vec<(i64, i64)>) {
    let mut patched = plan.clone();
    let mut removed = Vec::new();
    for cycle in cycles {
        let (Some(&first), Some(&last)) = (cycle.first(), cycle.last()) else {
            continue;
        };
        if let Some(entry) = patched.get_mut(&last) {
            let before = entry.depends_on.len();
            entry.depends_on.retain(|&d| d != first);
            if entry.depends_on.len() < before {
                removed.push((last, first));
            }
        }
    }
    (patched, removed)
}

fn patched_items(plan: &BTreeMap<i64, ScopeEntry>) -> Vec<Value> {
    plan.iter()
        .map(|(&number, entry)| json!({ "number": number, "depends_on": entry.depends_on }))
        .collect()
}

/// Sanitize with the bounded regeneration loop.
///
/// `attempts == 0` disables regeneration entirely: a cycle is returned
/// immediately (exit 3) with no regen events. Attempt 0 applies the
/// deterministic patch; attempts ≥1 hand off to the planner by writing
/// `<state>.regen-request.json` (exit 6). A budget spent without reaching a
/// clean pass is exhaustion (exit 5).
pub fn sanitize_with_regen(
    plan: &BTreeMap<i64, ScopeEntry>,
    previous_plan_raw: Option<&Value>,
    attempts: u32,
    state_path: &Path,
    events: &dyn EventSink,
) -> Result<SanitizeReport, SanitizeError> {
    if attempts == 0 {
        return match sanitize_scope_plan(plan) {
            Ok(report) => Ok(report),
            Err(found) => Err(SanitizeError::CycleDetected { cycles: found.cycles }),
        };
    }

    let mut history: Vec<Value> = Vec::new();
    let mut current = plan.clone();

    for attempt in 0..attempts {
        match sanitize_scope_plan(&current) {
            Ok(report) => {
                if attempt > 0 {
                    events.emit(json!({
                        "type": "sanitization_regen_succeeded",
                        "attempts": attempt,
                        "history": history,
                    }));
                }
                return Ok(report);
            }
            Err(found) => {
                if attempt == 0 {
                    let (patched, removed) = deterministic_patch(&current, &found.cycles);
                    let edges: Vec<Value> =
                        removed.iter().map(|(f, t)| json!({ "from": f, "to": t })).collect();
                    history.push(json!({
                        "tier": "DETERMINISTIC_PATCH",
                        "attempt": 0,
                        "edges_removed": edges,
                        "patched_items": patched_items(&patched),
                    }));
                    if removed.is_empty() {
                        break;
                    }
                    current = patched;
                } else {
                    write_regen_request(
                        state_path,
                        previous_plan_raw,
                        &found.report,
                        &found.cycles,
                        &history,
                    )?;
                    history.push(json!({ "tier": "PLANNER_REGEN", "attempt": attempt }));
                    events.emit(json!({
                        "type": "sanitization_regen_handoff_requested",
                        "attempt": attempt,
                        "history": history,
                    }));
                    return Err(SanitizeError::RegenHandoffRequested { attempt, history });
                }
            }
        }
    }

    match sanitize_scope_plan(&current) {
        Ok(report) => {
            events.emit(json!({
                "type": "sanitization_regen_succeeded",
                "attempts": attempts,
                "history": history,
            }));
            Ok(report)
        }
        Err(found) => {
            history.push(json!({
                "tier": "FINAL_SANITIZATION_FAILED",
                "cycles": found.cycles,
            }));
            events.emit(json!({
                "type": "sanitization_regen_exhausted",
                "attempts": attempts,
                "history": history,
            }));
            Err(SanitizeError::RegenExhausted { attempts, history })
        }
    }
}

/// Sidecar handing the unrepaired plan back to the planner.
fn write_regen_request(
    state_path: &Path,
    previous_plan_raw: Option<&Value>,
    report: &SanitizeReport,
    cycles: &[Vec<i64>],
    history: &[Value],
) -> Result<(), std::io::Error> {
    let mut name = state_path.as_os_str().to_os_string();
    name.push(".regen-request.json");
    let request = json!({
        "previous_plan": previous_plan_raw.cloned().unwrap_or(Value::Null),
        "sanitization_report": {
            "removed_edges": report.removed_edges,
            "plan": patched_items(&report.plan),
        },
        "cycle_error": { "cycles": cycles },
        "history": history,
    });
    let mut payload = serde_json::to_string_pretty(&request).unwrap_or_default();
    payload.push('\n');
    std::fs::write(std::path::PathBuf::from(name), payload)
}

#[cfg(test)]
#[path = "sanitize_tests.rs"]
mod tests;
