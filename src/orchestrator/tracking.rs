//! Per-task execution tracking.
//!
//! Counters and accumulated vulnerabilities are scoped to an explicit
//! store owned by the orchestrator and released when the task reaches a
//! terminal state, so nothing leaks across tasks.

use dashmap::DashMap;

use crate::phase::Vulnerability;

/// Counters accumulated while a task executes.
#[derive(Debug, Clone, Default)]
pub struct TaskTracking {
    pub phases_completed: u32,
    pub tool_calls: u32,
    pub vulnerabilities: Vec<Vulnerability>,
}

/// Store of in-flight task tracking, keyed by task id.
#[derive(Default)]
pub struct TrackingStore {
    inner: DashMap<String, TaskTracking>,
}

impl TrackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_phase_completed(&self, task_id: &str) {
        self.inner.entry(task_id.to_string()).or_default().phases_completed += 1;
    }

    pub fn record_tool_calls(&self, task_id: &str, count: u32) {
        self.inner.entry(task_id.to_string()).or_default().tool_calls += count;
    }

    pub fn record_vulnerabilities(&self, task_id: &str, vulnerabilities: &[Vulnerability]) {
        if vulnerabilities.is_empty() {
            return;
        }
        self.inner
            .entry(task_id.to_string())
            .or_default()
            .vulnerabilities
            .extend_from_slice(vulnerabilities);
    }

    pub fn snapshot(&self, task_id: &str) -> Option<TaskTracking> {
        self.inner.get(task_id).map(|t| t.clone())
    }

    /// Remove and return the tracking entry for a finished task. Must be
    /// called on every terminal transition.
    pub fn release(&self, task_id: &str) -> Option<TaskTracking> {
        self.inner.remove(task_id).map(|(_, t)| t)
    }

    /// Number of tasks currently tracked. Zero between executions.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
