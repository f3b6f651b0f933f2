//! The human approval gate.
//!
//! A pending approval is a suspended computation: `request_approval`
//! parks the caller on a oneshot until an external actor resolves the
//! request. By design there is no default timeout — a human decision must
//! never be silently bypassed — so a deadline exists only when the caller
//! explicitly arms one. Pending entries are keyed `task:phase` and held in
//! a store owned by the gate instance, reclaimed on resolution or task
//! cancellation.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::errors::ApprovalError;
use crate::events::TaskEvent;
use crate::external::RealtimeChannel;

/// What the human decided.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Approve,
    Reject,
    /// Loop back into the same phase with added context instead of a
    /// binary accept/reject.
    RequestChanges,
}

impl ApprovalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::RequestChanges => "request_changes",
        }
    }
}

impl std::fmt::Display for ApprovalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            "request_changes" => Ok(Self::RequestChanges),
            _ => Err(format!("Invalid approval action: {}", s)),
        }
    }
}

/// The human's decision plus optional free-text feedback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub action: ApprovalAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl ApprovalResponse {
    pub fn approve() -> Self {
        Self {
            action: ApprovalAction::Approve,
            feedback: None,
        }
    }

    pub fn reject(feedback: Option<&str>) -> Self {
        Self {
            action: ApprovalAction::Reject,
            feedback: feedback.map(String::from),
        }
    }

    pub fn request_changes(feedback: &str) -> Self {
        Self {
            action: ApprovalAction::RequestChanges,
            feedback: Some(feedback.to_string()),
        }
    }
}

/// A request waiting on a human, keyed by (task, phase).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub task_id: String,
    pub phase: String,
    pub proposed_output: serde_json::Value,
    pub requested_at: DateTime<Utc>,
}

struct PendingEntry {
    request: ApprovalRequest,
    tx: oneshot::Sender<ApprovalResponse>,
}

pub struct ApprovalGate {
    pending: DashMap<String, PendingEntry>,
    channel: Arc<dyn RealtimeChannel>,
}

fn key(task_id: &str, phase: &str) -> String {
    format!("{}:{}", task_id, phase)
}

impl ApprovalGate {
    pub fn new(channel: Arc<dyn RealtimeChannel>) -> Self {
        Self {
            pending: DashMap::new(),
            channel,
        }
    }

    /// Park until an external actor resolves the request.
    ///
    /// At most one request may be pending per (task, phase); a second
    /// request while the first is live is a caller bug and errors out.
    /// With `timeout == None` this waits indefinitely.
    pub async fn request_approval(
        &self,
        task_id: &str,
        phase: &str,
        proposed_output: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<ApprovalResponse, ApprovalError> {
        let request = ApprovalRequest {
            task_id: task_id.to_string(),
            phase: phase.to_string(),
            proposed_output,
            requested_at: Utc::now(),
        };

        let (tx, rx) = oneshot::channel();
        match self.pending.entry(key(task_id, phase)) {
            Entry::Occupied(_) => {
                return Err(ApprovalError::AlreadyPending {
                    task_id: task_id.to_string(),
                    phase: phase.to_string(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingEntry {
                    request: request.clone(),
                    tx,
                });
            }
        }

        self.announce(&request);
        tracing::info!(task_id, phase, "Waiting for approval");

        let response = match timeout {
            None => rx.await,
            Some(deadline) => match tokio::time::timeout(deadline, rx).await {
                Ok(response) => response,
                Err(_) => {
                    self.pending.remove(&key(task_id, phase));
                    return Err(ApprovalError::Timeout {
                        task_id: task_id.to_string(),
                        phase: phase.to_string(),
                    });
                }
            },
        };

        response.map_err(|_| ApprovalError::Abandoned {
            task_id: task_id.to_string(),
            phase: phase.to_string(),
        })
    }

    /// Resolve a pending request. Returns false when no matching request
    /// exists (stale or already resolved) — each request resolves exactly
    /// once.
    pub fn resolve(&self, task_id: &str, phase: &str, response: ApprovalResponse) -> bool {
        let Some((_, entry)) = self.pending.remove(&key(task_id, phase)) else {
            return false;
        };
        let action = response.action;
        // A dropped receiver means the waiter went away; nothing to do.
        let _ = entry.tx.send(response);
        self.channel.to_task(
            task_id,
            TaskEvent::ApprovalResolved {
                task_id: task_id.to_string(),
                phase: phase.to_string(),
                action,
            },
        );
        tracing::info!(task_id, phase, action = %action, "Approval resolved");
        true
    }

    /// Re-announce every pending request for a task without touching the
    /// pending store. Used when the real-time channel reconnects so
    /// subscribers see outstanding requests again — no duplicate keys are
    /// created.
    pub fn reannounce(&self, task_id: &str) {
        for entry in self.pending.iter() {
            if entry.value().request.task_id == task_id {
                self.announce(&entry.value().request);
            }
        }
    }

    /// Reject and clear every pending request for a task. Used on task
    /// cancellation.
    pub fn cancel_task(&self, task_id: &str) -> usize {
        let keys: Vec<String> = self
            .pending
            .iter()
            .filter(|e| e.value().request.task_id == task_id)
            .map(|e| e.key().clone())
            .collect();

        let mut cleared = 0;
        for k in keys {
            if let Some((_, entry)) = self.pending.remove(&k) {
                let _ = entry
                    .tx
                    .send(ApprovalResponse::reject(Some("Task cancelled")));
                cleared += 1;
            }
        }
        if cleared > 0 {
            tracing::info!(task_id, cleared, "Cleared pending approvals on cancel");
        }
        cleared
    }

    /// Snapshot of all pending requests, for the control surface and for
    /// external sweeps of abandoned entries.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        self.pending.iter().map(|e| e.value().request.clone()).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn announce(&self, request: &ApprovalRequest) {
        self.channel.to_task(
            &request.task_id,
            TaskEvent::ApprovalRequested {
                task_id: request.task_id.clone(),
                phase: request.phase.clone(),
                proposed_output: request.proposed_output.clone(),
                requested_at: request.requested_at,
            },
        );
    }
}
