//! Real-time event types.
//!
//! Every orchestration milestone is broadcast to subscribers of the task
//! through the [`RealtimeChannel`](crate::external::RealtimeChannel)
//! collaborator. The wire form is a tagged JSON envelope so external
//! consumers (WebSocket fan-out, logs) can dispatch on `type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::approval::ApprovalAction;
use crate::story::Verdict;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskStarted {
        task_id: String,
        pipeline: String,
    },
    /// Fractional progress mapped to an orchestration milestone.
    Progress {
        task_id: String,
        percent: u8,
        milestone: String,
    },
    PhaseStarted {
        task_id: String,
        phase: String,
    },
    PhaseCompleted {
        task_id: String,
        phase: String,
        success: bool,
    },
    StoryStarted {
        task_id: String,
        story_id: String,
        index: usize,
        total: usize,
    },
    StoryCompleted {
        task_id: String,
        story_id: String,
        success: bool,
        verdict: Option<Verdict>,
    },
    ApprovalRequested {
        task_id: String,
        phase: String,
        proposed_output: serde_json::Value,
        requested_at: DateTime<Utc>,
    },
    ApprovalResolved {
        task_id: String,
        phase: String,
        action: ApprovalAction,
    },
    PrCreated {
        task_id: String,
        url: String,
    },
    TaskCompleted {
        task_id: String,
        success: bool,
        error: Option<String>,
    },
    /// Terminal queue failure after retries were exhausted.
    JobDeadLettered {
        task_id: String,
        error: String,
    },
}

impl TaskEvent {
    /// Event name as seen by external subscribers.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskStarted { .. } => "task_started",
            Self::Progress { .. } => "progress",
            Self::PhaseStarted { .. } => "phase_started",
            Self::PhaseCompleted { .. } => "phase_completed",
            Self::StoryStarted { .. } => "story_started",
            Self::StoryCompleted { .. } => "story_completed",
            Self::ApprovalRequested { .. } => "approval_requested",
            Self::ApprovalResolved { .. } => "approval_resolved",
            Self::PrCreated { .. } => "pr_created",
            Self::TaskCompleted { .. } => "task_completed",
            Self::JobDeadLettered { .. } => "job_dead_lettered",
        }
    }
}

/// Serialize an event to its wire form, logging instead of failing on the
/// (unreachable in practice) serialization error.
pub fn encode_event(event: &TaskEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::warn!(error = %e, event = event.name(), "Failed to serialize task event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_serialize_with_type_tag() {
        let event = TaskEvent::PhaseCompleted {
            task_id: "t1".into(),
            phase: "Development".into(),
            success: true,
        };
        let json = encode_event(&event).unwrap();
        assert!(json.contains("\"type\":\"phase_completed\""));
        assert!(json.contains("\"task_id\":\"t1\""));
    }

    #[test]
    fn test_event_roundtrip() {
        let event = TaskEvent::Progress {
            task_id: "t1".into(),
            percent: 25,
            milestone: "analysis_complete".into(),
        };
        let json = encode_event(&event).unwrap();
        let parsed: TaskEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            TaskEvent::Progress { percent, .. } => assert_eq!(percent, 25),
            _ => panic!("Expected Progress"),
        }
    }

    #[test]
    fn test_event_names_match_tags() {
        let event = TaskEvent::StoryCompleted {
            task_id: "t1".into(),
            story_id: "s1".into(),
            success: true,
            verdict: Some(Verdict::Approved),
        };
        let json = encode_event(&event).unwrap();
        assert!(json.contains(&format!("\"type\":\"{}\"", event.name())));
    }
}
