//! Jobs and lanes.

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{ApprovalMode, Priority, Repository};

/// A priority-scoped subdivision of the queue with its own concurrency
/// and rate limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LaneKind {
    Normal,
    Elevated,
    /// Strictly sequential lane for source-control write operations —
    /// concurrency is pinned to 1 to avoid write races on a checkout.
    Commit,
}

impl LaneKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Elevated => "elevated",
            Self::Commit => "commit",
        }
    }

    pub fn for_priority(priority: Priority) -> Self {
        match priority {
            Priority::Normal => Self::Normal,
            Priority::Elevated => Self::Elevated,
        }
    }
}

impl std::fmt::Display for LaneKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LaneKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "elevated" => Ok(Self::Elevated),
            "commit" => Ok(Self::Commit),
            _ => Err(format!("Invalid lane: {}", s)),
        }
    }
}

/// What the worker should do with the job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Run the task's pipeline through the orchestrator.
    Orchestrate,
    /// Open a pull request for a finished task (commit lane).
    OpenPullRequest,
}

/// Queue-level lifecycle of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    /// Failed and waiting out its retry delay.
    Backoff,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Backoff => "backoff",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// An in-flight job blocks re-submission of the same task id.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Waiting | Self::Active | Self::Backoff)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a worker needs to execute the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub pipeline: String,
    pub workspace: PathBuf,
    #[serde(default)]
    pub repositories: Vec<Repository>,
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    #[serde(default)]
    pub priority: Priority,
    /// Enqueue a commit-lane follow-up to open a PR after a successful
    /// orchestration.
    #[serde(default)]
    pub open_pr: bool,
}

impl JobPayload {
    pub fn new(pipeline: &str, workspace: impl Into<PathBuf>) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            workspace: workspace.into(),
            repositories: Vec::new(),
            approval_mode: ApprovalMode::Auto,
            priority: Priority::Normal,
            open_pr: false,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_approval_mode(mut self, mode: ApprovalMode) -> Self {
        self.approval_mode = mode;
        self
    }

    pub fn with_open_pr(mut self, open_pr: bool) -> Self {
        self.open_pr = open_pr;
        self
    }
}

/// A queued unit of work. The job id *is* the task id, which makes
/// re-submission of an in-flight task idempotent at the queue level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub payload: JobPayload,
    /// Retry count assigned by the queue; 0 on first submission.
    #[serde(default)]
    pub retries: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn orchestrate(task_id: &str, payload: JobPayload) -> Self {
        Self {
            id: task_id.to_string(),
            kind: JobKind::Orchestrate,
            payload,
            retries: 0,
            enqueued_at: Utc::now(),
        }
    }

    pub fn open_pull_request(task_id: &str, payload: JobPayload) -> Self {
        Self {
            id: task_id.to_string(),
            kind: JobKind::OpenPullRequest,
            payload,
            retries: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// The lane this job dispatches to: source-control work serializes on
    /// the commit lane, everything else follows its priority.
    pub fn lane(&self) -> LaneKind {
        match self.kind {
            JobKind::OpenPullRequest => LaneKind::Commit,
            JobKind::Orchestrate => LaneKind::for_priority(self.payload.priority),
        }
    }
}
