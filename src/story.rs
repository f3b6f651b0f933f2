//! Story domain model.
//!
//! A story is an independently implementable unit of work produced by the
//! Analysis phase. Stories live for the duration of one task execution and
//! are carried in the task's output payload afterwards; they are not
//! first-class persisted entities.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::phase::{PhaseResult, Severity};

/// Lifecycle status of a story within the story loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid story status: {}", s)),
        }
    }
}

/// Review outcome for a story.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    Rejected,
    NeedsRevision,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::NeedsRevision => "needs_revision",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "needs_revision" => Ok(Self::NeedsRevision),
            _ => Err(format!("Invalid verdict: {}", s)),
        }
    }
}

/// A single issue raised by the review phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIssue {
    #[serde(default = "default_issue_severity")]
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

fn default_issue_severity() -> Severity {
    Severity::Medium
}

/// The parsed output of a Judge run for one story.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewAssessment {
    pub verdict: Verdict,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
}

/// An independently implementable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub status: StoryStatus,
    /// Files this story is expected to touch.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Set once the story has been reviewed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
}

impl Story {
    pub fn new(title: &str, description: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            description: description.to_string(),
            status: StoryStatus::Pending,
            files: Vec::new(),
            acceptance_criteria: Vec::new(),
            verdict: None,
        }
    }
}

/// Per-story outcome: the phase results that produced it plus the final
/// verdict. The original review assessment is kept alongside the final
/// verdict so a post-fix upgrade stays auditable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryResult {
    pub story_id: String,
    pub title: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_verdict: Option<Verdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assessment: Option<ReviewAssessment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub development: Option<PhaseResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<PhaseResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix: Option<PhaseResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StoryResult {
    pub fn failed(story: &Story, error: &str) -> Self {
        Self {
            story_id: story.id.clone(),
            title: story.title.clone(),
            success: false,
            final_verdict: None,
            assessment: None,
            development: None,
            review: None,
            fix: None,
            error: Some(error.to_string()),
        }
    }
}
