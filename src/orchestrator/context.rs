//! Shared execution context for one orchestration run.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use crate::phase::PhaseResult;
use crate::story::{ReviewAssessment, Story};
use crate::task::{Repository, Task};

/// The story currently being driven through the loop, exposed to phases
/// together with its position so prompts can say "story 2 of 5".
#[derive(Debug, Clone)]
pub struct StoryCursor {
    pub story: Story,
    pub index: usize,
    pub total: usize,
}

/// Mutable cross-phase variable store.
///
/// The frequently-used slots (stories, the active story, the latest review)
/// are typed; anything else goes through `extra`.
#[derive(Debug, Clone, Default)]
pub struct ContextVars {
    /// Stories produced by the Analysis phase, in analysis order.
    pub stories: Vec<Story>,
    pub current_story: Option<StoryCursor>,
    /// Latest review assessment, read by the Fix phase.
    pub review: Option<ReviewAssessment>,
    /// Human feedback from a `request_changes` approval, keyed by phase.
    pub feedback: HashMap<String, String>,
    pub extra: HashMap<String, serde_json::Value>,
}

/// Per-execution shared state: the task, its workspace, the results map,
/// and the variable store. Owned mutably by the orchestrator; phases see
/// it read-only.
pub struct ExecutionContext {
    pub task: Task,
    pub pipeline: String,
    /// Names of the phases in the running pipeline, used for predecessor
    /// checks (a pipeline that omits a predecessor waives the check).
    pub pipeline_phases: Vec<String>,
    pub workspace: PathBuf,
    pub repositories: Vec<Repository>,
    /// Results keyed by phase name. Within the story loop each story's
    /// run overwrites the previous story's entry for that phase.
    pub results: HashMap<String, PhaseResult>,
    pub vars: ContextVars,
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(task: Task, pipeline: &str, pipeline_phases: Vec<String>, workspace: PathBuf) -> Self {
        let repositories = task.repositories.clone();
        Self {
            task,
            pipeline: pipeline.to_string(),
            pipeline_phases,
            workspace,
            repositories,
            results: HashMap::new(),
            vars: ContextVars::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn record_result(&mut self, phase: &str, result: PhaseResult) {
        self.results.insert(phase.to_string(), result);
    }

    pub fn result(&self, phase: &str) -> Option<&PhaseResult> {
        self.results.get(phase)
    }

    /// Whether the named phase has produced a successful result.
    pub fn succeeded(&self, phase: &str) -> bool {
        self.results.get(phase).is_some_and(|r| r.success)
    }

    /// Whether the named phase is part of the running pipeline.
    pub fn pipeline_contains(&self, phase: &str) -> bool {
        self.pipeline_phases.iter().any(|p| p == phase)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Feedback attached to the given phase by a `request_changes`
    /// approval, if any.
    pub fn feedback_for(&self, phase: &str) -> Option<&str> {
        self.vars.feedback.get(phase).map(String::as_str)
    }
}
