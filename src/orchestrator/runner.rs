//! The orchestrator: runs a named pipeline end-to-end for one task.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::approval::{ApprovalAction, ApprovalGate};
use crate::errors::OrchestratorError;
use crate::events::TaskEvent;
use crate::external::{
    AgentRuntime, ExportSink, RealtimeChannel, SecurityScanner, SourceControl, TaskStore,
};
use crate::orchestrator::stories::run_story_loop;
use crate::orchestrator::{ExecutionContext, TrackingStore};
use crate::phase::{PhaseExecutor, PhaseResult, PhaseRole, PhaseSpec};
use crate::pipeline::PipelineRegistry;
use crate::story::{Story, StoryResult};
use crate::task::{ApprovalMode, TaskStatus};

/// Progress checkpoints reported to the worker's progress hook, each with
/// a fixed fractional-progress mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    Started,
    AnalysisComplete,
    DevelopmentComplete,
    PrCreated,
    Finished,
}

impl Milestone {
    pub fn percent(&self) -> u8 {
        match self {
            Self::Started => 5,
            Self::AnalysisComplete => 25,
            Self::DevelopmentComplete => 60,
            Self::PrCreated => 80,
            Self::Finished => 100,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::AnalysisComplete => "analysis_complete",
            Self::DevelopmentComplete => "development_complete",
            Self::PrCreated => "pr_created",
            Self::Finished => "finished",
        }
    }
}

impl std::fmt::Display for Milestone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives milestone callbacks during an execution. Workers install one
/// to relay progress to the task's real-time channel.
pub trait ProgressHook: Send + Sync {
    fn on_milestone(&self, task_id: &str, milestone: Milestone);
}

/// Per-call execution options.
#[derive(Clone)]
pub struct ExecuteOptions {
    pub workspace: PathBuf,
    pub approval_mode: ApprovalMode,
    /// Deadline for each approval wait. `None` (the default) waits
    /// indefinitely — human decisions are never silently bypassed.
    pub approval_timeout: Option<Duration>,
    pub progress: Option<Arc<dyn ProgressHook>>,
}

impl ExecuteOptions {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            approval_mode: ApprovalMode::Auto,
            approval_timeout: None,
            progress: None,
        }
    }

    pub fn with_approval_mode(mut self, mode: ApprovalMode) -> Self {
        self.approval_mode = mode;
        self
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = Some(timeout);
        self
    }

    pub fn with_progress(mut self, hook: Arc<dyn ProgressHook>) -> Self {
        self.progress = Some(hook);
        self
    }
}

/// Terminal output of one `execute` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationResult {
    pub success: bool,
    pub task_id: String,
    pub pipeline: String,
    pub phase_results: HashMap<String, PhaseResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_results: Option<Vec<StoryResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration: Duration,
}

/// Outcome of one gated phase transition.
enum GateOutcome {
    Proceed(PhaseResult),
    Abort(String),
}

pub struct Orchestrator {
    store: Arc<dyn TaskStore>,
    registry: Arc<PipelineRegistry>,
    executor: PhaseExecutor,
    gate: Arc<ApprovalGate>,
    channel: Arc<dyn RealtimeChannel>,
    export: Option<Arc<dyn ExportSink>>,
    scm: Arc<dyn SourceControl>,
    tracking: Arc<TrackingStore>,
    cancels: DashMap<String, CancellationToken>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<PipelineRegistry>,
        runtime: Arc<dyn AgentRuntime>,
        scanner: Arc<dyn SecurityScanner>,
        channel: Arc<dyn RealtimeChannel>,
        scm: Arc<dyn SourceControl>,
    ) -> Self {
        let tracking = Arc::new(TrackingStore::new());
        let executor = PhaseExecutor::new(runtime, scanner, Arc::clone(&tracking));
        let gate = Arc::new(ApprovalGate::new(Arc::clone(&channel)));
        Self {
            store,
            registry,
            executor,
            gate,
            channel,
            export: None,
            scm,
            tracking,
            cancels: DashMap::new(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.executor = self.executor.with_max_retries(max_retries);
        self
    }

    /// Enable the fire-and-forget ML-export push on task completion.
    pub fn with_export(mut self, sink: Arc<dyn ExportSink>) -> Self {
        self.export = Some(sink);
        self
    }

    /// The approval gate, exposed so the control surface can resolve and
    /// re-announce pending requests.
    pub fn gate(&self) -> Arc<ApprovalGate> {
        Arc::clone(&self.gate)
    }

    /// Per-task tracking store (counters, accumulated vulnerabilities).
    /// Empty between executions.
    pub fn tracking(&self) -> Arc<TrackingStore> {
        Arc::clone(&self.tracking)
    }

    /// Cancel a running task: aborts the active agent call at the next
    /// suspension point and rejects any pending approvals.
    pub fn cancel(&self, task_id: &str) {
        if let Some(token) = self.cancels.get(task_id) {
            token.cancel();
        }
        self.gate.cancel_task(task_id);
        tracing::info!(task_id, "Cancellation requested");
    }

    /// Run the named pipeline end-to-end for a task.
    ///
    /// Domain failures (a phase failed, the user rejected an output, a
    /// story count came up short) are reported inside the returned
    /// `OrchestrationResult`; only infrastructure faults — the task store
    /// being unreachable — surface as `Err`, so the queue tier can retry
    /// them without masking phase-level errors.
    pub async fn execute(
        &self,
        task_id: &str,
        pipeline_name: &str,
        options: ExecuteOptions,
    ) -> Result<OrchestrationResult, OrchestratorError> {
        let started = Instant::now();

        let task = self
            .store
            .find_task(task_id)
            .await
            .map_err(|e| OrchestratorError::TaskLoadFailed {
                id: task_id.to_string(),
                source: e,
            })?;
        let Some(task) = task else {
            return Ok(self.immediate_failure(
                task_id,
                pipeline_name,
                format!("Task not found: {}", task_id),
                started,
            ));
        };

        let Some(pipeline) = self.registry.get(pipeline_name) else {
            let error = format!("Pipeline not found: {}", pipeline_name);
            self.persist_terminal(task_id, TaskStatus::Failed, Some(error.clone()))
                .await;
            return Ok(self.immediate_failure(task_id, pipeline_name, error, started));
        };

        self.store
            .update_status(task_id, TaskStatus::Running, None, None)
            .await
            .map_err(|e| OrchestratorError::StatusUpdateFailed {
                id: task_id.to_string(),
                status: TaskStatus::Running.to_string(),
                source: e,
            })?;

        let mut ctx = ExecutionContext::new(
            task,
            pipeline_name,
            pipeline.phase_names(),
            options.workspace.clone(),
        );
        self.cancels.insert(task_id.to_string(), ctx.cancel.clone());

        self.channel.to_task(
            task_id,
            TaskEvent::TaskStarted {
                task_id: task_id.to_string(),
                pipeline: pipeline_name.to_string(),
            },
        );
        self.milestone(&options, task_id, Milestone::Started);
        tracing::info!(task_id, pipeline = pipeline_name, "Orchestration started");

        let mut error: Option<String> = None;
        let mut story_results: Option<Vec<StoryResult>> = None;

        // Analysis runs first when the pipeline carries one; its stories
        // decide whether the story loop takes over.
        if let Some(analysis) = pipeline.find_role(PhaseRole::Analysis) {
            match self.run_phase_gated(analysis.as_ref(), &mut ctx, &options).await {
                GateOutcome::Abort(reason) => error = Some(reason),
                GateOutcome::Proceed(result) if !result.success => {
                    error = Some(
                        result
                            .error
                            .unwrap_or_else(|| "Analysis failed".to_string()),
                    );
                }
                GateOutcome::Proceed(result) => {
                    ctx.vars.stories = parse_stories(&result);
                    self.milestone(&options, task_id, Milestone::AnalysisComplete);
                }
            }
        }

        if error.is_none() && !ctx.is_cancelled() {
            if !ctx.vars.stories.is_empty() && pipeline.has_role(PhaseRole::Development) {
                let results =
                    run_story_loop(&self.executor, &self.scm, &self.channel, &pipeline, &mut ctx)
                        .await;
                let failed = results.iter().filter(|r| !r.success).count();
                if failed > 0 {
                    error = Some(format!("{} stories failed", failed));
                }
                story_results = Some(results);
                self.milestone(&options, task_id, Milestone::DevelopmentComplete);
            } else {
                for phase in pipeline.phases() {
                    if phase.role() == PhaseRole::Analysis {
                        continue;
                    }
                    if ctx.is_cancelled() {
                        break;
                    }
                    match self.run_phase_gated(phase.as_ref(), &mut ctx, &options).await {
                        GateOutcome::Abort(reason) => {
                            error = Some(reason);
                            break;
                        }
                        GateOutcome::Proceed(result) if !result.success => {
                            error = Some(
                                result
                                    .error
                                    .unwrap_or_else(|| format!("{} failed", phase.name())),
                            );
                            break;
                        }
                        GateOutcome::Proceed(_) => {
                            if phase.role() == PhaseRole::Development {
                                self.milestone(&options, task_id, Milestone::DevelopmentComplete);
                            }
                        }
                    }
                }
            }
        }

        let cancelled = ctx.is_cancelled();
        if cancelled && error.is_none() {
            error = Some("Task cancelled".to_string());
        }
        let success = error.is_none();
        let status = if cancelled {
            TaskStatus::Cancelled
        } else if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };

        self.persist_terminal(task_id, status, error.clone()).await;
        self.channel.to_task(
            task_id,
            TaskEvent::TaskCompleted {
                task_id: task_id.to_string(),
                success,
                error: error.clone(),
            },
        );

        // Fire-and-forget: export failures are logged, never surfaced.
        if let Some(export) = &self.export {
            let export = Arc::clone(export);
            let id = task_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = export.push(&id).await {
                    tracing::warn!(task_id = %id, error = %format!("{:#}", e), "Export push failed");
                }
            });
        }

        // Release per-task state so nothing leaks across tasks.
        self.tracking.release(task_id);
        self.cancels.remove(task_id);

        self.milestone(&options, task_id, Milestone::Finished);
        tracing::info!(task_id, success, status = %status, "Orchestration finished");

        Ok(OrchestrationResult {
            success,
            task_id: task_id.to_string(),
            pipeline: pipeline_name.to_string(),
            phase_results: std::mem::take(&mut ctx.results),
            story_results,
            error,
            duration: started.elapsed(),
        })
    }

    /// Run one phase and, in manual mode, hold its successful output at
    /// the approval gate. `request_changes` loops back into the same
    /// phase with the feedback exposed through the context.
    async fn run_phase_gated(
        &self,
        phase: &dyn PhaseSpec,
        ctx: &mut ExecutionContext,
        options: &ExecuteOptions,
    ) -> GateOutcome {
        loop {
            self.channel.to_task(
                &ctx.task.id,
                TaskEvent::PhaseStarted {
                    task_id: ctx.task.id.clone(),
                    phase: phase.name().to_string(),
                },
            );

            let result = self.executor.run(phase, ctx).await;
            ctx.record_result(phase.name(), result.clone());
            self.channel.to_task(
                &ctx.task.id,
                TaskEvent::PhaseCompleted {
                    task_id: ctx.task.id.clone(),
                    phase: phase.name().to_string(),
                    success: result.success,
                },
            );

            if !result.success || options.approval_mode != ApprovalMode::Manual {
                return GateOutcome::Proceed(result);
            }

            let response = self
                .gate
                .request_approval(
                    &ctx.task.id,
                    phase.name(),
                    result.output.clone(),
                    options.approval_timeout,
                )
                .await;

            match response {
                Ok(response) => match response.action {
                    ApprovalAction::Approve => return GateOutcome::Proceed(result),
                    ApprovalAction::Reject => {
                        return GateOutcome::Abort("User rejected phase output".to_string());
                    }
                    ApprovalAction::RequestChanges => {
                        ctx.vars.feedback.insert(
                            phase.name().to_string(),
                            response.feedback.unwrap_or_default(),
                        );
                        tracing::info!(task_id = %ctx.task.id, phase = phase.name(),
                            "Changes requested, re-running phase");
                    }
                },
                Err(e) => return GateOutcome::Abort(e.to_string()),
            }
        }
    }

    fn immediate_failure(
        &self,
        task_id: &str,
        pipeline: &str,
        error: String,
        started: Instant,
    ) -> OrchestrationResult {
        tracing::error!(task_id, pipeline, error = %error, "Orchestration failed fast");
        OrchestrationResult {
            success: false,
            task_id: task_id.to_string(),
            pipeline: pipeline.to_string(),
            phase_results: HashMap::new(),
            story_results: None,
            error: Some(error),
            duration: started.elapsed(),
        }
    }

    /// Terminal status writes are best-effort here: the worker persists
    /// the full result payload with its own error propagation.
    async fn persist_terminal(&self, task_id: &str, status: TaskStatus, error: Option<String>) {
        if let Err(e) = self.store.update_status(task_id, status, None, error).await {
            tracing::warn!(task_id, status = %status, error = %format!("{:#}", e),
                "Failed to persist terminal task status");
        }
    }

    fn milestone(&self, options: &ExecuteOptions, task_id: &str, milestone: Milestone) {
        if let Some(hook) = &options.progress {
            hook.on_milestone(task_id, milestone);
        }
    }
}

fn parse_stories(result: &PhaseResult) -> Vec<Story> {
    result
        .output
        .get("stories")
        .and_then(|stories| serde_json::from_value::<Vec<Story>>(stories.clone()).ok())
        .unwrap_or_default()
}
