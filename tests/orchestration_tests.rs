//! Integration tests for Cadence
//!
//! These drive the orchestrator, approval gate, story loop, and job queue
//! together over in-memory collaborators, plus a few CLI checks.

use std::sync::Arc;
use std::time::Duration;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

use cadence::approval::{ApprovalAction, ApprovalResponse};
use cadence::events::TaskEvent;
use cadence::external::{
    InMemoryTaskStore, NullSourceControl, RecordingChannel, RecordingExportSink, ScriptedRuntime,
    SeverityScanner,
};
use cadence::orchestrator::{ExecuteOptions, ExecutionContext, Orchestrator};
use cadence::phase::{
    AgentOutcome, AgentRequest, PhaseResult, PhaseSpec, Severity, Vulnerability,
};
use cadence::pipeline::{Pipeline, PipelineRegistry, default_registry};
use cadence::queue::{Job, JobPayload, JobQueue, JobState, QueueConfig, Worker};
use cadence::story::Verdict;
use cadence::task::{ApprovalMode, Task, TaskStatus};

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    orchestrator: Arc<Orchestrator>,
    store: Arc<InMemoryTaskStore>,
    channel: Arc<RecordingChannel>,
    runtime: Arc<ScriptedRuntime>,
    export: Arc<RecordingExportSink>,
}

fn harness_with_registry(registry: PipelineRegistry) -> Harness {
    let store = Arc::new(InMemoryTaskStore::new());
    let channel = Arc::new(RecordingChannel::new());
    let runtime = Arc::new(ScriptedRuntime::new());
    let export = Arc::new(RecordingExportSink::new());
    let orchestrator = Arc::new(
        Orchestrator::new(
            Arc::clone(&store) as _,
            Arc::new(registry),
            Arc::clone(&runtime) as _,
            Arc::new(SeverityScanner::new(Severity::High)),
            Arc::clone(&channel) as _,
            Arc::new(NullSourceControl),
        )
        .with_export(Arc::clone(&export) as _),
    );
    Harness {
        orchestrator,
        store,
        channel,
        runtime,
        export,
    }
}

fn harness() -> Harness {
    harness_with_registry(default_registry())
}

fn approved_json() -> &'static str {
    r#"{"verdict": "approved", "score": 0.9, "issues": []}"#
}

/// Minimal custom phase for gating scenarios.
struct PlanPhase;

impl PhaseSpec for PlanPhase {
    fn name(&self) -> &str {
        "Plan"
    }

    fn description(&self) -> &str {
        "Draft an implementation plan"
    }

    fn agent_type(&self) -> &str {
        "planner"
    }

    fn validate(&self, _ctx: &ExecutionContext) -> bool {
        true
    }

    fn build_request(&self, ctx: &ExecutionContext) -> AgentRequest {
        let mut prompt = format!("Plan the task: {}", ctx.task.title);
        if let Some(feedback) = ctx.feedback_for("Plan") {
            prompt.push_str(&format!("\nFeedback: {}", feedback));
        }
        AgentRequest {
            task_id: ctx.task.id.clone(),
            phase: "Plan".into(),
            agent_type: "planner".into(),
            prompt,
            system_prompt: None,
            workspace: ctx.workspace.clone(),
        }
    }

    fn interpret(&self, outcome: &AgentOutcome, _ctx: &ExecutionContext) -> PhaseResult {
        PhaseResult::ok(serde_json::json!({"plan": outcome.final_output}))
    }
}

fn registry_with_plan_pipeline() -> PipelineRegistry {
    let registry = default_registry();
    registry.register(Pipeline::new(
        "plan_only",
        "A single gated planning phase",
        vec![Arc::new(PlanPhase)],
    ));
    registry
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

// =============================================================================
// Pipeline failure semantics
// =============================================================================

mod pipeline_failures {
    use super::*;

    #[tokio::test]
    async fn first_phase_failure_stops_the_pipeline() {
        let h = harness();
        h.store.insert(Task::new("t1", "title", "desc"));
        // Analysis never produces valid JSON; all three in-process
        // attempts are consumed.
        h.runtime.push_text("no json");
        h.runtime.push_text("still no json");
        h.runtime.push_text("nope");

        let result = h
            .orchestrator
            .execute("t1", "feature_development", ExecuteOptions::new("/w"))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.phase_results.len(), 1);
        assert!(result.phase_results.contains_key("Analysis"));
        assert_eq!(h.store.status_of("t1"), Some(TaskStatus::Failed));
        assert_eq!(h.runtime.request_count(), 3);
    }

    #[tokio::test]
    async fn missing_task_fails_fast() {
        let h = harness();
        let result = h
            .orchestrator
            .execute("ghost", "quick_fix", ExecuteOptions::new("/w"))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Task not found"));
        assert!(result.phase_results.is_empty());
    }

    #[tokio::test]
    async fn missing_pipeline_fails_fast() {
        let h = harness();
        h.store.insert(Task::new("t1", "x", "y"));
        let result = h
            .orchestrator
            .execute("t1", "no_such_pipeline", ExecuteOptions::new("/w"))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Pipeline not found"));
        assert_eq!(h.store.status_of("t1"), Some(TaskStatus::Failed));
    }

    #[tokio::test]
    async fn tracking_state_is_released_after_execution() {
        let h = harness();
        h.store.insert(Task::new("t1", "x", "y"));
        h.runtime.push_text("implemented");
        h.runtime.push_text(approved_json());

        h.orchestrator
            .execute("t1", "quick_fix", ExecuteOptions::new("/w"))
            .await
            .unwrap();

        assert!(h.orchestrator.tracking().is_empty());
    }

    #[tokio::test]
    async fn export_push_fires_after_completion() {
        let h = harness();
        h.store.insert(Task::new("t1", "x", "y"));
        h.runtime.push_text("implemented");
        h.runtime.push_text(approved_json());

        h.orchestrator
            .execute("t1", "quick_fix", ExecuteOptions::new("/w"))
            .await
            .unwrap();

        let export = Arc::clone(&h.export);
        wait_until(move || export.pushed() == vec!["t1".to_string()]).await;
    }
}

// =============================================================================
// Story loop (Scenario A and friends)
// =============================================================================

mod story_loop {
    use super::*;

    fn two_stories_json() -> &'static str {
        r#"{"stories": [
            {"title": "Story one", "description": "first unit", "files": ["a.rs"]},
            {"title": "Story two", "description": "second unit", "files": ["b.rs"]}
        ]}"#
    }

    #[tokio::test]
    async fn scenario_a_fixer_upgrades_second_story_verdict() {
        let h = harness();
        h.store.insert(Task::new("t1", "Feature", "two-part feature"));

        h.runtime.push_text(two_stories_json());
        // Story one: develop + approve.
        h.runtime.push_text("implemented story one");
        h.runtime.push_text(approved_json());
        // Story two: develop, needs revision with one issue, fix succeeds.
        h.runtime.push_text("implemented story two");
        h.runtime.push_text(
            r#"{"verdict": "needs_revision", "score": 0.55,
                "issues": [{"severity": "medium", "description": "edge case untested"}]}"#,
        );
        h.runtime.push_text("patched the edge case");

        let result = h
            .orchestrator
            .execute("t1", "feature_development", ExecuteOptions::new("/w"))
            .await
            .unwrap();

        assert!(result.success, "error: {:?}", result.error);
        let stories = result.story_results.unwrap();
        assert_eq!(stories.len(), 2);
        assert!(stories.iter().all(|s| s.success));

        assert_eq!(stories[0].final_verdict, Some(Verdict::Approved));
        assert!(stories[0].fix.is_none());

        // The fixer upgraded the verdict; the original assessment stays
        // on record.
        assert_eq!(stories[1].final_verdict, Some(Verdict::Approved));
        assert_eq!(
            stories[1].assessment.as_ref().unwrap().verdict,
            Verdict::NeedsRevision
        );
        assert!(stories[1].fix.as_ref().unwrap().success);

        assert_eq!(h.store.status_of("t1"), Some(TaskStatus::Completed));
    }

    #[tokio::test]
    async fn failed_story_skips_review_but_next_story_runs() {
        let h = harness();
        h.store.insert(Task::new("t1", "Feature", "two-part feature"));

        h.runtime.push_text(two_stories_json());
        // Story one: development fails all three in-process attempts.
        h.runtime.push_err("compile error");
        h.runtime.push_err("compile error");
        h.runtime.push_err("compile error");
        // Story two proceeds normally.
        h.runtime.push_text("implemented story two");
        h.runtime.push_text(approved_json());

        let result = h
            .orchestrator
            .execute("t1", "feature_development", ExecuteOptions::new("/w"))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("1 stories failed"));

        let stories = result.story_results.unwrap();
        assert_eq!(stories.len(), 2);
        assert!(!stories[0].success);
        assert!(stories[0].review.is_none());
        assert!(stories[0].fix.is_none());
        assert!(stories[1].success);

        // Story one's Judge never ran: exactly one Judge request total.
        let judge_requests = h
            .runtime
            .requests()
            .iter()
            .filter(|r| r.phase == "Judge")
            .count();
        assert_eq!(judge_requests, 1);

        assert_eq!(h.store.status_of("t1"), Some(TaskStatus::Failed));
    }

    #[tokio::test]
    async fn stories_run_strictly_in_order() {
        let h = harness();
        h.store.insert(Task::new("t1", "Feature", "two-part feature"));

        h.runtime.push_text(two_stories_json());
        h.runtime.push_text("implemented story one");
        h.runtime.push_text(approved_json());
        h.runtime.push_text("implemented story two");
        h.runtime.push_text(approved_json());

        h.orchestrator
            .execute("t1", "feature_development", ExecuteOptions::new("/w"))
            .await
            .unwrap();

        let development_prompts: Vec<String> = h
            .runtime
            .requests()
            .iter()
            .filter(|r| r.phase == "Development")
            .map(|r| r.prompt.clone())
            .collect();
        assert_eq!(development_prompts.len(), 2);
        assert!(development_prompts[0].contains("Story 1 of 2"));
        assert!(development_prompts[0].contains("Story one"));
        assert!(development_prompts[1].contains("Story 2 of 2"));
        assert!(development_prompts[1].contains("Story two"));
    }

    #[tokio::test]
    async fn empty_story_list_falls_back_to_plain_phases() {
        let h = harness();
        h.store.insert(Task::new("t1", "Tiny tweak", "one-liner"));

        h.runtime.push_text(r#"{"stories": []}"#);
        h.runtime.push_text("implemented directly");
        h.runtime.push_text(approved_json());
        // Fixer runs as a plain phase in the fallback path.
        h.runtime.push_text("nothing to fix");

        let result = h
            .orchestrator
            .execute("t1", "feature_development", ExecuteOptions::new("/w"))
            .await
            .unwrap();

        assert!(result.success, "error: {:?}", result.error);
        assert!(result.story_results.is_none());
        assert!(result.phase_results.contains_key("Development"));
        assert!(result.phase_results.contains_key("Judge"));
    }
}

// =============================================================================
// Approval gate (Scenario B and the request_changes loop)
// =============================================================================

mod approvals {
    use super::*;

    #[tokio::test]
    async fn scenario_b_rejection_aborts_the_pipeline() {
        let h = harness_with_registry(registry_with_plan_pipeline());
        h.store.insert(Task::new("t1", "Plan something", "desc"));
        h.runtime.push_text("the plan");

        let gate = h.orchestrator.gate();
        let orchestrator = Arc::clone(&h.orchestrator);
        let execution = tokio::spawn(async move {
            orchestrator
                .execute(
                    "t1",
                    "plan_only",
                    ExecuteOptions::new("/w").with_approval_mode(ApprovalMode::Manual),
                )
                .await
        });

        {
            let gate = Arc::clone(&gate);
            wait_until(move || gate.pending_count() > 0).await;
        }
        assert!(gate.resolve("t1", "Plan", ApprovalResponse::reject(None)));

        let result = execution.await.unwrap().unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("User rejected phase output"));
        assert_eq!(h.store.status_of("t1"), Some(TaskStatus::Failed));

        // The request was consumed exactly once.
        assert!(!gate.resolve("t1", "Plan", ApprovalResponse::approve()));
    }

    #[tokio::test]
    async fn request_changes_reruns_the_phase_with_feedback() {
        let h = harness_with_registry(registry_with_plan_pipeline());
        h.store.insert(Task::new("t1", "Plan something", "desc"));
        h.runtime.push_text("first draft");
        h.runtime.push_text("second draft");

        let gate = h.orchestrator.gate();
        let orchestrator = Arc::clone(&h.orchestrator);
        let execution = tokio::spawn(async move {
            orchestrator
                .execute(
                    "t1",
                    "plan_only",
                    ExecuteOptions::new("/w").with_approval_mode(ApprovalMode::Manual),
                )
                .await
        });

        {
            let gate = Arc::clone(&gate);
            wait_until(move || gate.pending_count() > 0).await;
        }
        assert!(gate.resolve(
            "t1",
            "Plan",
            ApprovalResponse::request_changes("cover the rollback path"),
        ));

        // The phase re-enters the gate with a fresh request.
        {
            let gate = Arc::clone(&gate);
            wait_until(move || gate.pending_count() > 0).await;
        }
        assert!(gate.resolve("t1", "Plan", ApprovalResponse::approve()));

        let result = execution.await.unwrap().unwrap();
        assert!(result.success);
        assert_eq!(
            result.phase_results["Plan"].output["plan"],
            serde_json::json!("second draft")
        );

        let requests = h.runtime.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].prompt.contains("cover the rollback path"));
    }

    #[tokio::test]
    async fn auto_mode_never_touches_the_gate() {
        let h = harness_with_registry(registry_with_plan_pipeline());
        h.store.insert(Task::new("t1", "Plan something", "desc"));
        h.runtime.push_text("the plan");

        let result = h
            .orchestrator
            .execute("t1", "plan_only", ExecuteOptions::new("/w"))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(h.orchestrator.gate().pending_count(), 0);
        let gated_events = h
            .channel
            .events_for("t1")
            .into_iter()
            .filter(|e| matches!(e, TaskEvent::ApprovalRequested { .. }))
            .count();
        assert_eq!(gated_events, 0);
    }

    #[tokio::test]
    async fn approval_events_round_trip_on_the_channel() {
        let h = harness_with_registry(registry_with_plan_pipeline());
        h.store.insert(Task::new("t1", "Plan something", "desc"));
        h.runtime.push_text("the plan");

        let gate = h.orchestrator.gate();
        let orchestrator = Arc::clone(&h.orchestrator);
        let execution = tokio::spawn(async move {
            orchestrator
                .execute(
                    "t1",
                    "plan_only",
                    ExecuteOptions::new("/w").with_approval_mode(ApprovalMode::Manual),
                )
                .await
        });
        {
            let gate = Arc::clone(&gate);
            wait_until(move || gate.pending_count() > 0).await;
        }
        gate.resolve("t1", "Plan", ApprovalResponse::approve());
        execution.await.unwrap().unwrap();

        let events = h.channel.events_for("t1");
        assert!(events
            .iter()
            .any(|e| matches!(e, TaskEvent::ApprovalRequested { phase, .. } if phase == "Plan")));
        assert!(events.iter().any(|e| matches!(
            e,
            TaskEvent::ApprovalResolved { action: ApprovalAction::Approve, .. }
        )));
    }
}

// =============================================================================
// Security blocking (Scenario C)
// =============================================================================

mod security {
    use super::*;

    #[tokio::test]
    async fn scenario_c_blocking_vulnerability_fails_without_retry() {
        let h = harness();
        h.store.insert(Task::new("t1", "x", "y"));

        let mut outcome = AgentOutcome::text("did something sketchy");
        outcome.vulnerabilities.push(Vulnerability {
            rule: "secrets-in-diff".into(),
            severity: Severity::Critical,
            description: "hardcoded credential".into(),
            file: Some("src/config.rs".into()),
        });
        h.runtime.push_ok(outcome);
        // A retry would consume this; it must never be requested.
        h.runtime.push_text("clean second attempt");

        let result = h
            .orchestrator
            .execute("t1", "quick_fix", ExecuteOptions::new("/w"))
            .await
            .unwrap();

        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("Security violation"));
        assert!(error.contains("secrets-in-diff"));
        assert_eq!(h.runtime.request_count(), 1);
        assert_eq!(h.store.status_of("t1"), Some(TaskStatus::Failed));
    }
}

// =============================================================================
// Queue + worker end-to-end
// =============================================================================

mod queue_worker {
    use super::*;

    #[tokio::test]
    async fn queued_task_runs_through_worker_to_completion() {
        let h = harness();
        h.store.insert(Task::new("t1", "Add retries", "retry loop"));
        h.runtime.push_text("implemented");
        h.runtime.push_text(approved_json());

        let worker = Arc::new(Worker::new(
            Arc::clone(&h.orchestrator),
            Arc::clone(&h.store) as _,
            Arc::clone(&h.channel) as _,
            Arc::new(NullSourceControl),
        ));
        let queue = JobQueue::start(QueueConfig::default(), worker);

        queue
            .submit(Job::orchestrate("t1", JobPayload::new("quick_fix", "/w")))
            .unwrap();

        {
            let queue = Arc::clone(&queue);
            wait_until(move || queue.state("t1") == Some(JobState::Completed)).await;
        }
        assert_eq!(h.store.status_of("t1"), Some(TaskStatus::Completed));

        // Milestones reached the task channel.
        let percents: Vec<u8> = h
            .channel
            .events_for("t1")
            .into_iter()
            .filter_map(|e| match e {
                TaskEvent::Progress { percent, .. } => Some(percent),
                _ => None,
            })
            .collect();
        assert!(percents.contains(&5));
        assert!(percents.contains(&100));

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn open_pr_flows_through_the_commit_lane() {
        let h = harness();
        h.store.insert(Task::new("t1", "Add retries", "retry loop"));
        h.runtime.push_text("implemented");
        h.runtime.push_text(approved_json());

        let worker = Arc::new(Worker::new(
            Arc::clone(&h.orchestrator),
            Arc::clone(&h.store) as _,
            Arc::clone(&h.channel) as _,
            Arc::new(NullSourceControl),
        ));
        let queue = JobQueue::start(QueueConfig::default(), worker);

        queue
            .submit(Job::orchestrate(
                "t1",
                JobPayload::new("quick_fix", "/w").with_open_pr(true),
            ))
            .unwrap();

        let channel = Arc::clone(&h.channel);
        wait_until(move || {
            channel
                .events_for("t1")
                .iter()
                .any(|e| matches!(e, TaskEvent::PrCreated { .. }))
        })
        .await;

        let events = h.channel.events_for("t1");
        assert!(events
            .iter()
            .any(|e| matches!(e, TaskEvent::Progress { percent: 80, .. })));

        queue.shutdown().await;
    }
}

// =============================================================================
// CLI basics
// =============================================================================

mod cli_basics {
    use super::*;

    fn cadence() -> Command {
        cargo_bin_cmd!("cadence")
    }

    #[test]
    fn test_cadence_help() {
        cadence().arg("--help").assert().success();
    }

    #[test]
    fn test_cadence_version() {
        cadence().arg("--version").assert().success();
    }

    #[test]
    fn test_cadence_pipelines_lists_builtins() {
        cadence()
            .arg("pipelines")
            .assert()
            .success()
            .stdout(predicate::str::contains("feature_development"))
            .stdout(predicate::str::contains(
                "Analysis -> Development -> Judge -> Fixer",
            ))
            .stdout(predicate::str::contains("quick_fix"));
    }

    #[test]
    fn test_cadence_config_shows_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        cadence()
            .current_dir(dir.path())
            .arg("config")
            .assert()
            .success()
            .stdout(predicate::str::contains("max_retries = 3"))
            .stdout(predicate::str::contains("[queue.commit]"));
    }

    #[test]
    fn test_cadence_config_rejects_bad_commit_concurrency() {
        let dir = tempfile::TempDir::new().unwrap();
        let config_dir = dir.path().join(".cadence");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("cadence.toml"),
            "[queue.commit]\nconcurrency = 2\n",
        )
        .unwrap();

        cadence()
            .current_dir(dir.path())
            .arg("config")
            .assert()
            .failure()
            .stderr(predicate::str::contains("queue.commit.concurrency"));
    }
}
