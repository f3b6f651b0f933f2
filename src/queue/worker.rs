//! The worker: bridges the job queue and the orchestrator.
//!
//! Workers relay milestone progress to the task's real-time channel,
//! persist the final status with the full result payload, and — the one
//! deliberate exception to "never throw" — let infrastructure errors
//! escape so the queue's retry/backoff machinery engages.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::events::TaskEvent;
use crate::external::{RealtimeChannel, SourceControl, TaskStore};
use crate::orchestrator::{ExecuteOptions, Milestone, Orchestrator, ProgressHook};
use crate::queue::job::{Job, JobKind};
use crate::queue::queue::{JobHandler, JobOutcome};
use crate::task::TaskStatus;

/// Relays orchestration milestones to the task-scoped channel as
/// fractional progress.
struct ChannelProgress {
    channel: Arc<dyn RealtimeChannel>,
}

impl ProgressHook for ChannelProgress {
    fn on_milestone(&self, task_id: &str, milestone: Milestone) {
        self.channel.to_task(
            task_id,
            TaskEvent::Progress {
                task_id: task_id.to_string(),
                percent: milestone.percent(),
                milestone: milestone.as_str().to_string(),
            },
        );
    }
}

pub struct Worker {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn TaskStore>,
    channel: Arc<dyn RealtimeChannel>,
    scm: Arc<dyn SourceControl>,
}

impl Worker {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        store: Arc<dyn TaskStore>,
        channel: Arc<dyn RealtimeChannel>,
        scm: Arc<dyn SourceControl>,
    ) -> Self {
        Self {
            orchestrator,
            store,
            channel,
            scm,
        }
    }

    async fn handle_orchestrate(&self, job: &Job) -> Result<JobOutcome> {
        let options = ExecuteOptions::new(&job.payload.workspace)
            .with_approval_mode(job.payload.approval_mode)
            .with_progress(Arc::new(ChannelProgress {
                channel: Arc::clone(&self.channel),
            }));

        // Infrastructure faults propagate out of `execute` and re-throw
        // from here; domain failures come back inside the result.
        let result = self
            .orchestrator
            .execute(&job.id, &job.payload.pipeline, options)
            .await?;

        // Persist the full result payload under the status the
        // orchestrator decided (it may have moved the task to cancelled).
        let status = match self.store.find_task(&job.id).await? {
            Some(task) if task.status.is_terminal() => task.status,
            _ => {
                if result.success {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Failed
                }
            }
        };
        let payload =
            serde_json::to_value(&result).context("Failed to serialize orchestration result")?;
        self.store
            .update_status(&job.id, status, Some(payload), result.error.clone())
            .await?;

        if result.success && job.payload.open_pr {
            return Ok(JobOutcome::FollowUp(Job::open_pull_request(
                &job.id,
                job.payload.clone(),
            )));
        }
        Ok(JobOutcome::Done)
    }

    async fn handle_open_pull_request(&self, job: &Job) -> Result<JobOutcome> {
        let task = self
            .store
            .find_task(&job.id)
            .await?
            .with_context(|| format!("Task not found: {}", job.id))?;

        let pr = self
            .scm
            .open_pull_request(&job.payload.workspace, &task.title, &task.description)
            .await?;

        self.channel.to_task(
            &job.id,
            TaskEvent::Progress {
                task_id: job.id.clone(),
                percent: Milestone::PrCreated.percent(),
                milestone: Milestone::PrCreated.as_str().to_string(),
            },
        );
        self.channel.to_task(
            &job.id,
            TaskEvent::PrCreated {
                task_id: job.id.clone(),
                url: pr.url.clone(),
            },
        );
        tracing::info!(task_id = %job.id, url = %pr.url, "Pull request created");
        Ok(JobOutcome::Done)
    }
}

#[async_trait]
impl JobHandler for Worker {
    async fn handle(&self, job: &Job) -> Result<JobOutcome> {
        match job.kind {
            JobKind::Orchestrate => self.handle_orchestrate(job).await,
            JobKind::OpenPullRequest => self.handle_open_pull_request(job).await,
        }
    }

    async fn on_cancel(&self, task_id: &str) {
        self.orchestrator.cancel(task_id);
    }

    async fn on_dead_letter(&self, job: &Job, error: &str) {
        let message = format!("Job failed after {} retries: {}", job.retries, error);
        if let Err(e) = self
            .store
            .update_status(&job.id, TaskStatus::Failed, None, Some(message.clone()))
            .await
        {
            tracing::warn!(task_id = %job.id, error = %format!("{:#}", e),
                "Failed to persist dead-letter status");
        }
        self.channel.to_task(
            &job.id,
            TaskEvent::JobDeadLettered {
                task_id: job.id.clone(),
                error: message,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::external::{
        InMemoryTaskStore, NullSourceControl, RecordingChannel, ScriptedRuntime, SeverityScanner,
    };
    use crate::phase::Severity;
    use crate::pipeline::default_registry;
    use crate::queue::job::JobPayload;
    use crate::task::Task;

    struct Fixture {
        worker: Worker,
        store: Arc<InMemoryTaskStore>,
        channel: Arc<RecordingChannel>,
        runtime: Arc<ScriptedRuntime>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryTaskStore::new());
        let channel = Arc::new(RecordingChannel::new());
        let runtime = Arc::new(ScriptedRuntime::new());
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store) as _,
            Arc::new(default_registry()),
            Arc::clone(&runtime) as _,
            Arc::new(SeverityScanner::new(Severity::High)),
            Arc::clone(&channel) as _,
            Arc::new(NullSourceControl),
        ));
        let worker = Worker::new(
            orchestrator,
            Arc::clone(&store) as _,
            Arc::clone(&channel) as _,
            Arc::new(NullSourceControl),
        );
        Fixture {
            worker,
            store,
            channel,
            runtime,
        }
    }

    #[tokio::test]
    async fn test_orchestrate_job_persists_result_payload() {
        let f = fixture();
        f.store.insert(Task::new("t1", "Add retries", "retry loop"));
        // quick_fix pipeline: Development then Judge.
        f.runtime.push_text("implemented");
        f.runtime.push_text(r#"{"verdict": "approved", "score": 0.9, "issues": []}"#);

        let job = Job::orchestrate("t1", JobPayload::new("quick_fix", "/w"));
        let outcome = f.worker.handle(&job).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Done));

        assert_eq!(f.store.status_of("t1"), Some(TaskStatus::Completed));
        let payload = f.store.result_of("t1").unwrap();
        assert_eq!(payload["success"], serde_json::json!(true));
        assert!(payload["phase_results"]["Judge"]["success"].as_bool().unwrap());
    }

    #[tokio::test]
    async fn test_orchestrate_job_reports_milestones() {
        let f = fixture();
        f.store.insert(Task::new("t1", "x", "y"));
        f.runtime.push_text("implemented");
        f.runtime.push_text(r#"{"verdict": "approved", "score": 1.0, "issues": []}"#);

        let job = Job::orchestrate("t1", JobPayload::new("quick_fix", "/w"));
        f.worker.handle(&job).await.unwrap();

        let percents: Vec<u8> = f
            .channel
            .events_for("t1")
            .into_iter()
            .filter_map(|e| match e {
                TaskEvent::Progress { percent, .. } => Some(percent),
                _ => None,
            })
            .collect();
        assert!(percents.contains(&5));
        assert!(percents.contains(&60));
        assert!(percents.contains(&100));
    }

    #[tokio::test]
    async fn test_successful_open_pr_job_emits_pr_created() {
        let f = fixture();
        f.store.insert(Task::new("t1", "Add retries", "retry loop"));

        let job = Job::open_pull_request("t1", JobPayload::new("quick_fix", "/w"));
        let outcome = f.worker.handle(&job).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Done));

        let events = f.channel.events_for("t1");
        assert!(events.iter().any(|e| matches!(
            e,
            TaskEvent::Progress { percent: 80, .. }
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, TaskEvent::PrCreated { .. })));
    }

    #[tokio::test]
    async fn test_open_pr_for_missing_task_rethrows() {
        let f = fixture();
        let job = Job::open_pull_request("ghost", JobPayload::new("quick_fix", "/w"));
        assert!(f.worker.handle(&job).await.is_err());
    }

    #[tokio::test]
    async fn test_successful_orchestration_with_open_pr_queues_follow_up() {
        let f = fixture();
        f.store.insert(Task::new("t1", "x", "y"));
        f.runtime.push_text("implemented");
        f.runtime.push_text(r#"{"verdict": "approved", "score": 1.0, "issues": []}"#);

        let job = Job::orchestrate(
            "t1",
            JobPayload::new("quick_fix", "/w").with_open_pr(true),
        );
        let outcome = f.worker.handle(&job).await.unwrap();
        match outcome {
            JobOutcome::FollowUp(next) => {
                assert_eq!(next.kind, JobKind::OpenPullRequest);
                assert_eq!(next.id, "t1");
            }
            JobOutcome::Done => panic!("Expected a follow-up commit-lane job"),
        }
    }

    #[tokio::test]
    async fn test_failed_orchestration_skips_pr_follow_up() {
        let f = fixture();
        f.store.insert(Task::new("t1", "x", "y"));
        // Development fails all three in-process attempts.
        f.runtime.push_err("no");
        f.runtime.push_err("still no");
        f.runtime.push_err("give up");

        let job = Job::orchestrate(
            "t1",
            JobPayload::new("quick_fix", "/w").with_open_pr(true),
        );
        let outcome = f.worker.handle(&job).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Done));
        assert_eq!(f.store.status_of("t1"), Some(TaskStatus::Failed));
    }

    #[tokio::test]
    async fn test_dead_letter_persists_failure_and_broadcasts() {
        let f = fixture();
        f.store.insert(Task::new("t1", "x", "y"));

        let mut job = Job::orchestrate("t1", JobPayload::new("quick_fix", "/w"));
        job.retries = 3;
        f.worker.on_dead_letter(&job, "queue gave up").await;

        assert_eq!(f.store.status_of("t1"), Some(TaskStatus::Failed));
        assert!(f.store.error_of("t1").unwrap().contains("queue gave up"));
        assert!(f
            .channel
            .events_for("t1")
            .iter()
            .any(|e| matches!(e, TaskEvent::JobDeadLettered { .. })));
    }

    #[tokio::test]
    async fn test_workspace_path_reaches_agent_requests() {
        let f = fixture();
        f.store.insert(Task::new("t1", "x", "y"));
        f.runtime.push_text("implemented");
        f.runtime.push_text(r#"{"verdict": "approved", "score": 1.0, "issues": []}"#);

        let job = Job::orchestrate("t1", JobPayload::new("quick_fix", "/work/space-1"));
        f.worker.handle(&job).await.unwrap();

        let requests = f.runtime.requests();
        assert!(!requests.is_empty());
        assert!(requests
            .iter()
            .all(|r| r.workspace == PathBuf::from("/work/space-1")));
    }
}
