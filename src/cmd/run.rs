//! `cadence run` — execute one task through the local queue.
//!
//! Wires the in-process collaborators (in-memory store, subprocess agent
//! runtime, local checkpoints) around the orchestrator and worker, then
//! submits a single job and streams events until it reaches a terminal
//! state. Approvals run in auto mode: resolving a manual gate needs an
//! external control surface, which this command does not provide.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use uuid::Uuid;

use cadence::cadence_config::CadenceConfig;
use cadence::external::{
    BroadcastChannel, CommandRuntime, InMemoryTaskStore, LocalSourceControl, LoggingExportSink,
    SeverityScanner,
};
use cadence::orchestrator::Orchestrator;
use cadence::pipeline::default_registry;
use cadence::queue::{Job, JobPayload, JobQueue, Worker};
use cadence::task::{Priority, Task};

pub struct RunArgs {
    pub project_dir: PathBuf,
    pub title: String,
    pub description: String,
    pub pipeline: String,
    pub workspace: Option<PathBuf>,
    pub agent_cmd: String,
    pub priority: String,
    pub open_pr: bool,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let config = CadenceConfig::load_or_default(&args.project_dir)?;
    let workspace = args
        .workspace
        .unwrap_or_else(|| args.project_dir.clone())
        .canonicalize()
        .context("Workspace directory does not exist")?;
    let priority: Priority = args
        .priority
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let store = Arc::new(InMemoryTaskStore::new());
    let channel = Arc::new(BroadcastChannel::default());
    let registry = Arc::new(default_registry());
    let runtime = Arc::new(CommandRuntime::new(&args.agent_cmd, Vec::new()));

    let mut orchestrator = Orchestrator::new(
        Arc::clone(&store) as _,
        Arc::clone(&registry),
        runtime,
        Arc::new(SeverityScanner::default()),
        Arc::clone(&channel) as _,
        Arc::new(LocalSourceControl),
    )
    .with_max_retries(config.defaults.max_retries);
    if config.export.enabled {
        orchestrator = orchestrator.with_export(Arc::new(LoggingExportSink));
    }

    let worker = Arc::new(Worker::new(
        Arc::new(orchestrator),
        Arc::clone(&store) as _,
        Arc::clone(&channel) as _,
        Arc::new(LocalSourceControl),
    ));
    let queue = JobQueue::start(config.queue_config(), worker);

    // Stream events while the job runs.
    let mut events = channel.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(message) = events.recv().await {
            println!("{}", message);
        }
    });

    let task_id = Uuid::new_v4().to_string();
    store.insert(Task::new(&task_id, &args.title, &args.description));

    let payload = JobPayload::new(&args.pipeline, &workspace)
        .with_priority(priority)
        .with_open_pr(args.open_pr);
    queue.submit(Job::orchestrate(&task_id, payload))?;
    println!("Submitted task {} to pipeline {}", task_id, args.pipeline);

    // Poll the queue until the job settles. Two consecutive terminal
    // observations, so a commit-lane follow-up is not mistaken for done.
    let mut settled = 0;
    loop {
        tokio::time::sleep(Duration::from_millis(200)).await;
        match queue.state(&task_id) {
            Some(state) if !state.is_in_flight() => {
                settled += 1;
                if settled >= 2 {
                    break;
                }
            }
            _ => settled = 0,
        }
    }
    queue.shutdown().await;
    printer.abort();

    let status = store
        .status_of(&task_id)
        .context("Task vanished from the store")?;
    println!("Task {} finished: {}", task_id, status);
    if let Some(error) = store.error_of(&task_id) {
        println!("  error: {}", error);
        anyhow::bail!("Task failed");
    }
    Ok(())
}
