//! Contracts for the orchestration core's external collaborators, plus the
//! in-process implementations used by the CLI and the test suite.
//!
//! The core treats the agent runtime, security scanner, persistence,
//! real-time channel, ML-export sink, and source control as opaque
//! collaborators: it depends on these traits only, never on concrete
//! backends. Real deployments supply their own implementations; the ones
//! here are deliberately small (in-memory store, subprocess runtime,
//! file-copy checkpoints).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::events::{TaskEvent, encode_event};
use crate::phase::{AgentOutcome, AgentRequest, Severity, ToolCall, Vulnerability};
use crate::task::{Task, TaskStatus};

// ── Agent runtime ────────────────────────────────────────────────────

/// The external agent-execution runtime: an asynchronous, possibly
/// multi-turn call. The core only needs the result shape.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn run(&self, request: AgentRequest) -> Result<AgentOutcome>;
}

/// Runs an agent CLI as a subprocess, feeding the prompt via stdin and
/// treating stdout as the final output. One turn, no tool telemetry —
/// richer runtimes report tool calls and vulnerabilities themselves.
pub struct CommandRuntime {
    cmd: String,
    args: Vec<String>,
}

impl CommandRuntime {
    pub fn new(cmd: &str, args: Vec<String>) -> Self {
        Self {
            cmd: cmd.to_string(),
            args,
        }
    }
}

#[async_trait]
impl AgentRuntime for CommandRuntime {
    async fn run(&self, request: AgentRequest) -> Result<AgentOutcome> {
        let mut child = Command::new(&self.cmd)
            .args(&self.args)
            .current_dir(&request.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn agent command: {}", self.cmd))?;

        let prompt = match &request.system_prompt {
            Some(system) => format!("{}\n\n{}", system, request.prompt),
            None => request.prompt.clone(),
        };

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.shutdown().await.context("Failed to close stdin")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for agent command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Agent command exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }

        let final_output = String::from_utf8(output.stdout)
            .context("Invalid UTF-8 in agent output")?
            .trim()
            .to_string();

        Ok(AgentOutcome::text(&final_output))
    }
}

/// Test double for the agent runtime: pops pre-scripted outcomes in order
/// and records every request it receives.
#[derive(Default)]
pub struct ScriptedRuntime {
    outcomes: Mutex<std::collections::VecDeque<Result<AgentOutcome>>>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, outcome: AgentOutcome) {
        self.outcomes.lock().unwrap().push_back(Ok(outcome));
    }

    pub fn push_text(&self, output: &str) {
        self.push_ok(AgentOutcome::text(output));
    }

    pub fn push_err(&self, message: &str) {
        self.outcomes
            .lock()
            .unwrap()
            .push_back(Err(anyhow::anyhow!("{}", message)));
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    async fn run(&self, request: AgentRequest) -> Result<AgentOutcome> {
        self.requests.lock().unwrap().push(request);
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow::anyhow!("ScriptedRuntime has no outcomes left")))
    }
}

// ── Security scanner ─────────────────────────────────────────────────

/// The external vulnerability-detection engine. The heuristics live
/// elsewhere; the core only consults `should_block` to decide whether a
/// reported vulnerability aborts the phase.
pub trait SecurityScanner: Send + Sync {
    fn analyze(&self, tool_call: &ToolCall, workspace: &Path) -> Vec<Vulnerability>;

    fn should_block(&self, vulnerability: &Vulnerability) -> bool;
}

/// Blocks every vulnerability at or above a severity threshold.
pub struct SeverityScanner {
    block_at: Severity,
}

impl SeverityScanner {
    pub fn new(block_at: Severity) -> Self {
        Self { block_at }
    }
}

impl Default for SeverityScanner {
    fn default() -> Self {
        Self::new(Severity::High)
    }
}

impl SecurityScanner for SeverityScanner {
    fn analyze(&self, _tool_call: &ToolCall, _workspace: &Path) -> Vec<Vulnerability> {
        Vec::new()
    }

    fn should_block(&self, vulnerability: &Vulnerability) -> bool {
        vulnerability.severity >= self.block_at
    }
}

// ── Persistence ──────────────────────────────────────────────────────

/// Task persistence. Relational storage is external; the core reads tasks
/// and writes status transitions with an optional result payload.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn find_task(&self, id: &str) -> Result<Option<Task>>;

    async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<()>;
}

/// In-memory task store backing the CLI and the test suite.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: DashMap<String, Task>,
    results: DashMap<String, serde_json::Value>,
    errors: DashMap<String, String>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: Task) {
        self.tasks.insert(task.id.clone(), task);
    }

    pub fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.tasks.get(id).map(|t| t.status)
    }

    pub fn result_of(&self, id: &str) -> Option<serde_json::Value> {
        self.results.get(id).map(|r| r.clone())
    }

    pub fn error_of(&self, id: &str) -> Option<String> {
        self.errors.get(id).map(|e| e.clone())
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn find_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.get(id).map(|t| t.clone()))
    }

    async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<()> {
        let mut task = self
            .tasks
            .get_mut(id)
            .with_context(|| format!("Unknown task: {}", id))?;
        task.status = status;
        task.updated_at = chrono::Utc::now();
        drop(task);
        if let Some(result) = result {
            self.results.insert(id.to_string(), result);
        }
        match error {
            Some(error) => {
                self.errors.insert(id.to_string(), error);
            }
            // A clean write supersedes any error from an earlier attempt.
            None => {
                self.errors.remove(id);
            }
        }
        Ok(())
    }
}

// ── Real-time channel ────────────────────────────────────────────────

/// Fire-and-forget broadcast to subscribers of a task. Delivery failures
/// (nobody listening) are not errors.
pub trait RealtimeChannel: Send + Sync {
    fn to_task(&self, task_id: &str, event: TaskEvent);

    fn emit_to_user(&self, user_id: &str, event: TaskEvent);
}

/// Fan-out over a `tokio::sync::broadcast` channel. The envelope carries
/// the scope (`task:<id>` or `user:<id>`) so a socket layer can route to
/// its rooms.
pub struct BroadcastChannel {
    tx: broadcast::Sender<String>,
}

impl BroadcastChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    fn send(&self, scope: &str, event: &TaskEvent) {
        if let Some(json) = encode_event(event) {
            // A send error only means there are no subscribers right now.
            let _ = self.tx.send(format!("{{\"scope\":\"{}\",\"event\":{}}}", scope, json));
        }
    }
}

impl Default for BroadcastChannel {
    fn default() -> Self {
        Self::new(256)
    }
}

impl RealtimeChannel for BroadcastChannel {
    fn to_task(&self, task_id: &str, event: TaskEvent) {
        self.send(&format!("task:{}", task_id), &event);
    }

    fn emit_to_user(&self, user_id: &str, event: TaskEvent) {
        self.send(&format!("user:{}", user_id), &event);
    }
}

/// Records every event for inspection. Test double.
#[derive(Default)]
pub struct RecordingChannel {
    events: Mutex<Vec<(String, TaskEvent)>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, TaskEvent)> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_for(&self, task_id: &str) -> Vec<TaskEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(scope, _)| scope == &format!("task:{}", task_id))
            .map(|(_, e)| e.clone())
            .collect()
    }
}

impl RealtimeChannel for RecordingChannel {
    fn to_task(&self, task_id: &str, event: TaskEvent) {
        self.events
            .lock()
            .unwrap()
            .push((format!("task:{}", task_id), event));
    }

    fn emit_to_user(&self, user_id: &str, event: TaskEvent) {
        self.events
            .lock()
            .unwrap()
            .push((format!("user:{}", user_id), event));
    }
}

/// Discards everything.
pub struct NullChannel;

impl RealtimeChannel for NullChannel {
    fn to_task(&self, _task_id: &str, _event: TaskEvent) {}

    fn emit_to_user(&self, _user_id: &str, _event: TaskEvent) {}
}

// ── ML-export sink ───────────────────────────────────────────────────

/// Best-effort push of a completed task to the training-export pipeline.
/// Failures are logged by the caller, never surfaced as orchestration
/// failures.
#[async_trait]
pub trait ExportSink: Send + Sync {
    async fn push(&self, task_id: &str) -> Result<()>;
}

/// Logs the push and does nothing else.
pub struct LoggingExportSink;

#[async_trait]
impl ExportSink for LoggingExportSink {
    async fn push(&self, task_id: &str) -> Result<()> {
        tracing::info!(task_id, "Export push");
        Ok(())
    }
}

/// Records pushed task ids. Test double.
#[derive(Default)]
pub struct RecordingExportSink {
    pushed: Mutex<Vec<String>>,
}

impl RecordingExportSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pushed(&self) -> Vec<String> {
        self.pushed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExportSink for RecordingExportSink {
    async fn push(&self, task_id: &str) -> Result<()> {
        self.pushed.lock().unwrap().push(task_id.to_string());
        Ok(())
    }
}

// ── Source control ───────────────────────────────────────────────────

/// A restorable snapshot of uncommitted workspace changes.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub id: String,
    pub path: PathBuf,
}

/// Reference to a created pull request.
#[derive(Debug, Clone)]
pub struct PrRef {
    pub url: String,
}

/// Source-control operations (clone/commit/PR are implemented elsewhere).
/// The story loop uses checkpoint/restore so a rejected story's changes
/// can be discarded without corrupting earlier, already-kept stories;
/// the commit lane uses `open_pull_request`.
#[async_trait]
pub trait SourceControl: Send + Sync {
    async fn checkpoint(&self, workspace: &Path) -> Result<Checkpoint>;

    async fn restore(&self, workspace: &Path, checkpoint: &Checkpoint) -> Result<()>;

    async fn discard(&self, checkpoint: &Checkpoint) -> Result<()>;

    async fn open_pull_request(&self, workspace: &Path, title: &str, body: &str) -> Result<PrRef>;
}

/// File-copy checkpoints under `<workspace>/.cadence/checkpoints`. A
/// stand-in for stash-based checkpoints when no VCS backend is wired up.
pub struct LocalSourceControl;

const CHECKPOINT_DIR: &str = ".cadence/checkpoints";

impl LocalSourceControl {
    fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
        std::fs::create_dir_all(dst)
            .with_context(|| format!("Failed to create {}", dst.display()))?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            let name = entry.file_name();
            // Never snapshot our own bookkeeping directory.
            if name == ".cadence" {
                continue;
            }
            let target = dst.join(&name);
            if entry.file_type()?.is_dir() {
                Self::copy_tree(&entry.path(), &target)?;
            } else {
                std::fs::copy(entry.path(), &target)
                    .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
            }
        }
        Ok(())
    }

    fn clear_tree(root: &Path) -> Result<()> {
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if entry.file_name() == ".cadence" {
                continue;
            }
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(entry.path())?;
            } else {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SourceControl for LocalSourceControl {
    async fn checkpoint(&self, workspace: &Path) -> Result<Checkpoint> {
        let id = Uuid::new_v4().to_string();
        let path = workspace.join(CHECKPOINT_DIR).join(&id);
        Self::copy_tree(workspace, &path)?;
        Ok(Checkpoint { id, path })
    }

    async fn restore(&self, workspace: &Path, checkpoint: &Checkpoint) -> Result<()> {
        if !checkpoint.path.exists() {
            anyhow::bail!("Checkpoint {} no longer exists", checkpoint.id);
        }
        Self::clear_tree(workspace)?;
        Self::copy_tree(&checkpoint.path, workspace)?;
        std::fs::remove_dir_all(&checkpoint.path).ok();
        Ok(())
    }

    async fn discard(&self, checkpoint: &Checkpoint) -> Result<()> {
        if checkpoint.path.exists() {
            std::fs::remove_dir_all(&checkpoint.path)
                .with_context(|| format!("Failed to discard checkpoint {}", checkpoint.id))?;
        }
        Ok(())
    }

    async fn open_pull_request(&self, workspace: &Path, title: &str, body: &str) -> Result<PrRef> {
        // Without a VCS backend the "PR" is a summary file in the
        // workspace bookkeeping directory.
        let dir = workspace.join(".cadence");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("pr-{}.md", Uuid::new_v4()));
        std::fs::write(&path, format!("# {}\n\n{}\n", title, body))
            .with_context(|| format!("Failed to write PR summary {}", path.display()))?;
        Ok(PrRef {
            url: format!("file://{}", path.display()),
        })
    }
}

/// No-op source control for tests that do not touch the filesystem.
pub struct NullSourceControl;

#[async_trait]
impl SourceControl for NullSourceControl {
    async fn checkpoint(&self, _workspace: &Path) -> Result<Checkpoint> {
        Ok(Checkpoint {
            id: Uuid::new_v4().to_string(),
            path: PathBuf::new(),
        })
    }

    async fn restore(&self, _workspace: &Path, _checkpoint: &Checkpoint) -> Result<()> {
        Ok(())
    }

    async fn discard(&self, _checkpoint: &Checkpoint) -> Result<()> {
        Ok(())
    }

    async fn open_pull_request(
        &self,
        _workspace: &Path,
        title: &str,
        _body: &str,
    ) -> Result<PrRef> {
        Ok(PrRef {
            url: format!("pr://{}", title.to_lowercase().replace(' ', "-")),
        })
    }
}
