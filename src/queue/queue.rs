//! The job queue: priority-lane, concurrency-limited distribution of
//! jobs to workers.
//!
//! Each lane runs one dispatcher loop that pops its backlog, waits out
//! pause/rate-limit/concurrency gates, and hands jobs to the shared
//! handler on tracked tasks. A failed job re-enters its lane after an
//! exponential backoff delay until the lane's retry policy is exhausted,
//! at which point it is dead-lettered.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::errors::QueueError;
use crate::queue::job::{Job, JobState, LaneKind};
use crate::queue::lane::{Lane, LaneConfig};

/// What the handler produced for a finished job.
pub enum JobOutcome {
    Done,
    /// Enqueue a follow-up job (e.g. a commit-lane PR job after a
    /// successful orchestration).
    FollowUp(Job),
}

/// Executes jobs on behalf of the queue. Returning `Err` engages the
/// queue's retry/backoff machinery — this is the one layer where workers
/// deliberately let errors escape.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<JobOutcome>;

    /// A job for this task was cancelled; abort any in-flight work.
    async fn on_cancel(&self, _task_id: &str) {}

    /// Retries are exhausted; the job is now terminally failed.
    async fn on_dead_letter(&self, _job: &Job, _error: &str) {}
}

/// Queue configuration: one entry per lane.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub lanes: Vec<LaneConfig>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lanes: vec![
                LaneConfig::normal(),
                LaneConfig::elevated(),
                LaneConfig::commit(),
            ],
        }
    }
}

pub struct JobQueue {
    lanes: HashMap<LaneKind, Arc<Lane>>,
    states: DashMap<String, JobState>,
    cancel_requested: DashMap<String, ()>,
    handler: Arc<dyn JobHandler>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    paused: tokio::sync::watch::Sender<bool>,
}

impl JobQueue {
    /// Build the queue and spawn one dispatcher per configured lane.
    pub fn start(config: QueueConfig, handler: Arc<dyn JobHandler>) -> Arc<Self> {
        let lanes: HashMap<LaneKind, Arc<Lane>> = config
            .lanes
            .into_iter()
            .map(|lane| (lane.kind, Arc::new(Lane::new(lane))))
            .collect();
        let (paused, _) = tokio::sync::watch::channel(false);

        let queue = Arc::new(Self {
            lanes,
            states: DashMap::new(),
            cancel_requested: DashMap::new(),
            handler,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            paused,
        });

        for lane in queue.lanes.values() {
            let dispatcher = Arc::clone(&queue);
            let lane = Arc::clone(lane);
            queue.tracker.spawn(async move {
                dispatcher.dispatch_loop(lane).await;
            });
        }

        queue
    }

    /// Submit a job. The job id is the task id, so submitting a task that
    /// is already in flight is a no-op returning the existing state.
    pub fn submit(&self, job: Job) -> Result<JobState, QueueError> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::QueueClosed {
                task_id: job.id.clone(),
            });
        }
        let lane_kind = job.lane();
        let Some(lane) = self.lanes.get(&lane_kind) else {
            return Err(QueueError::UnknownLane {
                lane: lane_kind.to_string(),
            });
        };

        if let Some(existing) = self.states.get(&job.id)
            && existing.is_in_flight()
        {
            tracing::debug!(task_id = %job.id, state = existing.as_str(), "Duplicate submission merged");
            return Ok(*existing);
        }

        self.states.insert(job.id.clone(), JobState::Waiting);
        tracing::info!(task_id = %job.id, lane = %lane_kind, retries = job.retries, "Job queued");
        lane.push(job);
        Ok(JobState::Waiting)
    }

    /// Last known state for a task's job, if any.
    pub fn state(&self, task_id: &str) -> Option<JobState> {
        self.states.get(task_id).map(|s| *s)
    }

    pub fn backlog_len(&self, lane: LaneKind) -> usize {
        self.lanes.get(&lane).map(|l| l.backlog_len()).unwrap_or(0)
    }

    /// Cancel a task's job. A waiting job is removed outright; an active
    /// (or backing-off) job is flagged and moved to the cancelled
    /// terminal state when it unwinds — never killed mid-flight.
    pub async fn cancel(&self, task_id: &str) -> Result<JobState, QueueError> {
        let current = self
            .state(task_id)
            .ok_or_else(|| QueueError::JobNotFound {
                task_id: task_id.to_string(),
            })?;

        match current {
            JobState::Waiting => {
                for lane in self.lanes.values() {
                    lane.remove(task_id);
                }
                self.states.insert(task_id.to_string(), JobState::Cancelled);
                self.handler.on_cancel(task_id).await;
                tracing::info!(task_id, "Waiting job cancelled");
                Ok(JobState::Cancelled)
            }
            JobState::Active | JobState::Backoff => {
                self.cancel_requested.insert(task_id.to_string(), ());
                self.handler.on_cancel(task_id).await;
                tracing::info!(task_id, state = %current, "Cancellation flagged for in-flight job");
                Ok(current)
            }
            terminal => Ok(terminal),
        }
    }

    /// Stop admitting jobs until `resume`.
    pub fn pause(&self) {
        self.paused.send_replace(true);
        tracing::info!("Queue paused");
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
        tracing::info!("Queue resumed");
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Graceful shutdown: stop intake and dispatching, then drain
    /// in-flight jobs.
    pub async fn shutdown(&self) {
        tracing::info!("Queue shutting down");
        self.shutdown.cancel();
        for lane in self.lanes.values() {
            lane.notify.notify_waiters();
        }
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Queue drained");
    }

    async fn dispatch_loop(self: Arc<Self>, lane: Arc<Lane>) {
        loop {
            let job = loop {
                if let Some(job) = lane.pop() {
                    break job;
                }
                tokio::select! {
                    _ = lane.notify.notified() => {}
                    _ = self.shutdown.cancelled() => return,
                }
            };

            if !self.wait_unpaused().await {
                // Shut down while paused; leave the job unprocessed.
                return;
            }

            if self.cancel_requested.remove(&job.id).is_some() {
                self.states.insert(job.id.clone(), JobState::Cancelled);
                continue;
            }

            tokio::select! {
                _ = lane.admit() => {}
                _ = self.shutdown.cancelled() => return,
            }

            let permit = tokio::select! {
                permit = lane.semaphore.clone().acquire_owned() => {
                    match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    }
                }
                _ = self.shutdown.cancelled() => return,
            };

            // The job may have been cancelled while it sat popped but
            // unstarted (waiting on pause, rate limit, or a permit).
            if self.cancel_requested.remove(&job.id).is_some()
                || self.state(&job.id) == Some(JobState::Cancelled)
            {
                self.states.insert(job.id.clone(), JobState::Cancelled);
                continue;
            }

            let queue = Arc::clone(&self);
            let lane = Arc::clone(&lane);
            self.tracker.spawn(async move {
                let _permit = permit;
                queue.run_job(lane, job).await;
            });
        }
    }

    async fn run_job(self: Arc<Self>, lane: Arc<Lane>, job: Job) {
        self.states.insert(job.id.clone(), JobState::Active);
        tracing::info!(task_id = %job.id, lane = %lane.config.kind, attempt = job.retries + 1, "Job started");

        let result = match lane.config.stall_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.handler.handle(&job)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("job stalled after {:?}", timeout)),
            },
            None => self.handler.handle(&job).await,
        };

        if self.cancel_requested.remove(&job.id).is_some() {
            self.states.insert(job.id.clone(), JobState::Cancelled);
            tracing::info!(task_id = %job.id, "Job cancelled");
            return;
        }

        match result {
            Ok(JobOutcome::Done) => {
                self.states.insert(job.id.clone(), JobState::Completed);
                tracing::info!(task_id = %job.id, "Job completed");
            }
            Ok(JobOutcome::FollowUp(next)) => {
                self.states.insert(job.id.clone(), JobState::Completed);
                tracing::info!(task_id = %job.id, lane = %next.lane(), "Job completed, follow-up queued");
                if let Err(e) = self.submit(next) {
                    tracing::warn!(task_id = %job.id, error = %e, "Follow-up submission failed");
                }
            }
            Err(e) => {
                let message = format!("{:#}", e);
                self.schedule_retry(lane, job, message).await;
            }
        }
    }

    async fn schedule_retry(self: Arc<Self>, lane: Arc<Lane>, mut job: Job, error: String) {
        let policy = lane.config.retry;
        if policy.is_exhausted(job.retries) {
            self.states.insert(job.id.clone(), JobState::Failed);
            tracing::error!(task_id = %job.id, retries = job.retries, error = %error, "Job dead-lettered");
            self.handler.on_dead_letter(&job, &error).await;
            return;
        }

        let delay = policy.delay_for(job.retries);
        job.retries += 1;
        self.states.insert(job.id.clone(), JobState::Backoff);
        tracing::warn!(
            task_id = %job.id,
            retry = job.retries,
            delay_secs = delay.as_secs(),
            error = %error,
            "Job failed, retry scheduled"
        );

        let queue = Arc::clone(&self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if queue.shutdown.is_cancelled() {
                queue.states.insert(job.id.clone(), JobState::Failed);
                queue
                    .handler
                    .on_dead_letter(&job, "queue shut down during backoff")
                    .await;
                return;
            }
            if queue.cancel_requested.remove(&job.id).is_some() {
                queue.states.insert(job.id.clone(), JobState::Cancelled);
                return;
            }
            queue.states.insert(job.id.clone(), JobState::Waiting);
            if let Some(lane) = queue.lanes.get(&job.lane()) {
                lane.push(job);
            }
        });
    }

    /// Returns false if the queue shut down while paused.
    async fn wait_unpaused(&self) -> bool {
        let mut rx = self.paused.subscribe();
        loop {
            if !*rx.borrow() {
                return true;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
                _ = self.shutdown.cancelled() => return false,
            }
        }
    }
}
