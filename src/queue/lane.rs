//! Queue lanes: backlog, concurrency limit, and admission rate limiting.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;

use crate::queue::job::{Job, LaneKind};
use crate::queue::retry::RetryPolicy;

/// Admission rate limit: at most `max_jobs` dispatched per `window`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub max_jobs: u32,
    pub window: Duration,
}

/// Per-lane configuration.
#[derive(Debug, Clone)]
pub struct LaneConfig {
    pub kind: LaneKind,
    /// Jobs processed simultaneously in this lane.
    pub concurrency: usize,
    pub rate_limit: Option<RateLimit>,
    pub retry: RetryPolicy,
    /// A job running longer than this counts as a failed attempt and
    /// re-enters the retry path (the in-process stand-in for
    /// crashed-worker requeue).
    pub stall_timeout: Option<Duration>,
}

impl LaneConfig {
    pub fn normal() -> Self {
        Self {
            kind: LaneKind::Normal,
            concurrency: 4,
            rate_limit: None,
            retry: RetryPolicy::default(),
            stall_timeout: None,
        }
    }

    pub fn elevated() -> Self {
        Self {
            kind: LaneKind::Elevated,
            concurrency: 2,
            rate_limit: None,
            retry: RetryPolicy::default(),
            stall_timeout: None,
        }
    }

    /// The commit lane is strictly sequential.
    pub fn commit() -> Self {
        Self {
            kind: LaneKind::Commit,
            concurrency: 1,
            rate_limit: None,
            retry: RetryPolicy::default(),
            stall_timeout: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_rate_limit(mut self, max_jobs: u32, window: Duration) -> Self {
        self.rate_limit = Some(RateLimit { max_jobs, window });
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = Some(timeout);
        self
    }
}

/// One lane: a FIFO backlog plus the primitives its dispatcher needs.
pub(crate) struct Lane {
    pub(crate) config: LaneConfig,
    backlog: Mutex<VecDeque<Job>>,
    pub(crate) notify: Notify,
    pub(crate) semaphore: Arc<Semaphore>,
    admissions: Mutex<VecDeque<Instant>>,
}

impl Lane {
    pub(crate) fn new(config: LaneConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        Self {
            config,
            backlog: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            semaphore,
            admissions: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, job: Job) {
        self.backlog.lock().unwrap().push_back(job);
        self.notify.notify_one();
    }

    pub(crate) fn pop(&self) -> Option<Job> {
        self.backlog.lock().unwrap().pop_front()
    }

    /// Remove a waiting job outright. Returns true if it was queued here.
    pub(crate) fn remove(&self, task_id: &str) -> bool {
        let mut backlog = self.backlog.lock().unwrap();
        let before = backlog.len();
        backlog.retain(|job| job.id != task_id);
        backlog.len() < before
    }

    pub(crate) fn backlog_len(&self) -> usize {
        self.backlog.lock().unwrap().len()
    }

    /// Wait until the rate limiter admits another dispatch.
    pub(crate) async fn admit(&self) {
        let Some(limit) = self.config.rate_limit else {
            return;
        };
        loop {
            let wait = {
                let mut admissions = self.admissions.lock().unwrap();
                let now = Instant::now();
                while admissions
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= limit.window)
                {
                    admissions.pop_front();
                }
                if (admissions.len() as u32) < limit.max_jobs {
                    admissions.push_back(now);
                    return;
                }
                // Sleep until the oldest admission ages out of the window.
                limit.window - now.duration_since(*admissions.front().unwrap())
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job::JobPayload;

    fn job(id: &str) -> Job {
        Job::orchestrate(id, JobPayload::new("quick_fix", "/w"))
    }

    #[test]
    fn test_backlog_is_fifo() {
        let lane = Lane::new(LaneConfig::normal());
        lane.push(job("a"));
        lane.push(job("b"));
        assert_eq!(lane.pop().unwrap().id, "a");
        assert_eq!(lane.pop().unwrap().id, "b");
        assert!(lane.pop().is_none());
    }

    #[test]
    fn test_remove_waiting_job() {
        let lane = Lane::new(LaneConfig::normal());
        lane.push(job("a"));
        lane.push(job("b"));
        assert!(lane.remove("a"));
        assert!(!lane.remove("a"));
        assert_eq!(lane.backlog_len(), 1);
        assert_eq!(lane.pop().unwrap().id, "b");
    }

    #[test]
    fn test_commit_lane_is_sequential() {
        let lane = Lane::new(LaneConfig::commit());
        assert_eq!(lane.config.concurrency, 1);
        assert_eq!(lane.semaphore.available_permits(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_delays_admission() {
        let lane = Lane::new(
            LaneConfig::normal().with_rate_limit(2, Duration::from_secs(60)),
        );

        let start = Instant::now();
        lane.admit().await;
        lane.admit().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        // Third admission must wait for the window to roll over.
        lane.admit().await;
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_no_rate_limit_admits_immediately() {
        let lane = Lane::new(LaneConfig::normal());
        lane.admit().await;
        lane.admit().await;
    }
}
