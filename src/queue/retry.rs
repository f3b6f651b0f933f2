//! Queue-level retry policy.
//!
//! This is the tier that owns backoff: in-process phase retries (the
//! executor's) deliberately re-run immediately, while failed *jobs* wait
//! out an exponentially growing delay before re-entering their lane.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff retry policy for failed jobs.
///
/// `max_retries` counts retry attempts after the initial run, each
/// preceded by `base_delay * 2^n`: with the defaults a job failing
/// persistently waits 5s, 10s, then 20s before its final attempt and is
/// dead-lettered when that one fails too.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// No retries at all; the first failure is terminal.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before the retry following `retries_so_far` failures.
    pub fn delay_for(&self, retries_so_far: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(retries_so_far)
    }

    /// Whether a job that has already been retried `retries_so_far` times
    /// should be dead-lettered instead of retried again.
    pub fn is_exhausted(&self, retries_so_far: u32) -> bool {
        retries_so_far >= self.max_retries
    }
}
