//! Job queue and worker pool: priority lanes, retry with backoff, and the
//! worker that drives the orchestrator.

mod job;
mod lane;
#[allow(clippy::module_inception)]
mod queue;
mod retry;
mod worker;

pub use job::{Job, JobKind, JobPayload, JobState, LaneKind};
pub use lane::{LaneConfig, RateLimit};
pub use queue::{JobHandler, JobOutcome, JobQueue, QueueConfig};
pub use retry::RetryPolicy;
pub use worker::Worker;
