//! Orchestration engine: execution context, per-task tracking, the story
//! loop, and the pipeline runner.

mod context;
mod runner;
mod stories;
mod tracking;

pub use context::{ContextVars, ExecutionContext, StoryCursor};
pub use runner::{
    ExecuteOptions, Milestone, OrchestrationResult, Orchestrator, ProgressHook,
};
pub use tracking::{TaskTracking, TrackingStore};
