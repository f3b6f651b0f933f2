//! Typed error hierarchy for the Cadence orchestrator.
//!
//! Four top-level enums cover the four subsystems:
//! - `OrchestratorError` — task/pipeline resolution and infrastructure failures
//! - `PhaseError` — per-phase execution failures
//! - `ApprovalError` — approval-gate failures
//! - `QueueError` — job queue and worker-pool failures

use thiserror::Error;

/// Errors from the orchestrator subsystem.
///
/// The orchestrator folds *domain* failures (a phase failed, a human
/// rejected an output) into the `OrchestrationResult` it returns; this enum
/// is reserved for infrastructure faults that should escape to the worker
/// and engage the queue's retry machinery.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Task store error while loading task {id}: {source}")]
    TaskLoadFailed {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to persist status {status} for task {id}: {source}")]
    StatusUpdateFailed {
        id: String,
        status: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from a single phase execution.
///
/// The phase executor never lets these escape — they are rendered into the
/// `error` field of the `PhaseResult` handed back to the orchestrator — but
/// the typed forms keep the failure classes distinct and testable.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Phase {phase} validation failed: {reason}")]
    ValidationFailed { phase: String, reason: String },

    #[error("Phase {phase} requires a successful {predecessor} result")]
    PredecessorUnsatisfied { phase: String, predecessor: String },

    #[error("Phase {phase} failed after {attempts} attempts: {message}")]
    ExecutionFailed {
        phase: String,
        attempts: u32,
        message: String,
    },

    #[error("Security violation in phase {phase}: {rule} ({description})")]
    SecurityBlocked {
        phase: String,
        rule: String,
        description: String,
    },

    #[error("Phase {phase} cancelled")]
    Cancelled { phase: String },
}

/// Errors from the approval gate.
#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("An approval request is already pending for task {task_id} phase {phase}")]
    AlreadyPending { task_id: String, phase: String },

    #[error("Approval request for task {task_id} phase {phase} timed out")]
    Timeout { task_id: String, phase: String },

    #[error("Approval request for task {task_id} phase {phase} was abandoned")]
    Abandoned { task_id: String, phase: String },
}

/// Errors from the job queue and worker pool.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Unknown lane: {lane}")]
    UnknownLane { lane: String },

    #[error("Queue is shutting down, job {task_id} rejected")]
    QueueClosed { task_id: String },

    #[error("No job found for task {task_id}")]
    JobNotFound { task_id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
