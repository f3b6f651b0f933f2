//! The generic phase executor.
//!
//! Wraps every phase invocation in a bounded retry loop: up to
//! `max_retries` attempts with the *same* request and no backoff (delay
//! between attempts belongs to the queue tier). Validation failures and
//! blocking security findings terminate immediately without consuming
//! retries. The executor never lets an error escape — callers always
//! receive a `PhaseResult`.

use std::sync::Arc;

use crate::errors::PhaseError;
use crate::external::{AgentRuntime, SecurityScanner};
use crate::orchestrator::{ExecutionContext, TrackingStore};
use crate::phase::{AgentOutcome, PhaseResult, PhaseSpec, Vulnerability};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub struct PhaseExecutor {
    runtime: Arc<dyn AgentRuntime>,
    scanner: Arc<dyn SecurityScanner>,
    tracking: Arc<TrackingStore>,
    max_retries: u32,
}

impl PhaseExecutor {
    pub fn new(
        runtime: Arc<dyn AgentRuntime>,
        scanner: Arc<dyn SecurityScanner>,
        tracking: Arc<TrackingStore>,
    ) -> Self {
        Self {
            runtime,
            scanner,
            tracking,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Execute one phase against the shared context.
    ///
    /// State machine: VALIDATE → RUN → INTERPRET, looping back to RUN on a
    /// recoverable failure while attempts remain. Validation failure and
    /// blocking vulnerabilities are terminal on the spot.
    pub async fn run(&self, phase: &dyn PhaseSpec, ctx: &ExecutionContext) -> PhaseResult {
        let name = phase.name().to_string();

        // Predecessor gating: a phase never runs until its declared
        // predecessor succeeded, unless the pipeline omits that
        // predecessor entirely.
        if let Some(predecessor) = phase.predecessor()
            && ctx.pipeline_contains(predecessor)
            && !ctx.succeeded(predecessor)
        {
            let err = PhaseError::PredecessorUnsatisfied {
                phase: name.clone(),
                predecessor: predecessor.to_string(),
            };
            tracing::warn!(task_id = %ctx.task.id, phase = %name, "{}", err);
            return PhaseResult::fail(err.to_string());
        }

        if !phase.validate(ctx) {
            let err = PhaseError::ValidationFailed {
                phase: name.clone(),
                reason: "phase preconditions not met".to_string(),
            };
            tracing::warn!(task_id = %ctx.task.id, phase = %name, "{}", err);
            return PhaseResult::fail(err.to_string());
        }

        // Retries reuse the same request.
        let request = phase.build_request(ctx);
        let mut last_error = String::new();

        for attempt in 1..=self.max_retries {
            if ctx.is_cancelled() {
                return PhaseResult::fail(
                    PhaseError::Cancelled {
                        phase: name.clone(),
                    }
                    .to_string(),
                );
            }

            tracing::debug!(
                task_id = %ctx.task.id,
                phase = %name,
                attempt,
                max = self.max_retries,
                "Running phase attempt"
            );

            let raw = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return PhaseResult::fail(
                        PhaseError::Cancelled { phase: name.clone() }.to_string(),
                    );
                }
                raw = self.runtime.run(request.clone()) => raw,
            };

            let outcome = match raw {
                Ok(outcome) => outcome,
                Err(e) => {
                    last_error = format!("agent execution failed: {:#}", e);
                    tracing::warn!(
                        task_id = %ctx.task.id,
                        phase = %name,
                        attempt,
                        error = %last_error,
                        "Phase attempt failed"
                    );
                    continue;
                }
            };

            self.tracking
                .record_tool_calls(&ctx.task.id, outcome.tool_calls.len() as u32);

            // Merge scanner findings over the outcome's own report, then
            // short-circuit on anything the scanner blocks.
            let vulnerabilities = self.collect_vulnerabilities(&outcome, ctx);
            self.tracking
                .record_vulnerabilities(&ctx.task.id, &vulnerabilities);
            if let Some(blocking) = vulnerabilities
                .iter()
                .find(|v| self.scanner.should_block(v))
            {
                let err = PhaseError::SecurityBlocked {
                    phase: name.clone(),
                    rule: blocking.rule.clone(),
                    description: blocking.description.clone(),
                };
                tracing::error!(task_id = %ctx.task.id, phase = %name, "{}", err);
                return PhaseResult::fail(err.to_string());
            }

            let result = phase.interpret(&outcome, ctx);
            if result.success {
                self.tracking.record_phase_completed(&ctx.task.id);
                return result;
            }

            last_error = result
                .error
                .clone()
                .unwrap_or_else(|| "phase reported failure without an error".to_string());
            tracing::warn!(
                task_id = %ctx.task.id,
                phase = %name,
                attempt,
                error = %last_error,
                "Phase attempt rejected by interpreter"
            );

            if attempt == self.max_retries {
                return result;
            }
        }

        PhaseResult::fail(
            PhaseError::ExecutionFailed {
                phase: name,
                attempts: self.max_retries,
                message: last_error,
            }
            .to_string(),
        )
    }

    fn collect_vulnerabilities(
        &self,
        outcome: &AgentOutcome,
        ctx: &ExecutionContext,
    ) -> Vec<Vulnerability> {
        let mut vulnerabilities = outcome.vulnerabilities.clone();
        for tool_call in &outcome.tool_calls {
            vulnerabilities.extend(self.scanner.analyze(tool_call, &ctx.workspace));
        }
        vulnerabilities
    }
}
