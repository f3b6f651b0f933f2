//! The phase execution contract.
//!
//! A phase is a single step in a pipeline. Phases are stateless and
//! reusable across tasks: all per-execution data flows through the
//! [`ExecutionContext`]. The contract is deliberately a small trait rather
//! than a class hierarchy — each phase implements validate/build/interpret
//! and a single generic executor owns the retry loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::orchestrator::ExecutionContext;

/// Severity of a detected vulnerability.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

/// A vulnerability reported by the agent runtime / security scanner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vulnerability {
    /// Scanner rule that fired (e.g. "secrets-in-diff").
    pub rule: String,
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// A single tool invocation made by the agent during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

/// Request handed to the agent-execution runtime for one phase attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub task_id: String,
    pub phase: String,
    /// Agent-type tag, used by the runtime to pick a persona/toolset.
    pub agent_type: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub workspace: PathBuf,
}

/// Raw result of one agent run, as returned by the external runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub final_output: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub turns: u32,
    #[serde(default)]
    pub vulnerabilities: Vec<Vulnerability>,
}

impl AgentOutcome {
    /// Convenience constructor for a plain text outcome.
    pub fn text(output: &str) -> Self {
        Self {
            final_output: output.to_string(),
            turns: 1,
            ..Default::default()
        }
    }
}

/// Interpreted result of one phase invocation, stored in the execution's
/// results map keyed by phase name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub success: bool,
    /// Opaque output payload; later phases read it (e.g. Judge reads
    /// Development's output).
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl PhaseResult {
    pub fn ok(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            metadata: HashMap::new(),
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Functional role of a phase within a pipeline. The story loop locates
/// the Development/Review/Fix phases by role rather than by name.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseRole {
    Analysis,
    Development,
    Review,
    Fix,
    Other,
}

impl PhaseRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Development => "development",
            Self::Review => "review",
            Self::Fix => "fix",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for PhaseRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The per-phase execution contract.
///
/// `run` is deliberately absent: execution is delegated to the external
/// agent runtime by the [`PhaseExecutor`](super::PhaseExecutor), which owns
/// the retry loop and the security short-circuit. Implementations stay
/// pure: inspect the context, build a request, interpret an outcome.
pub trait PhaseSpec: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Agent-type tag forwarded to the runtime.
    fn agent_type(&self) -> &str;

    fn role(&self) -> PhaseRole {
        PhaseRole::Other
    }

    /// The phase this one reads output from, if any. The executor refuses
    /// to run a phase whose declared predecessor is part of the pipeline
    /// but has not produced a successful result; a pipeline that omits the
    /// predecessor entirely waives the check.
    fn predecessor(&self) -> Option<&str> {
        None
    }

    /// Check preconditions. Returning false fails the phase immediately
    /// with a validation error; the runtime is never invoked.
    fn validate(&self, ctx: &ExecutionContext) -> bool;

    /// Build the agent request for this phase. Called once per phase
    /// invocation — retries reuse the same request.
    fn build_request(&self, ctx: &ExecutionContext) -> AgentRequest;

    /// Interpret the raw agent outcome into a phase result. A result with
    /// `success == false` re-enters the executor's retry loop while
    /// attempts remain.
    fn interpret(&self, outcome: &AgentOutcome, ctx: &ExecutionContext) -> PhaseResult;
}
