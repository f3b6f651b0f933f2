//! Phase contract, built-in phases, and the retrying executor.

mod builtin;
mod contract;
mod executor;

pub use builtin::{AnalysisPhase, DevelopmentPhase, FixerPhase, JudgePhase};
pub use contract::{
    AgentOutcome, AgentRequest, PhaseResult, PhaseRole, PhaseSpec, Severity, ToolCall,
    Vulnerability,
};
pub use executor::{DEFAULT_MAX_RETRIES, PhaseExecutor};
