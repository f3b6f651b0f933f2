pub mod approval;
pub mod cadence_config;
pub mod errors;
pub mod events;
pub mod external;
pub mod orchestrator;
pub mod phase;
pub mod pipeline;
pub mod queue;
pub mod story;
pub mod task;
