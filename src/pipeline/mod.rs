//! Pipeline definitions and registry.

mod registry;

pub use registry::{Pipeline, PipelineRegistry, default_registry};
