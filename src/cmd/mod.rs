//! CLI subcommand implementations.

pub mod config;
pub mod pipelines;
pub mod run;
