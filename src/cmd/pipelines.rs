//! `cadence pipelines` — enumerate registered pipelines.

use anyhow::Result;

use cadence::pipeline::default_registry;

pub fn execute() -> Result<()> {
    let registry = default_registry();
    let pipelines = registry.list_all();
    if pipelines.is_empty() {
        println!("No pipelines registered");
        return Ok(());
    }

    for pipeline in pipelines {
        println!("{}", pipeline.name());
        println!("  {}", pipeline.description());
        println!("  phases: {}", pipeline.phase_names().join(" -> "));
    }
    Ok(())
}
