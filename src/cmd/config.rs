//! `cadence config` — show the effective configuration.

use std::path::Path;

use anyhow::{Context, Result};

use cadence::cadence_config::CadenceConfig;

pub fn execute(project_dir: &Path) -> Result<()> {
    let config = CadenceConfig::load_or_default(project_dir)?;
    let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
    println!("{}", rendered);
    Ok(())
}
