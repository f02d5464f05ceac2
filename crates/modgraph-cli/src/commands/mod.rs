//! Subcommand implementations

pub mod resolve;
pub mod run;

use std::path::Path;

use anyhow::Context;
use modgraph_loader::{LoaderBuilder, LoaderConfig};

/// Builder with the configuration file applied, if one was given
pub fn configured_builder(config: Option<&Path>) -> anyhow::Result<LoaderBuilder> {
    let builder = LoaderBuilder::new();
    match config {
        Some(path) => {
            let config = LoaderConfig::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?;
            Ok(builder.config(&config))
        }
        None => Ok(builder),
    }
}
