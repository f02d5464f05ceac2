//! `modgraph resolve`: print the URL a specifier resolves to.

use std::path::Path;

use anyhow::Context;

pub fn execute(specifier: &str, referrer: &str, config: Option<&Path>) -> anyhow::Result<()> {
    let loader = super::configured_builder(config)?
        .build()
        .context("Failed to set up the loader")?;
    let url = loader
        .resolve(specifier, referrer)
        .with_context(|| format!("Cannot resolve '{}'", specifier))?;
    println!("{}", url);
    Ok(())
}
