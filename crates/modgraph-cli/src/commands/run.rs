//! `modgraph run`: import a module and print its namespace.

use std::path::PathBuf;

use anyhow::{anyhow, Context};
use modgraph_loader::{LoadError, Loader, Namespace};
use tracing::debug;
use url::Url;

pub struct RunArgs {
    pub target: String,
    pub config: Option<PathBuf>,
    pub manifest: Option<PathBuf>,
    pub mappings: Vec<String>,
}

pub fn execute(args: RunArgs) -> anyhow::Result<()> {
    let mut builder = super::configured_builder(args.config.as_deref())?;
    if let Some(manifest) = args.manifest {
        builder = builder.manifest(manifest);
    }
    for mapping in &args.mappings {
        let (specifier, target) = parse_mapping(mapping)?;
        builder = builder.mapping(specifier, target);
    }
    let loader = builder.build().context("Failed to set up the loader")?;
    debug!(root = %args.target, mappings = loader.resolver().mappings().len(), "loader ready");

    // The loader is single-threaded; drive it on the current thread
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;

    match runtime.block_on(import_target(&loader, &args.target)) {
        Ok(namespace) => {
            println!("{}", render_namespace(&namespace));
            Ok(())
        }
        Err(e) => Err(anyhow!(describe_failure(&e))),
    }
}

/// `specifier=url`
fn parse_mapping(mapping: &str) -> anyhow::Result<(&str, &str)> {
    match mapping.split_once('=') {
        Some((specifier, target)) if !specifier.is_empty() && !target.is_empty() => {
            Ok((specifier, target))
        }
        _ => Err(anyhow!(
            "Invalid mapping '{}', expected SPECIFIER=URL",
            mapping
        )),
    }
}

/// Absolute URLs are imported as is, everything else is a file path
fn is_url(target: &str) -> bool {
    match Url::parse(target) {
        // One-letter schemes are Windows drive letters
        Ok(url) => url.scheme().len() > 1,
        Err(_) => false,
    }
}

async fn import_target(loader: &Loader, target: &str) -> Result<Namespace, LoadError> {
    if is_url(target) {
        loader.import(target).await
    } else {
        loader.import_path(target).await
    }
}

fn render_namespace(namespace: &Namespace) -> String {
    namespace.to_string()
}

fn describe_failure(error: &LoadError) -> String {
    match error.exception().and_then(|e| e.url()) {
        Some(url) => format!("{}\n    at {}", error, url),
        None => error.to_string(),
    }
}
