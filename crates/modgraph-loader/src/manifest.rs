//! Package manifest ingestion (package.json)
//!
//! Each dependency named in a manifest is located in a `node_modules`
//! directory and mapped to its entry point, so `import 'lodash'` resolves
//! to `file:///…/node_modules/lodash/index.js`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::resolve::{ResolutionError, Resolver};

/// Entry point used when a package declares no `main`
pub const DEFAULT_ENTRY_POINT: &str = "index.js";

/// Errors that can occur during manifest ingestion
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Failed to read a manifest file
    #[error("Failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse JSON
    #[error("Failed to parse manifest: {0}")]
    Parse(#[from] serde_json::Error),

    /// Dependency not installed in any `node_modules` above the project
    #[error("Package '{name}' not found in node_modules above {}", from.display())]
    PackageNotFound { name: String, from: PathBuf },

    #[error("Invalid package name: '{0}'")]
    InvalidPackageName(String),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

/// Package manifest (package.json)
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub version: Option<String>,

    /// Entry point relative to the package directory
    #[serde(default)]
    pub main: Option<String>,

    /// Runtime dependencies (name → version range)
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,

    /// Development-only dependencies
    #[serde(default)]
    pub dev_dependencies: BTreeMap<String, String>,
}

impl PackageManifest {
    /// Parse a manifest from a file
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&content)
    }

    /// Parse a manifest from a string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ManifestError> {
        Ok(serde_json::from_str(content)?)
    }

    /// `main`, or `index.js` when absent
    pub fn entry_point(&self) -> &str {
        self.main.as_deref().unwrap_or(DEFAULT_ENTRY_POINT)
    }

    /// Runtime then dev dependency names, without duplicates
    pub fn dependency_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.dependencies.keys().map(String::as_str).collect();
        for name in self.dev_dependencies.keys() {
            if !self.dependencies.contains_key(name) {
                names.push(name);
            }
        }
        names
    }
}

/// Validate a dependency name (`name` or `@scope/name`)
pub fn is_valid_package_name(name: &str) -> bool {
    fn valid_part(part: &str) -> bool {
        !part.is_empty()
            && !part.starts_with('.')
            && !part.starts_with('_')
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~'))
    }

    match name.strip_prefix('@') {
        Some(scoped) => match scoped.split_once('/') {
            Some((scope, package)) => valid_part(scope) && valid_part(package),
            None => false,
        },
        None => valid_part(name),
    }
}

/// Find `node_modules/<name>` in `project_dir` or any of its ancestors
fn locate_package(project_dir: &Path, name: &str) -> Option<PathBuf> {
    project_dir
        .ancestors()
        .map(|dir| dir.join("node_modules").join(name))
        .find(|dir| dir.join("package.json").is_file())
}

/// Map every dependency of `manifest` to its entry point.
///
/// Names already mapped to a `host:` module keep that mapping. Returns the
/// mappings added, in dependency order.
pub fn ingest_manifest(
    resolver: &Resolver,
    project_dir: &Path,
    manifest: &PackageManifest,
) -> Result<Vec<(String, Url)>, ManifestError> {
    let project_dir = std::path::absolute(project_dir).map_err(|source| ManifestError::Io {
        path: project_dir.to_path_buf(),
        source,
    })?;

    let mut added = Vec::new();
    for name in manifest.dependency_names() {
        if !is_valid_package_name(name) {
            return Err(ManifestError::InvalidPackageName(name.to_string()));
        }
        if let Some(existing) = resolver.mapping(name) {
            if existing.scheme() == "host" {
                warn!(name, target = %existing, "dependency shadows a host module, skipping");
                continue;
            }
        }

        let package_dir =
            locate_package(&project_dir, name).ok_or_else(|| ManifestError::PackageNotFound {
                name: name.to_string(),
                from: project_dir.clone(),
            })?;
        let package = PackageManifest::from_file(&package_dir.join("package.json"))?;
        let entry = package_dir.join(package.entry_point());
        let url = Url::from_file_path(&entry).map_err(|()| ManifestError::PackageNotFound {
            name: name.to_string(),
            from: project_dir.clone(),
        })?;

        debug!(name, target = %url, "mapping package");
        resolver.add_mapping(name, url.as_str())?;
        added.push((name.to_string(), url));
    }
    Ok(added)
}
