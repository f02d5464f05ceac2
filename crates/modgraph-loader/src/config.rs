//! Loader configuration (modgraph.toml)
//!
//! ```toml
//! manifest = "package.json"
//! host_modules = true
//!
//! [content_kinds]
//! "text/x-module" = "script-source"
//!
//! [extensions]
//! ".jsm" = "text/javascript"
//!
//! [imports]
//! lodash = "file:///opt/lodash/index.js"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::init::ContentKind;

/// Errors that can occur while loading a configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Extension keys must be a non-empty run of extension characters
    #[error("Invalid extension '{0}'")]
    InvalidExtension(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoaderConfig {
    /// Extra content-kind aliases
    pub content_kinds: BTreeMap<String, ContentKind>,

    /// Disk fetcher extension → content kind overrides
    pub extensions: BTreeMap<String, String>,

    /// Static bare-specifier mappings
    pub imports: BTreeMap<String, String>,

    /// `package.json` to ingest, relative to the config file
    pub manifest: Option<PathBuf>,

    /// Map built-in host modules by their bare names
    pub host_modules: bool,

    /// Directory relative paths are taken from
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            content_kinds: BTreeMap::new(),
            extensions: BTreeMap::new(),
            imports: BTreeMap::new(),
            manifest: None,
            host_modules: true,
            base_dir: None,
        }
    }
}

impl LoaderConfig {
    /// Load a config file; relative paths in it are taken from its directory
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_str(&content)?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        Ok(config)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: LoaderConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for extension in self.extensions.keys() {
            let bare = extension.strip_prefix('.').unwrap_or(extension);
            if bare.is_empty() || !bare.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(ConfigError::InvalidExtension(extension.clone()));
            }
        }
        Ok(())
    }

    /// Manifest path joined onto the config file's directory
    pub fn manifest_path(&self) -> Option<PathBuf> {
        let manifest = self.manifest.as_ref()?;
        Some(match &self.base_dir {
            Some(base) if manifest.is_relative() => base.join(manifest),
            _ => manifest.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = LoaderConfig::from_str(
            r#"
manifest = "package.json"
host_modules = false

[content_kinds]
"text/x-module" = "script-source"
"application/x-wasm" = "binary-module"

[extensions]
".jsm" = "text/x-module"

[imports]
lodash = "file:///opt/lodash/index.js"
"#,
        )
        .unwrap();

        assert_eq!(config.manifest, Some(PathBuf::from("package.json")));
        assert!(!config.host_modules);
        assert_eq!(
            config.content_kinds["application/x-wasm"],
            ContentKind::BinaryModule
        );
        assert_eq!(config.extensions[".jsm"], "text/x-module");
        assert_eq!(config.imports["lodash"], "file:///opt/lodash/index.js");
    }

    #[test]
    fn test_defaults() {
        let config = LoaderConfig::from_str("").unwrap();
        assert_eq!(config, LoaderConfig::default());
        assert!(config.host_modules);
        assert!(config.manifest_path().is_none());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(matches!(
            LoaderConfig::from_str("cache_size = 10"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            LoaderConfig::from_str("[content_kinds]\n\"text/plain\" = \"plain-text\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_invalid_extension() {
        let err = LoaderConfig::from_str("[extensions]\n\"./x\" = \"text/javascript\"").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidExtension(ref e) if e == "./x"));
    }

    #[test]
    fn test_manifest_relative_to_config_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("modgraph.toml");
        std::fs::write(&path, "manifest = \"app/package.json\"").unwrap();

        let config = LoaderConfig::from_file(&path).unwrap();
        assert_eq!(
            config.manifest_path(),
            Some(temp.path().join("app").join("package.json"))
        );
    }
}
