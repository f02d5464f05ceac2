//! Specifier resolution
//!
//! Turns an import specifier plus the referrer's URL into a canonical
//! absolute URL:
//! - `./x`, `../x` and `/x` are merged against the referrer
//! - anything else is a bare specifier, looked up in the name-mapping
//!   table first and parsed as an absolute URL (`host:console`) second

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, trace, warn};
use url::Url;

/// Errors that can occur during specifier resolution
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolutionError {
    /// The string handed to `import` is not an absolute URL
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Relative specifier with a referrer that cannot serve as a base
    #[error("Cannot resolve '{specifier}' relative to '{referrer}'")]
    InvalidReferrer { specifier: String, referrer: String },

    /// Bare specifier with no mapping and no absolute URL form
    #[error("Cannot resolve bare specifier '{specifier}' from '{referrer}'")]
    UnmappedBareSpecifier { specifier: String, referrer: String },

    /// Mapping target is not an absolute URL
    #[error("Invalid mapping target for '{specifier}': '{target}' ({reason})")]
    InvalidMappingTarget {
        specifier: String,
        target: String,
        reason: String,
    },

    /// Mapping table mutated while a load is in flight
    #[error("Cannot map '{specifier}' while modules are loading")]
    MappingFrozen { specifier: String },
}

/// Whether the specifier is resolved against its referrer
pub fn is_relative_specifier(specifier: &str) -> bool {
    specifier.starts_with("./") || specifier.starts_with("../") || specifier.starts_with('/')
}

/// Specifier resolver with a name-mapping table.
///
/// The table is read-only while any graph load runs; see [`Resolver::begin_job`].
#[derive(Debug, Default)]
pub struct Resolver {
    mappings: RefCell<BTreeMap<String, Url>>,
    active_jobs: Cell<usize>,
    revision: Cell<u64>,
}

/// Marks a graph load in flight; mapping mutation is refused until dropped
#[derive(Debug)]
pub struct JobGuard<'a> {
    resolver: &'a Resolver,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        let jobs = self.resolver.active_jobs.get();
        self.resolver.active_jobs.set(jobs.saturating_sub(1));
    }
}

impl Resolver {
    /// Create a resolver with an empty mapping table
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `specifier` as imported from `referrer`
    pub fn resolve(&self, specifier: &str, referrer: &str) -> Result<Url, ResolutionError> {
        let resolved = if is_relative_specifier(specifier) {
            let base = Url::parse(referrer).map_err(|_| ResolutionError::InvalidReferrer {
                specifier: specifier.to_string(),
                referrer: referrer.to_string(),
            })?;
            base.join(specifier)
                .map_err(|_| ResolutionError::InvalidReferrer {
                    specifier: specifier.to_string(),
                    referrer: referrer.to_string(),
                })?
        } else if let Some(mapped) = self.mappings.borrow().get(specifier) {
            trace!(specifier, target = %mapped, "mapped bare specifier");
            mapped.clone()
        } else {
            Url::parse(specifier).map_err(|_| ResolutionError::UnmappedBareSpecifier {
                specifier: specifier.to_string(),
                referrer: referrer.to_string(),
            })?
        };

        debug!(specifier, referrer, resolved = %resolved, "resolved specifier");
        Ok(resolved)
    }

    /// Map a bare specifier to an absolute URL, replacing any previous entry
    pub fn add_mapping(&self, specifier: &str, target: &str) -> Result<(), ResolutionError> {
        if self.is_frozen() {
            return Err(ResolutionError::MappingFrozen {
                specifier: specifier.to_string(),
            });
        }
        let url = Url::parse(target).map_err(|e| ResolutionError::InvalidMappingTarget {
            specifier: specifier.to_string(),
            target: target.to_string(),
            reason: e.to_string(),
        })?;
        debug!(specifier, target = %url, "added mapping");
        self.mappings.borrow_mut().insert(specifier.to_string(), url);
        self.bump_revision();
        Ok(())
    }

    /// Map each host module name to `host:<name>` unless already mapped
    pub fn register_host_modules<'a>(
        &self,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), ResolutionError> {
        for name in names {
            if self.mappings.borrow().contains_key(name) {
                continue;
            }
            match Url::parse(&format!("host:{}", name)) {
                Ok(url) => {
                    if self.is_frozen() {
                        return Err(ResolutionError::MappingFrozen {
                            specifier: name.to_string(),
                        });
                    }
                    self.mappings.borrow_mut().insert(name.to_string(), url);
                    self.bump_revision();
                }
                Err(e) => warn!(name, error = %e, "skipping host module with unusable name"),
            }
        }
        Ok(())
    }

    /// Current target of a mapping
    pub fn mapping(&self, specifier: &str) -> Option<Url> {
        self.mappings.borrow().get(specifier).cloned()
    }

    /// All mappings, sorted by specifier
    pub fn mappings(&self) -> Vec<(String, Url)> {
        self.mappings
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Counter bumped on every change to the mapping table
    pub fn revision(&self) -> u64 {
        self.revision.get()
    }

    fn bump_revision(&self) {
        self.revision.set(self.revision.get() + 1);
    }

    /// Freeze the mapping table for the lifetime of the guard
    pub fn begin_job(&self) -> JobGuard<'_> {
        self.active_jobs.set(self.active_jobs.get() + 1);
        JobGuard { resolver: self }
    }

    pub fn is_frozen(&self) -> bool {
        self.active_jobs.get() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_specifiers() {
        let resolver = Resolver::new();
        assert_eq!(
            resolver.resolve("./x", "file:///a/b.js").unwrap().as_str(),
            "file:///a/x"
        );
        assert_eq!(
            resolver.resolve("../x.js", "file:///a/b/c.js").unwrap().as_str(),
            "file:///a/x.js"
        );
        assert_eq!(
            resolver.resolve("/root.js", "file:///a/b/c.js").unwrap().as_str(),
            "file:///root.js"
        );
        assert_eq!(
            resolver.resolve("./x/../y.js", "file:///a/b.js").unwrap().as_str(),
            "file:///a/y.js"
        );
    }

    #[test]
    fn test_relative_needs_absolute_referrer() {
        let resolver = Resolver::new();
        let err = resolver.resolve("./x", "not a url").unwrap_err();
        assert!(matches!(err, ResolutionError::InvalidReferrer { .. }));

        let err = resolver.resolve("./x", "host:console").unwrap_err();
        assert!(matches!(err, ResolutionError::InvalidReferrer { .. }));
    }

    #[test]
    fn test_bare_specifiers() {
        let resolver = Resolver::new();
        let err = resolver.resolve("lodash", "file:///a.js").unwrap_err();
        assert_eq!(
            err,
            ResolutionError::UnmappedBareSpecifier {
                specifier: "lodash".into(),
                referrer: "file:///a.js".into(),
            }
        );

        // Scheme-qualified bare specifiers parse directly
        assert_eq!(
            resolver.resolve("host:console", "file:///a.js").unwrap().as_str(),
            "host:console"
        );

        resolver
            .add_mapping("lodash", "file:///opt/lodash/index.js")
            .unwrap();
        assert_eq!(
            resolver.resolve("lodash", "file:///a.js").unwrap().as_str(),
            "file:///opt/lodash/index.js"
        );
    }

    #[test]
    fn test_mapping_wins_over_absolute_parse() {
        let resolver = Resolver::new();
        resolver.add_mapping("host:fs", "file:///shim/fs.js").unwrap();
        assert_eq!(
            resolver.resolve("host:fs", "file:///a.js").unwrap().as_str(),
            "file:///shim/fs.js"
        );
    }

    #[test]
    fn test_invalid_mapping_target() {
        let resolver = Resolver::new();
        let err = resolver.add_mapping("x", "relative/path.js").unwrap_err();
        assert!(matches!(err, ResolutionError::InvalidMappingTarget { .. }));
        assert!(resolver.mappings().is_empty());
    }

    #[test]
    fn test_mappings_frozen_during_job() {
        let resolver = Resolver::new();
        {
            let _job = resolver.begin_job();
            let err = resolver.add_mapping("x", "file:///x.js").unwrap_err();
            assert_eq!(err, ResolutionError::MappingFrozen { specifier: "x".into() });
        }
        assert!(!resolver.is_frozen());
        resolver.add_mapping("x", "file:///x.js").unwrap();
    }

    #[test]
    fn test_register_host_modules() {
        let resolver = Resolver::new();
        resolver.add_mapping("math", "file:///my-math.js").unwrap();
        resolver.register_host_modules(["console", "math"]).unwrap();

        assert_eq!(resolver.mapping("console").unwrap().as_str(), "host:console");
        // Existing mappings are kept
        assert_eq!(resolver.mapping("math").unwrap().as_str(), "file:///my-math.js");
    }

    #[test]
    fn test_revision_tracks_mapping_changes() {
        let resolver = Resolver::new();
        assert_eq!(resolver.revision(), 0);
        resolver.add_mapping("x", "file:///x.js").unwrap();
        assert_eq!(resolver.revision(), 1);

        // Refused and no-op changes keep the revision
        assert!(resolver.add_mapping("y", "not absolute").is_err());
        resolver.register_host_modules(["x"]).unwrap();
        assert_eq!(resolver.revision(), 1);

        resolver.register_host_modules(["console"]).unwrap();
        assert_eq!(resolver.revision(), 2);
    }

    #[test]
    fn test_is_relative_specifier() {
        assert!(is_relative_specifier("./a"));
        assert!(is_relative_specifier("../a"));
        assert!(is_relative_specifier("/a"));
        assert!(!is_relative_specifier("a"));
        assert!(!is_relative_specifier(".a"));
        assert!(!is_relative_specifier("file:///a"));
    }
}
