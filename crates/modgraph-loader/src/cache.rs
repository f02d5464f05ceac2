//! Module cache
//!
//! Provides per-loader deduplication of:
//! - Module records, one per canonical URL
//! - Initialization futures (fetch + content-kind initialization), shared
//!   by every job that needs the record and memoized with their outcome
//! - Resolution and link failures of a graph load, keyed by root URL and
//!   valid for one revision of the mapping table

use std::cell::{Cell, RefCell};

use futures::future::{self, LocalBoxFuture, Shared};
use futures::FutureExt;
use modgraph_script::{Exception, ModuleRecord};
use rustc_hash::FxHashMap;
use tracing::trace;
use url::Url;

use crate::error::LoadError;

/// Initialization of one record, shared across graph load jobs
pub type InitFuture = Shared<LocalBoxFuture<'static, Result<(), LoadError>>>;

/// Cached module entry
struct CacheEntry {
    url: Url,
    record: ModuleRecord,
    /// Started on first discovery, then kept for its memoized outcome
    init: Option<InitFuture>,
}

/// Module cache for one loader
#[derive(Default)]
pub struct ModuleCache {
    /// Records by canonical URL
    entries: RefCell<FxHashMap<String, CacheEntry>>,
    /// Failed graph loads by root URL, with the mapping revision they saw
    job_failures: RefCell<FxHashMap<String, (u64, LoadError)>>,
    /// Cache hit/miss statistics
    hits: Cell<usize>,
    misses: Cell<usize>,
}

impl ModuleCache {
    /// Create a new empty module cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the record for `url`, creating an empty one on first reference
    pub fn get_or_create(&self, url: &Url) -> ModuleRecord {
        let mut entries = self.entries.borrow_mut();
        if let Some(entry) = entries.get(url.as_str()) {
            self.hits.set(self.hits.get() + 1);
            trace!(url = %url, status = %entry.record.status(), "module cache hit");
            return entry.record.clone();
        }

        self.misses.set(self.misses.get() + 1);
        let record = ModuleRecord::new(url.as_str());
        entries.insert(
            url.to_string(),
            CacheEntry {
                url: url.clone(),
                record: record.clone(),
                init: None,
            },
        );
        record
    }

    /// Get a record without creating one. Does not touch the statistics.
    pub fn get(&self, url: &str) -> Option<ModuleRecord> {
        self.entries.borrow().get(url).map(|e| e.record.clone())
    }

    /// The record's initialization, started with `start` if this is the
    /// first request for it.
    ///
    /// Check and insert happen without an intervening await, so concurrent
    /// jobs always observe the same future.
    pub(crate) fn initialization<F>(&self, record: &ModuleRecord, start: F) -> InitFuture
    where
        F: FnOnce(Url, ModuleRecord) -> LocalBoxFuture<'static, Result<(), LoadError>>,
    {
        let mut entries = self.entries.borrow_mut();
        let entry = match entries.get_mut(record.url()) {
            Some(entry) if entry.record.ptr_eq(record) => entry,
            _ => {
                let error = LoadError::Link(Exception::link(&format!(
                    "Module '{}' is not owned by this loader",
                    record.url()
                )));
                return future::ready(Err(error)).boxed_local().shared();
            }
        };
        if let Some(init) = &entry.init {
            trace!(url = %entry.url, "joining existing initialization");
            return init.clone();
        }
        let init = start(entry.url.clone(), entry.record.clone()).shared();
        entry.init = Some(init.clone());
        init
    }

    /// Failure of an earlier load of `url` under the same mapping revision
    pub(crate) fn job_failure(&self, url: &str, revision: u64) -> Option<LoadError> {
        match self.job_failures.borrow().get(url) {
            Some((seen, error)) if *seen == revision => Some(error.clone()),
            _ => None,
        }
    }

    pub(crate) fn remember_job_failure(&self, url: &str, revision: u64, error: &LoadError) {
        self.job_failures
            .borrow_mut()
            .insert(url.to_string(), (revision, error.clone()));
    }

    /// Whether the record's initialization has been started
    pub fn is_initializing(&self, url: &str) -> bool {
        self.entries
            .borrow()
            .get(url)
            .map(|e| e.init.is_some())
            .unwrap_or(false)
    }

    /// Check if a URL is in the cache
    pub fn contains(&self, url: &str) -> bool {
        self.entries.borrow().contains_key(url)
    }

    /// Get the number of cached records
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// All cached URLs, sorted
    pub fn urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.entries.borrow().keys().cloned().collect();
        urls.sort();
        urls
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.get(),
            misses: self.misses.get(),
        }
    }
}

impl Drop for ModuleCache {
    fn drop(&mut self) {
        // Records in import cycles hold each other; cut the edges
        for entry in self.entries.get_mut().values() {
            entry.record.release_dependencies();
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cached entries
    pub entries: usize,
    /// Number of cache hits
    pub hits: usize,
    /// Number of cache misses
    pub misses: usize,
}

impl CacheStats {
    /// Get cache hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::rc::Rc;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_one_record_per_url() {
        let cache = ModuleCache::new();
        let a = cache.get_or_create(&url("file:///a.js"));
        let b = cache.get_or_create(&url("file:///a.js"));
        let c = cache.get_or_create(&url("file:///c.js"));

        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert_eq!(cache.len(), 2);
        assert!(cache.contains("file:///a.js"));
        assert!(cache.get("file:///missing.js").is_none());
    }

    #[test]
    fn test_initialization_is_started_once() {
        let cache = ModuleCache::new();
        let record = cache.get_or_create(&url("file:///a.js"));
        let starts = Rc::new(Cell::new(0));

        let start = |starts: Rc<Cell<usize>>| {
            move |_url: Url, record: ModuleRecord| {
                starts.set(starts.get() + 1);
                async move {
                    record.compile("export default 1;")?;
                    Ok::<(), LoadError>(())
                }
                .boxed_local()
            }
        };

        assert!(!cache.is_initializing("file:///a.js"));
        let first = cache.initialization(&record, start(starts.clone()));
        let second = cache.initialization(&record, start(starts.clone()));
        assert!(cache.is_initializing("file:///a.js"));

        block_on(first).unwrap();
        block_on(second).unwrap();
        assert_eq!(starts.get(), 1);
    }

    #[test]
    fn test_failure_is_memoized() {
        let cache = ModuleCache::new();
        let record = cache.get_or_create(&url("file:///a.js"));

        let failing = |_url: Url, _record: ModuleRecord| {
            let error = LoadError::from(crate::fetch::FetchError::NotFound {
                url: "file:///a.js".into(),
            });
            future::ready(Err(error)).boxed_local()
        };
        let first = block_on(cache.initialization(&record, failing)).unwrap_err();
        let second = block_on(cache.initialization(&record, |_, _| {
            future::ready(Ok(())).boxed_local()
        }))
        .unwrap_err();
        assert!(first.is_same(&second));
    }

    #[test]
    fn test_job_failure_is_scoped_to_revision() {
        let cache = ModuleCache::new();
        let error = LoadError::from(crate::resolve::ResolutionError::UnmappedBareSpecifier {
            specifier: "lodash".into(),
            referrer: "file:///main.js".into(),
        });
        assert!(cache.job_failure("file:///main.js", 0).is_none());

        cache.remember_job_failure("file:///main.js", 0, &error);
        assert!(cache.job_failure("file:///main.js", 0).unwrap().is_same(&error));
        assert!(cache.job_failure("file:///main.js", 1).is_none());
        assert!(cache.job_failure("file:///other.js", 0).is_none());
    }

    #[test]
    fn test_foreign_record_is_rejected() {
        let cache = ModuleCache::new();
        let foreign = ModuleRecord::new("file:///a.js");
        let err = block_on(cache.initialization(&foreign, |_, _| {
            future::ready(Ok(())).boxed_local()
        }))
        .unwrap_err();
        assert!(matches!(err, LoadError::Link(_)));
    }

    #[test]
    fn test_cache_stats() {
        let cache = ModuleCache::new();

        // One miss
        cache.get_or_create(&url("file:///a.js"));

        // Two hits
        cache.get_or_create(&url("file:///a.js"));
        cache.get_or_create(&url("file:///a.js"));

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_ratio() - 0.666).abs() < 0.01);
        assert_eq!(CacheStats { entries: 0, hits: 0, misses: 0 }.hit_ratio(), 0.0);
    }
}
