//! Resource fetching
//!
//! A fetcher maps a URL to raw bytes plus a content kind. [`SchemeFetcher`]
//! dispatches on the URL scheme; the concrete fetchers cover on-disk files,
//! host modules, in-memory resources and plain closures.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::rc::Rc;

use futures::future::{self, LocalBoxFuture};
use futures::FutureExt;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

use crate::host::HostModules;

/// Content kind of module script source
pub const SCRIPT_SOURCE_KIND: &str = "text/javascript";
/// Content kind of portable binary modules
pub const BINARY_MODULE_KIND: &str = "application/wasm";
/// Content kind of host modules, bridged in by name alone
pub const HOST_MODULE_KIND: &str = "application/vnd.modgraph.host-module";
/// Content kind parameter marking a host module free of side effects
pub const PURE_PARAMETER: &str = "sideEffects=false";

/// Errors that can occur while fetching a resource
#[derive(Debug, Error)]
pub enum FetchError {
    /// No fetcher registered for the URL scheme
    #[error("Unsupported URL scheme '{scheme}' in {url}")]
    UnsupportedScheme { url: String, scheme: String },

    /// Nothing exists at the URL
    #[error("Module not found: {url}")]
    NotFound { url: String },

    /// The URL does not denote a local file path
    #[error("Not a file path: {url}")]
    InvalidFilePath { url: String },

    /// File extension missing from the extension map
    #[error("Unknown content kind for {url} (extension '{extension}')")]
    UnknownContentKind { url: String, extension: String },

    /// Underlying read failure
    #[error("Failed to read {url}: {source}")]
    Io {
        url: String,
        #[source]
        source: io::Error,
    },

    /// Failure reported by a custom fetcher
    #[error("Failed to fetch {url}: {reason}")]
    Failed { url: String, reason: String },
}

/// A fetched resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// Raw bytes; absent for kinds bridged in by identifier alone
    pub bytes: Option<Vec<u8>>,
    pub content_kind: String,
    pub content_kind_parameters: Option<String>,
}

impl Resource {
    pub fn new(bytes: Option<Vec<u8>>, content_kind: impl Into<String>) -> Self {
        Self {
            bytes,
            content_kind: content_kind.into(),
            content_kind_parameters: None,
        }
    }

    /// Module script source
    pub fn script(source: impl Into<String>) -> Self {
        Self::new(Some(source.into().into_bytes()), SCRIPT_SOURCE_KIND)
    }

    /// Portable binary module
    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(Some(bytes.into()), BINARY_MODULE_KIND)
    }

    /// Host module reference; `pure` modules expose their individual keys
    pub fn host(pure: bool) -> Self {
        let resource = Self::new(None, HOST_MODULE_KIND);
        if pure {
            resource.with_parameters(PURE_PARAMETER)
        } else {
            resource
        }
    }

    pub fn with_parameters(mut self, parameters: impl Into<String>) -> Self {
        self.content_kind_parameters = Some(parameters.into());
        self
    }

    /// Look up a `key=value` entry of the content kind parameters
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.content_kind_parameters
            .as_deref()?
            .split(';')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| k.trim() == key)
            .map(|(_, v)| v.trim())
    }
}

/// Future returned by [`Fetch::fetch`]
pub type FetchFuture = LocalBoxFuture<'static, Result<Resource, FetchError>>;

/// Fetch capability
pub trait Fetch {
    fn fetch(&self, url: &Url) -> FetchFuture;
}

impl<T: Fetch + ?Sized> Fetch for Rc<T> {
    fn fetch(&self, url: &Url) -> FetchFuture {
        (**self).fetch(url)
    }
}

/// Dispatches to a fetcher by URL scheme
#[derive(Default)]
pub struct SchemeFetcher {
    schemes: BTreeMap<String, Rc<dyn Fetch>>,
}

impl SchemeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `fetcher` for `scheme` (without the trailing colon)
    pub fn with(mut self, scheme: &str, fetcher: impl Fetch + 'static) -> Self {
        self.register(scheme, fetcher);
        self
    }

    pub fn register(&mut self, scheme: &str, fetcher: impl Fetch + 'static) {
        self.schemes
            .insert(scheme.to_ascii_lowercase(), Rc::new(fetcher));
    }

    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.schemes.keys().map(String::as_str)
    }
}

impl Fetch for SchemeFetcher {
    fn fetch(&self, url: &Url) -> FetchFuture {
        match self.schemes.get(url.scheme()) {
            Some(fetcher) => fetcher.fetch(url),
            None => future::ready(Err(FetchError::UnsupportedScheme {
                url: url.to_string(),
                scheme: url.scheme().to_string(),
            }))
            .boxed_local(),
        }
    }
}

/// Reads `file:` URLs from disk.
///
/// Inside a tokio runtime reads go through `tokio::fs`; anywhere else
/// (e.g. under `futures::executor::block_on`) they block the caller.
#[derive(Debug, Clone)]
pub struct DiskFetcher {
    extensions: Rc<BTreeMap<String, String>>,
}

impl Default for DiskFetcher {
    fn default() -> Self {
        Self::with_extensions(std::iter::empty::<(String, String)>())
    }
}

impl DiskFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default extension map extended (or overridden) by `extensions`
    pub fn with_extensions<K, V>(extensions: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut map: BTreeMap<String, String> = [
            (".js", SCRIPT_SOURCE_KIND),
            (".mjs", SCRIPT_SOURCE_KIND),
            (".wasm", BINARY_MODULE_KIND),
        ]
        .into_iter()
        .map(|(ext, kind)| (ext.to_string(), kind.to_string()))
        .collect();
        for (ext, kind) in extensions {
            map.insert(normalize_extension(ext.as_ref()), kind.into());
        }
        Self {
            extensions: Rc::new(map),
        }
    }

    /// Content kind for a path, by extension
    pub fn content_kind(&self, path: &Path) -> Option<&str> {
        let ext = path.extension()?.to_str()?;
        self.extensions
            .get(&normalize_extension(ext))
            .map(String::as_str)
    }
}

fn normalize_extension(ext: &str) -> String {
    let ext = ext.to_ascii_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{}", ext)
    }
}

impl Fetch for DiskFetcher {
    fn fetch(&self, url: &Url) -> FetchFuture {
        let url = url.clone();
        let path = match url.to_file_path() {
            Ok(path) => path,
            Err(()) => {
                return future::ready(Err(FetchError::InvalidFilePath {
                    url: url.to_string(),
                }))
                .boxed_local()
            }
        };
        let kind = match self.content_kind(&path) {
            Some(kind) => kind.to_string(),
            None => {
                let extension = path
                    .extension()
                    .map(|e| e.to_string_lossy().into_owned())
                    .unwrap_or_default();
                return future::ready(Err(FetchError::UnknownContentKind {
                    url: url.to_string(),
                    extension,
                }))
                .boxed_local();
            }
        };

        async move {
            debug!(path = %path.display(), kind = %kind, "reading module from disk");
            let read = match tokio::runtime::Handle::try_current() {
                Ok(_) => tokio::fs::read(&path).await,
                Err(_) => std::fs::read(&path),
            };
            match read {
                Ok(bytes) => Ok(Resource::new(Some(bytes), kind)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Err(FetchError::NotFound {
                    url: url.to_string(),
                }),
                Err(source) => Err(FetchError::Io {
                    url: url.to_string(),
                    source,
                }),
            }
        }
        .boxed_local()
    }
}

/// Serves `host:<name>` URLs from a host module registry
#[derive(Clone)]
pub struct HostFetcher {
    modules: Rc<HostModules>,
}

impl HostFetcher {
    pub fn new(modules: Rc<HostModules>) -> Self {
        Self { modules }
    }
}

impl Fetch for HostFetcher {
    fn fetch(&self, url: &Url) -> FetchFuture {
        let result = match self.modules.get(url.path()) {
            Some(module) => Ok(Resource::host(module.is_pure())),
            None => Err(FetchError::NotFound {
                url: url.to_string(),
            }),
        };
        future::ready(result).boxed_local()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    resources: FxHashMap<String, Resource>,
    fetches: FxHashMap<String, usize>,
}

/// In-memory URL → resource map. Clones share the same map and counters.
#[derive(Debug, Clone, Default)]
pub struct MemoryFetcher {
    state: Rc<RefCell<MemoryState>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: &str, resource: Resource) {
        self.state
            .borrow_mut()
            .resources
            .insert(url.to_string(), resource);
    }

    /// Insert module script source
    pub fn insert_script(&self, url: &str, source: &str) {
        self.insert(url, Resource::script(source));
    }

    /// Number of fetches issued for `url`, including failed ones
    pub fn fetch_count(&self, url: &str) -> usize {
        self.state.borrow().fetches.get(url).copied().unwrap_or(0)
    }

    /// Number of fetches across all URLs
    pub fn total_fetches(&self) -> usize {
        self.state.borrow().fetches.values().sum()
    }
}

impl Fetch for MemoryFetcher {
    fn fetch(&self, url: &Url) -> FetchFuture {
        let mut state = self.state.borrow_mut();
        *state.fetches.entry(url.to_string()).or_insert(0) += 1;
        trace!(%url, "fetching from memory");
        let result = state
            .resources
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| FetchError::NotFound {
                url: url.to_string(),
            });
        future::ready(result).boxed_local()
    }
}

/// Adapts a closure into a fetcher
pub struct FnFetcher<F>(F);

impl<F> FnFetcher<F>
where
    F: Fn(&Url) -> Result<Resource, FetchError>,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Fetch for FnFetcher<F>
where
    F: Fn(&Url) -> Result<Resource, FetchError>,
{
    fn fetch(&self, url: &Url) -> FetchFuture {
        future::ready((self.0)(url)).boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::fs;
    use tempfile::TempDir;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_resource_parameters() {
        let resource = Resource::host(true);
        assert_eq!(resource.bytes, None);
        assert_eq!(resource.content_kind, HOST_MODULE_KIND);
        assert_eq!(resource.parameter("sideEffects"), Some("false"));

        let resource = Resource::host(false);
        assert_eq!(resource.parameter("sideEffects"), None);

        let resource = Resource::script("").with_parameters("charset=utf-8; sideEffects = true");
        assert_eq!(resource.parameter("charset"), Some("utf-8"));
        assert_eq!(resource.parameter("sideEffects"), Some("true"));
    }

    #[test]
    fn test_scheme_dispatch() {
        let memory = MemoryFetcher::new();
        memory.insert_script("mem:/a.js", "export default 1;");
        let fetcher = SchemeFetcher::new().with("mem", memory.clone());

        let resource = block_on(fetcher.fetch(&url("mem:/a.js"))).unwrap();
        assert_eq!(resource.bytes.as_deref(), Some(&b"export default 1;"[..]));

        let err = block_on(fetcher.fetch(&url("https://example.com/a.js"))).unwrap_err();
        assert!(matches!(
            err,
            FetchError::UnsupportedScheme { ref scheme, .. } if scheme == "https"
        ));
    }

    #[test]
    fn test_memory_fetcher_counts_fetches() {
        let memory = MemoryFetcher::new();
        memory.insert_script("mem:/a.js", "");

        block_on(memory.fetch(&url("mem:/a.js"))).unwrap();
        block_on(memory.fetch(&url("mem:/a.js"))).unwrap();
        let err = block_on(memory.fetch(&url("mem:/missing.js"))).unwrap_err();

        assert!(matches!(err, FetchError::NotFound { .. }));
        assert_eq!(memory.fetch_count("mem:/a.js"), 2);
        assert_eq!(memory.fetch_count("mem:/missing.js"), 1);
        assert_eq!(memory.total_fetches(), 3);
    }

    #[test]
    fn test_fn_fetcher() {
        let fetcher = FnFetcher::new(|url: &Url| {
            Ok(Resource::script(format!("export default \"{}\";", url)))
        });
        let resource = block_on(fetcher.fetch(&url("file:///x"))).unwrap();
        assert_eq!(
            resource.bytes.unwrap(),
            b"export default \"file:///x\";".to_vec()
        );
    }

    #[test]
    fn test_disk_extension_map() {
        let fetcher = DiskFetcher::with_extensions([("jsm", "text/javascript")]);
        assert_eq!(fetcher.content_kind(Path::new("/a/b.js")), Some(SCRIPT_SOURCE_KIND));
        assert_eq!(fetcher.content_kind(Path::new("/a/b.MJS")), Some(SCRIPT_SOURCE_KIND));
        assert_eq!(fetcher.content_kind(Path::new("/a/b.wasm")), Some(BINARY_MODULE_KIND));
        assert_eq!(fetcher.content_kind(Path::new("/a/b.jsm")), Some(SCRIPT_SOURCE_KIND));
        assert_eq!(fetcher.content_kind(Path::new("/a/b.txt")), None);
        assert_eq!(fetcher.content_kind(Path::new("/a/b")), None);
    }

    #[tokio::test]
    async fn test_disk_fetch() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("main.js");
        fs::write(&path, "export const x = 1;").unwrap();

        let fetcher = DiskFetcher::new();
        let resource = fetcher
            .fetch(&Url::from_file_path(&path).unwrap())
            .await
            .unwrap();
        assert_eq!(resource.content_kind, SCRIPT_SOURCE_KIND);
        assert_eq!(resource.bytes.unwrap(), b"export const x = 1;".to_vec());
    }

    #[tokio::test]
    async fn test_disk_fetch_errors() {
        let temp_dir = TempDir::new().unwrap();
        let fetcher = DiskFetcher::new();

        let missing = Url::from_file_path(temp_dir.path().join("missing.js")).unwrap();
        let err = fetcher.fetch(&missing).await.unwrap_err();
        assert!(matches!(err, FetchError::NotFound { ref url } if url == missing.as_str()));

        let text = temp_dir.path().join("notes.txt");
        fs::write(&text, "hello").unwrap();
        let err = fetcher
            .fetch(&Url::from_file_path(&text).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::UnknownContentKind { ref extension, .. } if extension == "txt"));
    }

    #[test]
    fn test_host_fetcher() {
        let modules = Rc::new(HostModules::with_builtins());
        let fetcher = HostFetcher::new(modules);

        let resource = block_on(fetcher.fetch(&url("host:math"))).unwrap();
        assert_eq!(resource.content_kind, HOST_MODULE_KIND);
        assert_eq!(resource.parameter("sideEffects"), Some("false"));

        let err = block_on(fetcher.fetch(&url("host:nope"))).unwrap_err();
        assert!(matches!(err, FetchError::NotFound { .. }));
    }
}
