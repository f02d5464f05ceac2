//! Loader facade
//!
//! A [`Loader`] owns its resolver, fetcher, content-kind table, host
//! modules and module cache. There is no process-wide default instance;
//! callers create loaders and pass them around.
//!
//! Records created by a loader get `import.meta.url` and a dynamic
//! `import(...)` that goes through [`Loader::import_from_specifier`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use futures::FutureExt;
use modgraph_script::{Exception, ModuleRecord, Namespace};
use tracing::{debug, info};
use url::Url;

use crate::cache::{InitFuture, ModuleCache};
use crate::config::LoaderConfig;
use crate::dynamic::DynamicImports;
use crate::error::{BuildError, InitError, LoadError};
use crate::fetch::{DiskFetcher, Fetch, HostFetcher, SchemeFetcher};
use crate::graph::load_graph;
use crate::host::{HostModule, HostModules};
use crate::init::{ContentKind, ContentKinds};
use crate::manifest::{ingest_manifest, PackageManifest};
use crate::resolve::{ResolutionError, Resolver};

/// Module graph loader
pub struct Loader {
    resolver: Resolver,
    fetcher: Rc<dyn Fetch>,
    content_kinds: Rc<ContentKinds>,
    host_modules: Rc<HostModules>,
    cache: ModuleCache,
    dynamic_imports: Rc<DynamicImports>,
}

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("resolver", &self.resolver)
            .field("content_kinds", &self.content_kinds)
            .field("host_modules", &self.host_modules)
            .field("cached", &self.cache.len())
            .field("queued_dynamic_imports", &self.dynamic_imports.len())
            .finish_non_exhaustive()
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

impl Loader {
    /// Loader with the default wiring: `file:` and `host:` fetchers, the
    /// default content kinds and the built-in host modules mapped by name.
    ///
    /// Needs no async runtime; see [`DiskFetcher`] for how files are read.
    pub fn new() -> Self {
        let host_modules = Rc::new(HostModules::with_builtins());
        let resolver = Resolver::new();
        // Fresh resolver, nothing can be frozen yet
        let _ = resolver.register_host_modules(host_modules.names());
        Self {
            resolver,
            fetcher: Rc::new(default_fetcher(DiskFetcher::new(), host_modules.clone())),
            content_kinds: Rc::new(ContentKinds::new()),
            host_modules,
            cache: ModuleCache::new(),
            dynamic_imports: Rc::new(DynamicImports::new()),
        }
    }

    pub fn builder() -> LoaderBuilder {
        LoaderBuilder::new()
    }

    /// Default loader configured from a `modgraph.toml`
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self, BuildError> {
        let config = LoaderConfig::from_file(path.as_ref())?;
        LoaderBuilder::new().config(&config).build()
    }

    /// Import the module at an absolute URL and return its namespace
    pub async fn import(&self, url: &str) -> Result<Namespace, LoadError> {
        let url = Url::parse(url).map_err(|e| ResolutionError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        self.import_url(&url).await
    }

    /// Import the module at `url`. Dynamic imports queued by module code
    /// are served before this returns, whether or not the graph loaded.
    pub async fn import_url(&self, url: &Url) -> Result<Namespace, LoadError> {
        info!(url = %url, "importing module");
        let loaded = load_graph(self, url).await;
        self.serve_dynamic_imports().await;
        let record = loaded?;
        record.namespace().ok_or_else(|| {
            LoadError::Link(Exception::link(&format!(
                "Module '{}' has no namespace",
                record.url()
            )))
        })
    }

    /// Resolve `specifier` against `referrer`, then import it
    pub async fn import_from_specifier(
        &self,
        specifier: &str,
        referrer: &str,
    ) -> Result<Namespace, LoadError> {
        let url = self.resolver.resolve(specifier, referrer)?;
        self.import_url(&url).await
    }

    async fn serve_dynamic_imports(&self) {
        while let Some(request) = self.dynamic_imports.next() {
            debug!(specifier = %request.specifier, referrer = %request.referrer, "serving dynamic import");
            let result = self
                .import_from_specifier(&request.specifier, &request.referrer)
                .boxed_local()
                .await;
            request.settle(&result);
        }
    }

    /// Import a file by path; relative paths are taken from the current
    /// directory
    pub async fn import_path(&self, path: impl AsRef<Path>) -> Result<Namespace, LoadError> {
        let url = file_url(path.as_ref())?;
        self.import_url(&url).await
    }

    /// Map a bare specifier; refused while an import is in flight
    pub fn add_mapping(&self, specifier: &str, target: &str) -> Result<(), ResolutionError> {
        self.resolver.add_mapping(specifier, target)
    }

    pub fn resolve(&self, specifier: &str, referrer: &str) -> Result<Url, ResolutionError> {
        self.resolver.resolve(specifier, referrer)
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn cache(&self) -> &ModuleCache {
        &self.cache
    }

    pub fn host_modules(&self) -> &HostModules {
        &self.host_modules
    }

    pub fn content_kinds(&self) -> &ContentKinds {
        &self.content_kinds
    }

    /// Shared fetch-and-initialize future for a cached record
    pub(crate) fn initialization(&self, record: &ModuleRecord) -> InitFuture {
        let fetcher = self.fetcher.clone();
        let content_kinds = self.content_kinds.clone();
        let host_modules = self.host_modules.clone();
        let dynamic_imports = self.dynamic_imports.clone();
        self.cache.initialization(record, move |url, record| {
            async move {
                record.set_dynamic_import(dynamic_imports.hook());
                debug!(url = %url, "fetching module");
                let resource = fetcher.fetch(&url).await?;
                let kind = content_kinds.lookup(&resource.content_kind).ok_or_else(|| {
                    LoadError::from(InitError::UnsupportedContentKind {
                        kind: resource.content_kind.clone(),
                        url: url.to_string(),
                    })
                })?;
                kind.initialize(&record, &url, resource, &host_modules)
            }
            .boxed_local()
        })
    }
}

/// `file:` URL for a path, made absolute against the current directory
pub fn file_url(path: &Path) -> Result<Url, ResolutionError> {
    let invalid = |reason: String| ResolutionError::InvalidUrl {
        url: path.display().to_string(),
        reason,
    };
    let absolute = std::path::absolute(path).map_err(|e| invalid(e.to_string()))?;
    Url::from_file_path(&absolute).map_err(|()| invalid("not an absolute file path".to_string()))
}

fn default_fetcher(disk: DiskFetcher, host_modules: Rc<HostModules>) -> SchemeFetcher {
    SchemeFetcher::new()
        .with("file", disk)
        .with("host", HostFetcher::new(host_modules))
}

/// Builder for [`Loader`]
pub struct LoaderBuilder {
    fetcher: Option<Rc<dyn Fetch>>,
    content_kinds: ContentKinds,
    host_modules: HostModules,
    register_host_modules: bool,
    extensions: BTreeMap<String, String>,
    mappings: Vec<(String, String)>,
    manifests: Vec<PathBuf>,
}

impl Default for LoaderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoaderBuilder {
    pub fn new() -> Self {
        Self {
            fetcher: None,
            content_kinds: ContentKinds::new(),
            host_modules: HostModules::with_builtins(),
            register_host_modules: true,
            extensions: BTreeMap::new(),
            mappings: Vec::new(),
            manifests: Vec::new(),
        }
    }

    /// Replace the default scheme-dispatching fetcher
    pub fn fetcher(mut self, fetcher: impl Fetch + 'static) -> Self {
        self.fetcher = Some(Rc::new(fetcher));
        self
    }

    /// Add or override a content-kind alias
    pub fn content_kind(mut self, content_kind: &str, kind: ContentKind) -> Self {
        self.content_kinds.register(content_kind, kind);
        self
    }

    /// Replace the whole content-kind table
    pub fn content_kinds(mut self, content_kinds: ContentKinds) -> Self {
        self.content_kinds = content_kinds;
        self
    }

    pub fn host_module(mut self, name: &str, module: HostModule) -> Self {
        self.host_modules.register(name, module);
        self
    }

    /// Replace the host module registry (the built-ins included)
    pub fn host_modules(mut self, host_modules: HostModules) -> Self {
        self.host_modules = host_modules;
        self
    }

    /// Whether host module names resolve unprefixed (`console` → `host:console`)
    pub fn register_host_modules(mut self, register: bool) -> Self {
        self.register_host_modules = register;
        self
    }

    /// Extension → content kind entry for the default disk fetcher
    pub fn extension(mut self, extension: &str, content_kind: &str) -> Self {
        self.extensions
            .insert(extension.to_string(), content_kind.to_string());
        self
    }

    pub fn mapping(mut self, specifier: &str, target: &str) -> Self {
        self.mappings.push((specifier.to_string(), target.to_string()));
        self
    }

    /// Ingest a `package.json` manifest when building
    pub fn manifest(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifests.push(path.into());
        self
    }

    /// Apply a configuration file's settings
    pub fn config(mut self, config: &LoaderConfig) -> Self {
        for (content_kind, kind) in &config.content_kinds {
            self.content_kinds.register(content_kind, *kind);
        }
        for (extension, content_kind) in &config.extensions {
            self.extensions
                .insert(extension.clone(), content_kind.clone());
        }
        for (specifier, target) in &config.imports {
            self.mappings.push((specifier.clone(), target.clone()));
        }
        if let Some(manifest) = config.manifest_path() {
            self.manifests.push(manifest);
        }
        self.register_host_modules = config.host_modules;
        self
    }

    pub fn build(self) -> Result<Loader, BuildError> {
        let host_modules = Rc::new(self.host_modules);
        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Rc::new(default_fetcher(
                DiskFetcher::with_extensions(self.extensions),
                host_modules.clone(),
            )),
        };

        let resolver = Resolver::new();
        if self.register_host_modules {
            resolver.register_host_modules(host_modules.names())?;
        }
        for (specifier, target) in &self.mappings {
            resolver.add_mapping(specifier, target)?;
        }
        for path in &self.manifests {
            let manifest = PackageManifest::from_file(path)?;
            let project_dir = path.parent().unwrap_or_else(|| Path::new("."));
            ingest_manifest(&resolver, project_dir, &manifest)?;
        }

        Ok(Loader {
            resolver,
            fetcher,
            content_kinds: Rc::new(self.content_kinds),
            host_modules,
            cache: ModuleCache::new(),
            dynamic_imports: Rc::new(DynamicImports::new()),
        })
    }
}
