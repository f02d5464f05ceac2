//! Module graph loader
//!
//! This crate turns a root URL into an evaluated module graph:
//! - **Resolution**: specifier + referrer → canonical URL (`resolve` module)
//! - **Fetching**: URL → resource bytes and content kind (`fetch` module)
//! - **Initialization**: per-content-kind compilation into a record (`init` module)
//! - **Caching**: one record and one shared initialization per URL (`cache` module)
//! - **Graph loading**: concurrent discovery, batch linking, evaluation (`graph` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use modgraph_loader::{Loader, MemoryFetcher};
//!
//! let memory = MemoryFetcher::new();
//! memory.insert_script("file:///dep.js", "export default 41;");
//! memory.insert_script("file:///main.js", "import d from './dep.js'; export const answer = d + 1;");
//!
//! let loader = Loader::builder().fetcher(memory).build()?;
//! let namespace = futures::executor::block_on(loader.import("file:///main.js"))?;
//! assert_eq!(namespace.get("answer").unwrap().as_number(), Some(42.0));
//! ```

#![warn(rust_2018_idioms)]

pub mod cache;
pub mod config;
mod dynamic;
pub mod error;
pub mod fetch;
pub mod graph;
pub mod host;
pub mod init;
mod loader;
pub mod manifest;
pub mod resolve;

pub use cache::{CacheStats, ModuleCache};
pub use config::{ConfigError, LoaderConfig};
pub use error::{BuildError, InitError, LoadError};
pub use fetch::{
    DiskFetcher, Fetch, FetchError, FetchFuture, FnFetcher, HostFetcher, MemoryFetcher, Resource,
    SchemeFetcher,
};
pub use graph::load_graph;
pub use host::{HostModule, HostModules};
pub use init::{ContentKind, ContentKinds};
pub use loader::{file_url, Loader, LoaderBuilder};
pub use manifest::{ingest_manifest, ManifestError, PackageManifest};
pub use resolve::{ResolutionError, Resolver};

pub use modgraph_script::{Exception, ModuleRecord, ModuleStatus, Namespace, Value};
