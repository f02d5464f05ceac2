//! Graph loading
//!
//! One job per top-level import:
//! 1. Short-circuit on an already evaluated (or errored) root
//! 2. Initialize discovered records concurrently; as each settles, resolve
//!    its requests in declaration order and discover new dependencies
//! 3. Once nothing is pending, instantiate the discovered set as one batch
//! 4. Evaluate the root
//!
//! Initialization is shared through the cache, so a record being
//! initialized by another job is awaited rather than restarted. Any failure
//! fails the job; the shared initializations it dropped stay resumable.
//! Resolution and link failures leave no trace on the records, so they are
//! remembered for the root until the mapping table changes.

use futures::future::LocalBoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use modgraph_script::{instantiate_all, Exception, ModuleRecord, ModuleStatus};
use rustc_hash::FxHashSet;
use tracing::{debug, trace};
use url::Url;

use crate::error::LoadError;
use crate::Loader;

type Settled = LocalBoxFuture<'static, (ModuleRecord, Result<(), LoadError>)>;

/// Failure captured on an errored record
fn captured_failure(record: &ModuleRecord) -> LoadError {
    match record.exception() {
        Some(exception) => LoadError::from(exception),
        None => LoadError::Evaluation(Exception::error(&format!(
            "Module '{}' failed without an exception",
            record.url()
        ))),
    }
}

/// Records discovered by one job, in discovery order
#[derive(Default)]
struct GraphJob {
    seen: FxHashSet<String>,
    discovered: Vec<ModuleRecord>,
}

impl GraphJob {
    /// Returns `false` if the record was already discovered
    fn discover(&mut self, record: &ModuleRecord) -> bool {
        if !self.seen.insert(record.url().to_string()) {
            return false;
        }
        self.discovered.push(record.clone());
        true
    }
}

fn settle(loader: &Loader, record: ModuleRecord) -> Settled {
    let init = loader.initialization(&record);
    async move {
        let result = init.await;
        (record, result)
    }
    .boxed_local()
}

/// Load, link and evaluate the graph rooted at `root`
pub async fn load_graph(loader: &Loader, root: &Url) -> Result<ModuleRecord, LoadError> {
    let record = loader.cache().get_or_create(root);
    match record.status() {
        ModuleStatus::Evaluated => {
            trace!(url = %root, "graph already evaluated");
            return Ok(record);
        }
        ModuleStatus::Errored => return Err(captured_failure(&record)),
        _ => {}
    }

    let revision = loader.resolver().revision();
    if let Some(failure) = loader.cache().job_failure(root.as_str(), revision) {
        trace!(url = %root, "graph load failed before");
        return Err(failure);
    }

    let result = run_job(loader, root, record).await;
    if let Err(failure @ (LoadError::Resolution(_) | LoadError::Link(_))) = &result {
        loader
            .cache()
            .remember_job_failure(root.as_str(), revision, failure);
    }
    result
}

async fn run_job(
    loader: &Loader,
    root: &Url,
    record: ModuleRecord,
) -> Result<ModuleRecord, LoadError> {
    let _job_guard = loader.resolver().begin_job();
    let mut job = GraphJob::default();
    job.discover(&record);

    let mut pending: FuturesUnordered<Settled> = FuturesUnordered::new();
    pending.push(settle(loader, record.clone()));

    while let Some((node, result)) = pending.next().await {
        result?;

        for specifier in node.requests() {
            let dependency = match node.resolved_request(&specifier) {
                Some(dependency) => dependency,
                None => {
                    let url = loader.resolver().resolve(&specifier, node.url())?;
                    let dependency = loader.cache().get_or_create(&url);
                    node.resolve_request(&specifier, &dependency);
                    dependency
                }
            };

            match dependency.status() {
                ModuleStatus::Errored => return Err(captured_failure(&dependency)),
                status if status >= ModuleStatus::Instantiated => continue,
                _ => {}
            }
            if job.discover(&dependency) {
                trace!(url = %dependency.url(), from = %node.url(), "discovered dependency");
                pending.push(settle(loader, dependency));
            }
        }
    }

    debug!(url = %root, modules = job.discovered.len(), "linking module graph");
    instantiate_all(&job.discovered)?;

    debug!(url = %root, "evaluating module graph");
    record.evaluate()?;
    Ok(record)
}
