//! Loader errors

use std::sync::Arc;

use modgraph_script::{Exception, ExceptionKind};
use thiserror::Error;

use crate::config::ConfigError;
use crate::fetch::FetchError;
use crate::manifest::ManifestError;
use crate::resolve::ResolutionError;

/// Failure of a graph load.
///
/// Cloning is cheap and keeps identity: every payload sits behind an `Arc`
/// or is a shared [`Exception`], so a memoized failure compares equal to
/// itself with [`LoadError::is_same`]. Initialization, compile and
/// evaluation failures are memoized on the record; resolution and link
/// failures are memoized on the root URL until the mapping table changes.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error(transparent)]
    Resolution(Arc<ResolutionError>),

    #[error(transparent)]
    Fetch(Arc<FetchError>),

    /// The fetched resource could not be turned into a record
    #[error(transparent)]
    Init(Arc<InitError>),

    #[error("{0}")]
    Compile(Exception),

    #[error("{0}")]
    Link(Exception),

    #[error("{0}")]
    Evaluation(Exception),
}

impl LoadError {
    /// Script exception behind a compile, link or evaluation failure
    pub fn exception(&self) -> Option<&Exception> {
        match self {
            LoadError::Compile(e) | LoadError::Link(e) | LoadError::Evaluation(e) => Some(e),
            _ => None,
        }
    }

    /// Initialization failure detail
    pub fn init_error(&self) -> Option<&InitError> {
        match self {
            LoadError::Init(e) => Some(e),
            _ => None,
        }
    }

    /// Whether both errors are the same failure instance
    pub fn is_same(&self, other: &LoadError) -> bool {
        match (self, other) {
            (LoadError::Resolution(a), LoadError::Resolution(b)) => Arc::ptr_eq(a, b),
            (LoadError::Fetch(a), LoadError::Fetch(b)) => Arc::ptr_eq(a, b),
            (LoadError::Init(a), LoadError::Init(b)) => Arc::ptr_eq(a, b),
            _ => match (self.exception(), other.exception()) {
                (Some(a), Some(b)) => a.ptr_eq(b),
                _ => false,
            },
        }
    }
}

/// Resource fetched but not initializable
#[derive(Debug, Error)]
pub enum InitError {
    /// No initializer registered for the content kind
    #[error("Unsupported content kind '{kind}' for {url}")]
    UnsupportedContentKind { kind: String, url: String },

    /// Malformed binary or an unusable import table
    #[error("Invalid binary module {url}: {reason}")]
    InvalidBinaryModule { url: String, reason: String },

    /// Source bytes missing or not UTF-8
    #[error("Module source of {url} is not valid UTF-8")]
    InvalidEncoding { url: String },
}

impl From<ResolutionError> for LoadError {
    fn from(e: ResolutionError) -> Self {
        LoadError::Resolution(Arc::new(e))
    }
}

impl From<InitError> for LoadError {
    fn from(e: InitError) -> Self {
        LoadError::Init(Arc::new(e))
    }
}

impl From<FetchError> for LoadError {
    fn from(e: FetchError) -> Self {
        LoadError::Fetch(Arc::new(e))
    }
}

impl From<Exception> for LoadError {
    fn from(e: Exception) -> Self {
        match e.kind() {
            ExceptionKind::Syntax => LoadError::Compile(e),
            ExceptionKind::Link => LoadError::Link(e),
            ExceptionKind::Evaluation => LoadError::Evaluation(e),
        }
    }
}

/// Failure while assembling a [`Loader`](crate::Loader)
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
