//! Error taxonomy for the binding layer.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::ffi::NativeHandle;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while locating, loading, binding or calling into the
/// native library.
#[derive(Debug, Error)]
pub enum Error {
    /// The artifact resolver could not produce a usable path.
    #[error("native library artifact unavailable: {0}")]
    ArtifactUnavailable(String),

    /// The module could not be opened.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// A symbol was not exported by any searched module.
    #[error("symbol `{name}` not found in {searched} loaded module(s)")]
    SymbolNotFound { name: String, searched: usize },

    /// A struct-by-value call plan could not be built or paired.
    #[error("unsupported native signature: {0}")]
    UnsupportedSignature(String),

    /// One or more modules failed to close during unload.
    #[error("failed to close {} native module(s): {}", .failures.len(), join_failures(.failures))]
    CloseFailed { failures: Vec<CloseFailure> },

    /// The entry point is optional and this build of the library lacks it.
    #[error("function `{0}` is not available in this build of the native library")]
    NotAvailable(&'static str),

    /// The library was unloaded while a wrapper was about to call into it.
    #[error("native library was unloaded before `{0}` could be called")]
    Unloaded(&'static str),

    /// Configuration could not be read.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// The load failure kind, when this is a load error.
    pub fn load_failure(&self) -> Option<LoadFailureKind> {
        match self {
            Error::Load(err) => Some(err.kind),
            _ => None,
        }
    }

    pub fn is_not_available(&self) -> bool {
        matches!(self, Error::NotAvailable(_))
    }
}

/// Why a module failed to open, as far as the platform lets us tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadFailureKind {
    /// The file itself does not exist.
    FileNotFound,
    /// The file exists but one of its dependencies could not be found.
    DependencyMissing,
    /// The file is not a loadable module for this process architecture.
    ArchitectureMismatch,
    /// Anything the platform error does not let us classify.
    Other,
}

impl fmt::Display for LoadFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadFailureKind::FileNotFound => write!(f, "file not found"),
            LoadFailureKind::DependencyMissing => write!(f, "dependency missing"),
            LoadFailureKind::ArchitectureMismatch => write!(f, "architecture or format mismatch"),
            LoadFailureKind::Other => write!(f, "load failed"),
        }
    }
}

/// A module open failure with the path tried and the raw platform detail.
#[derive(Debug, Clone, Error)]
#[error("failed to load native library '{}' ({kind}): {detail}", .path.display())]
pub struct LoadError {
    pub kind: LoadFailureKind,
    pub path: PathBuf,
    pub detail: String,
}

impl LoadError {
    pub fn new(kind: LoadFailureKind, path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            detail: detail.into(),
        }
    }
}

/// A single handle that could not be closed.
#[derive(Debug, Clone)]
pub struct CloseFailure {
    pub handle: NativeHandle,
    pub detail: String,
}

impl fmt::Display for CloseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.handle, self.detail)
    }
}

fn join_failures(failures: &[CloseFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
