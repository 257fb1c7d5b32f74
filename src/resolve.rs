//! Artifact Resolution
//!
//! Decides which file on disk is the primary native library. Nothing here
//! downloads, extracts or verifies artifacts; resolvers only pick among
//! files that already exist.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::LibraryConfig;
use crate::error::{Error, Result};
use crate::ffi::library_filename;

/// A resolved primary artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    /// Absolute path of the primary library
    pub path: PathBuf,
    /// Temporary directory owned by this artifact, removed on unload
    pub scratch_dir: Option<PathBuf>,
}

impl ResolvedArtifact {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            scratch_dir: None,
        }
    }
}

/// Produces the path of the primary library.
pub trait ArtifactResolver: Send + Sync {
    fn resolve(&self) -> Result<ResolvedArtifact>;
}

/// A known path.
#[derive(Debug, Clone)]
pub struct FixedPath {
    path: PathBuf,
}

impl FixedPath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ArtifactResolver for FixedPath {
    fn resolve(&self) -> Result<ResolvedArtifact> {
        if !self.path.is_file() {
            return Err(Error::ArtifactUnavailable(format!(
                "{} does not exist",
                self.path.display()
            )));
        }
        Ok(ResolvedArtifact::at(absolute(&self.path)))
    }
}

/// Configured overrides first, then the platform search paths.
///
/// Order: explicit path, forced bundle, `cache_dir/<version>/`,
/// `cache_dir/`, then the current directory, system library directories and
/// the loader path variable of the platform.
#[derive(Debug, Clone)]
pub struct SearchPathResolver {
    config: LibraryConfig,
    search_paths: Vec<PathBuf>,
}

impl SearchPathResolver {
    pub fn new(config: LibraryConfig) -> Self {
        Self {
            config,
            search_paths: default_search_paths(),
        }
    }

    /// Replace the platform search paths.
    pub fn with_search_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.search_paths = paths;
        self
    }

    /// Add a search path after the existing ones.
    pub fn add_search_path(&mut self, path: impl AsRef<Path>) {
        self.search_paths.push(path.as_ref().to_path_buf());
    }

    /// Platform filename of the primary library.
    pub fn file_name(&self) -> String {
        library_filename(&self.config.name)
    }

    /// Every location tried after the explicit path, in order.
    pub fn candidates(&self) -> Vec<PathBuf> {
        let file_name = self.file_name();
        let mut candidates = Vec::new();

        if let Some(cache_dir) = self.config.cache_dir() {
            if let Some(version) = &self.config.version {
                candidates.push(cache_dir.join(version).join(&file_name));
            }
            candidates.push(cache_dir.join(&file_name));
        }
        candidates.extend(self.search_paths.iter().map(|dir| dir.join(&file_name)));
        candidates
    }
}

impl ArtifactResolver for SearchPathResolver {
    fn resolve(&self) -> Result<ResolvedArtifact> {
        if let Some(path) = self.config.path() {
            debug!(path = %path.display(), "using configured library path");
            return FixedPath::new(path).resolve();
        }

        if self.config.force_embedded {
            return Err(Error::ArtifactUnavailable(
                "an embedded library was requested but none is bundled with this build".to_string(),
            ));
        }

        let candidates = self.candidates();
        for candidate in &candidates {
            if candidate.is_file() {
                debug!(path = %candidate.display(), "found native library");
                return Ok(ResolvedArtifact::at(absolute(candidate)));
            }
        }

        Err(Error::ArtifactUnavailable(format!(
            "{} not found in {} location(s); set the library path in {} or LLAMALINK_LIB_PATH",
            self.file_name(),
            candidates.len(),
            crate::config::CONFIG_FILE_NAME
        )))
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

/// Get the default library search paths for this platform
pub fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // Current directory
    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd);
    }

    #[cfg(target_os = "linux")]
    {
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/usr/lib"));
        paths.push(PathBuf::from("/usr/lib64"));
        paths.push(PathBuf::from("/lib"));
        paths.push(PathBuf::from("/lib64"));
        push_path_var(&mut paths, "LD_LIBRARY_PATH");
    }

    #[cfg(target_os = "macos")]
    {
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/opt/homebrew/lib"));
        paths.push(PathBuf::from("/usr/lib"));
        push_path_var(&mut paths, "DYLD_LIBRARY_PATH");
    }

    #[cfg(target_os = "windows")]
    {
        push_path_var(&mut paths, "PATH");
    }

    paths
}

#[allow(dead_code)]
fn push_path_var(paths: &mut Vec<PathBuf>, var: &str) {
    if let Some(value) = std::env::var_os(var) {
        paths.extend(std::env::split_paths(&value).filter(|p| !p.as_os_str().is_empty()));
    }
}
