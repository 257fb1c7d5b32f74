//! Sibling Module Discovery
//!
//! Some builds split one logical library across several files in the same
//! directory (`llama.dll` next to `ggml.dll`, `ggml-base.dll`, `ggml-cpu.dll`
//! and one DLL per accelerator backend). The manifest names the modules we
//! expect, in dependency-priority order; a directory scan picks up anything
//! the manifest does not list.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::loader::{is_loadable_module, library_filename, DynamicLoader};
use super::types::NativeHandle;

/// Current manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

/// Errors reading a manifest override.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read sibling manifest: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse sibling manifest: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unsupported sibling manifest version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },
}

/// Expected sibling modules per backend, highest priority first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiblingManifest {
    /// Format version
    pub version: u32,

    /// Modules every backend needs, loaded before backend modules
    #[serde(default)]
    pub common: Vec<String>,

    /// Backend name -> backend-specific modules
    #[serde(default)]
    pub backends: BTreeMap<String, Vec<String>>,
}

impl Default for SiblingManifest {
    fn default() -> Self {
        let mut backends = BTreeMap::new();
        backends.insert("cpu".to_string(), vec![]);
        backends.insert("blas".to_string(), vec!["ggml-blas".to_string()]);
        backends.insert("cuda".to_string(), vec!["ggml-cuda".to_string()]);
        backends.insert("hip".to_string(), vec!["ggml-hip".to_string()]);
        backends.insert("metal".to_string(), vec!["ggml-metal".to_string()]);
        backends.insert("sycl".to_string(), vec!["ggml-sycl".to_string()]);
        backends.insert("vulkan".to_string(), vec!["ggml-vulkan".to_string()]);
        backends.insert("rpc".to_string(), vec!["ggml-rpc".to_string()]);

        Self {
            version: MANIFEST_VERSION,
            // ggml-base exports what ggml and every backend import at load time.
            common: vec!["ggml-base".to_string(), "ggml".to_string(), "ggml-cpu".to_string()],
            backends,
        }
    }
}

impl SiblingManifest {
    /// Load a manifest override from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        let manifest: SiblingManifest = serde_json::from_str(json)?;
        if manifest.version != MANIFEST_VERSION {
            return Err(ManifestError::Version {
                found: manifest.version,
                expected: MANIFEST_VERSION,
            });
        }
        Ok(manifest)
    }

    /// Module stems for a backend, common modules first, without duplicates.
    pub fn priority_for(&self, backend: &str) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.common
            .iter()
            .chain(self.backends.get(backend).into_iter().flatten())
            .map(String::as_str)
            .filter(|name| seen.insert(*name))
            .collect()
    }
}

/// How siblings of the primary artifact are discovered.
#[derive(Debug, Clone)]
pub struct SiblingPolicy {
    /// Preload siblings at all
    pub enabled: bool,
    /// Also open unlisted loadable files found in the directory
    pub scan_directory: bool,
    /// Backend whose manifest entries are preloaded
    pub backend: String,
    pub manifest: SiblingManifest,
}

impl SiblingPolicy {
    /// The platform default: on for Windows, off elsewhere, where the
    /// dynamic linker already follows the primary's own dependencies.
    pub fn platform_default() -> Self {
        Self {
            enabled: cfg!(windows),
            scan_directory: true,
            backend: "cpu".to_string(),
            manifest: SiblingManifest::default(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::platform_default()
        }
    }

    pub fn enabled(backend: impl Into<String>) -> Self {
        Self {
            enabled: true,
            backend: backend.into(),
            ..Self::platform_default()
        }
    }
}

impl Default for SiblingPolicy {
    fn default() -> Self {
        Self::platform_default()
    }
}

/// Open the siblings of `primary`, manifest modules first, then (if the
/// policy asks for it) every other loadable file in name order.
///
/// Failures are logged and skipped. The primary itself is never reopened.
pub fn discover_siblings<L: DynamicLoader + ?Sized>(
    loader: &L,
    primary: &Path,
    policy: &SiblingPolicy,
) -> Vec<NativeHandle> {
    let mut handles = Vec::new();
    if !policy.enabled {
        return handles;
    }

    let dir = match primary.parent() {
        Some(dir) => dir,
        None => return handles,
    };
    let primary_name = primary.file_name().map(|n| n.to_string_lossy().to_lowercase());

    let mut attempted: HashSet<String> = HashSet::new();
    if let Some(name) = &primary_name {
        attempted.insert(name.clone());
    }

    let try_open = |path: PathBuf, handles: &mut Vec<NativeHandle>| match loader.open(&path) {
        Ok(handle) => {
            debug!(path = %path.display(), %handle, "preloaded sibling module");
            handles.push(handle);
        }
        Err(e) => debug!(path = %path.display(), error = %e, "skipped sibling module"),
    };

    for stem in policy.manifest.priority_for(&policy.backend) {
        let file_name = library_filename(stem);
        if !attempted.insert(file_name.to_lowercase()) {
            continue;
        }
        let path = dir.join(&file_name);
        if path.is_file() {
            try_open(path, &mut handles);
        }
    }

    if policy.scan_directory {
        for path in scan_modules(dir) {
            let name = match path.file_name() {
                Some(n) => n.to_string_lossy().to_lowercase(),
                None => continue,
            };
            if attempted.insert(name) {
                try_open(path, &mut handles);
            }
        }
    }

    info!(
        dir = %dir.display(),
        count = handles.len(),
        backend = %policy.backend,
        "sibling discovery finished"
    );
    handles
}

/// Loadable files in `dir`, sorted by file name.
fn scan_modules(dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "cannot scan for sibling modules");
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .map(|n| is_loadable_module(&n.to_string_lossy()))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    paths
}
