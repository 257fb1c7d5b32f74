//! Loader Configuration
//!
//! Handles parsing of llamalink.toml and the `LLAMALINK_*` environment
//! overrides that steer where the native library is found and which
//! siblings are preloaded next to it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::ffi::{ManifestError, SiblingManifest, SiblingPolicy};

/// Config file name searched for by [`LoaderConfig::find_and_load`].
pub const CONFIG_FILE_NAME: &str = "llamalink.toml";

pub const ENV_LIB_PATH: &str = "LLAMALINK_LIB_PATH";
pub const ENV_LIB_VERSION: &str = "LLAMALINK_LIB_VERSION";
pub const ENV_CACHE_DIR: &str = "LLAMALINK_CACHE_DIR";
pub const ENV_FORCE_EMBEDDED: &str = "LLAMALINK_FORCE_EMBEDDED";
pub const ENV_BACKEND: &str = "LLAMALINK_BACKEND";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration structure matching llamalink.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct LoaderConfig {
    /// Where the primary library comes from
    #[serde(default)]
    pub library: LibraryConfig,

    /// Sibling module preloading
    #[serde(default)]
    pub siblings: SiblingsConfig,
}

impl LoaderConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: LoaderConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Find and load configuration by searching up from the given directory.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                return Ok(Self::default());
            }
        }
    }

    /// Configuration for this process: the nearest llamalink.toml above the
    /// working directory (or defaults), then environment overrides.
    pub fn from_env() -> ConfigResult<Self> {
        let cwd = std::env::current_dir()?;
        let mut config = Self::find_and_load(&cwd)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `LLAMALINK_*` environment overrides.
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source. Empty values are
    /// ignored.
    pub fn apply_vars<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = get(ENV_LIB_PATH) {
            self.library.path = Some(PathBuf::from(path));
        }
        if let Some(version) = get(ENV_LIB_VERSION) {
            self.library.version = Some(version);
        }
        if let Some(dir) = get(ENV_CACHE_DIR) {
            self.library.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(flag) = get(ENV_FORCE_EMBEDDED) {
            self.library.force_embedded = parse_flag(ENV_FORCE_EMBEDDED, &flag)?;
        }
        if let Some(backend) = get(ENV_BACKEND) {
            self.siblings.backend = backend;
        }
        Ok(())
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// The sibling preload policy this configuration describes.
    pub fn sibling_policy(&self) -> ConfigResult<SiblingPolicy> {
        let mut policy = SiblingPolicy::platform_default();
        if let Some(preload) = self.siblings.preload {
            policy.enabled = preload;
        }
        policy.scan_directory = self.siblings.scan_directory;
        policy.backend = self.siblings.backend.clone();
        if let Some(manifest) = &self.siblings.manifest {
            policy.manifest = SiblingManifest::load(&expand_home(manifest))?;
        }
        Ok(policy)
    }
}

/// Library location settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LibraryConfig {
    /// Explicit path to the primary library; skips every search
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Build tag looked up under the cache directory
    #[serde(default)]
    pub version: Option<String>,

    /// Directory holding previously fetched builds
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Only accept a bundled artifact
    #[serde(default)]
    pub force_embedded: bool,

    /// Library base name, without platform prefix or suffix
    #[serde(default = "default_library_name")]
    pub name: String,
}

fn default_library_name() -> String {
    "llama".to_string()
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            path: None,
            version: None,
            cache_dir: None,
            force_embedded: false,
            name: default_library_name(),
        }
    }
}

impl LibraryConfig {
    /// `cache_dir` with a leading `~` expanded.
    pub fn cache_dir(&self) -> Option<PathBuf> {
        self.cache_dir.as_deref().map(expand_home)
    }

    /// `path` with a leading `~` expanded.
    pub fn path(&self) -> Option<PathBuf> {
        self.path.as_deref().map(expand_home)
    }
}

/// Sibling preload settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiblingsConfig {
    /// Preload siblings; unset means the platform default
    #[serde(default)]
    pub preload: Option<bool>,

    /// Also open unlisted modules found next to the primary
    #[serde(default = "default_true")]
    pub scan_directory: bool,

    /// Backend whose manifest modules are preloaded
    #[serde(default = "default_backend")]
    pub backend: String,

    /// JSON manifest replacing the built-in one
    #[serde(default)]
    pub manifest: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_backend() -> String {
    "cpu".to_string()
}

impl Default for SiblingsConfig {
    fn default() -> Self {
        Self {
            preload: None,
            scan_directory: true,
            backend: default_backend(),
            manifest: None,
        }
    }
}

fn parse_flag(key: &'static str, value: &str) -> ConfigResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}

fn expand_home(path: &Path) -> PathBuf {
    let rest = match path.strip_prefix("~") {
        Ok(rest) => rest,
        Err(_) => return path.to_path_buf(),
    };
    match std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}
