//! Dynamic Library Loader
//!
//! Opens native modules, resolves symbols in them and closes them again.
//! [`DynamicLoader`] is the seam the orchestrator is generic over;
//! [`SystemLoader`] is the real implementation on top of `libloading`.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::types::{NativeHandle, SymbolAddress};
use crate::error::{CloseFailure, Error, LoadError, LoadFailureKind, Result};

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as platform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as platform;

/// Platform module loading primitives.
pub trait DynamicLoader: Send + Sync {
    /// Open a module by absolute path.
    fn open(&self, path: &Path) -> std::result::Result<NativeHandle, LoadError>;

    /// Open the primary artifact.
    ///
    /// Platforms that need the artifact's directory on the module search
    /// path while its own imports are resolved override this.
    fn open_primary(&self, path: &Path) -> std::result::Result<NativeHandle, LoadError> {
        self.open(path)
    }

    /// Close a handle returned by [`open`](Self::open). Closing an unknown
    /// or already-closed handle is an error, not a panic.
    fn close(&self, handle: NativeHandle) -> std::result::Result<(), CloseFailure>;

    /// Resolve an exported symbol in one module.
    fn resolve(&self, handle: NativeHandle, name: &str) -> Result<SymbolAddress>;
}

impl<L: DynamicLoader + ?Sized> DynamicLoader for &L {
    fn open(&self, path: &Path) -> std::result::Result<NativeHandle, LoadError> {
        (**self).open(path)
    }

    fn open_primary(&self, path: &Path) -> std::result::Result<NativeHandle, LoadError> {
        (**self).open_primary(path)
    }

    fn close(&self, handle: NativeHandle) -> std::result::Result<(), CloseFailure> {
        (**self).close(handle)
    }

    fn resolve(&self, handle: NativeHandle, name: &str) -> Result<SymbolAddress> {
        (**self).resolve(handle, name)
    }
}

/// The OS loader: `dlopen` on Unix, `LoadLibraryExW` on Windows.
///
/// Owns exactly one reference per distinct module. Opening a module that is
/// already open returns the existing handle. Handles are issued by the
/// loader, not taken from the OS, so a handle is never reissued after it
/// has been closed even when the OS hands back the same module address.
pub struct SystemLoader {
    modules: Mutex<Modules>,
    next_handle: AtomicUsize,
}

#[derive(Default)]
struct Modules {
    by_handle: HashMap<NativeHandle, OpenModule>,
    by_raw: HashMap<usize, NativeHandle>,
}

struct OpenModule {
    raw: usize,
    library: platform::OsLibrary,
}

impl SystemLoader {
    pub fn new() -> Self {
        Self {
            modules: Mutex::new(Modules::default()),
            next_handle: AtomicUsize::new(1),
        }
    }

    /// Number of handles currently held open.
    pub fn open_count(&self) -> usize {
        self.modules.lock().by_handle.len()
    }

    fn adopt(&self, library: platform::OsLibrary) -> NativeHandle {
        let (raw, library) = platform::split(library);
        let mut guard = self.modules.lock();
        let modules = &mut *guard;
        match modules.by_raw.entry(raw) {
            Entry::Occupied(existing) => {
                let handle = *existing.get();
                // The OS bumped its refcount; drop the extra reference.
                if let Err(e) = library.close() {
                    debug!(%handle, error = %e, "failed to release duplicate module reference");
                }
                handle
            }
            Entry::Vacant(slot) => {
                let handle = NativeHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
                slot.insert(handle);
                modules.by_handle.insert(handle, OpenModule { raw, library });
                handle
            }
        }
    }
}

impl Default for SystemLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamicLoader for SystemLoader {
    fn open(&self, path: &Path) -> std::result::Result<NativeHandle, LoadError> {
        let library = platform::open(path)?;
        let handle = self.adopt(library);
        trace!(path = %path.display(), %handle, "opened native module");
        Ok(handle)
    }

    fn open_primary(&self, path: &Path) -> std::result::Result<NativeHandle, LoadError> {
        let library = platform::open_primary(path)?;
        let handle = self.adopt(library);
        debug!(path = %path.display(), %handle, "opened primary native module");
        Ok(handle)
    }

    fn close(&self, handle: NativeHandle) -> std::result::Result<(), CloseFailure> {
        let module = {
            let mut modules = self.modules.lock();
            let module = modules.by_handle.remove(&handle).ok_or_else(|| CloseFailure {
                handle,
                detail: "handle is not open".to_string(),
            })?;
            modules.by_raw.remove(&module.raw);
            module
        };

        module.library.close().map_err(|e| CloseFailure {
            handle,
            detail: e.to_string(),
        })
    }

    fn resolve(&self, handle: NativeHandle, name: &str) -> Result<SymbolAddress> {
        let not_found = || Error::SymbolNotFound {
            name: name.to_string(),
            searched: 1,
        };

        let modules = self.modules.lock();
        let module = modules.by_handle.get(&handle).ok_or_else(not_found)?;
        platform::symbol(&module.library, name).ok_or_else(not_found)
    }
}

/// Construct the platform-specific library filename
pub fn library_filename(name: &str) -> String {
    #[cfg(target_os = "macos")]
    {
        if name.starts_with("lib") && name.ends_with(".dylib") {
            name.to_string()
        } else {
            format!("lib{}.dylib", name)
        }
    }

    #[cfg(target_os = "windows")]
    {
        if name.ends_with(".dll") {
            name.to_string()
        } else {
            format!("{}.dll", name)
        }
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        if name.starts_with("lib") && name.contains(".so") {
            name.to_string()
        } else {
            format!("lib{}.so", name)
        }
    }
}

/// Whether a file name looks like a loadable module on this platform.
pub fn is_loadable_module(file_name: &str) -> bool {
    let lower = file_name.to_lowercase();

    #[cfg(target_os = "windows")]
    {
        lower.ends_with(".dll")
    }

    #[cfg(target_os = "macos")]
    {
        lower.ends_with(".dylib") || lower.ends_with(".so")
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        // libfoo.so, libfoo.so.1, libfoo.so.1.2.3
        match lower.find(".so") {
            Some(pos) => {
                let rest = &lower[pos + 3..];
                rest.is_empty()
                    || (rest.starts_with('.')
                        && rest[1..]
                            .split('.')
                            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit())))
            }
            None => false,
        }
    }
}

/// Classify a failure once the platform detail has been examined.
///
/// A missing primary file always wins over whatever the platform reported.
pub(crate) fn classify_with(path: &Path, detected: LoadFailureKind) -> LoadFailureKind {
    if !path.exists() {
        LoadFailureKind::FileNotFound
    } else {
        detected
    }
}
