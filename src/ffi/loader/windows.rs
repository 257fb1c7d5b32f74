//! LoadLibraryExW/GetProcAddress backend.
//!
//! The primary artifact's directory is put on the DLL search path only for
//! the duration of the primary open. `AddDllDirectory` scopes the change to
//! loads that ask for user directories; `SetDllDirectoryW` is the
//! process-wide fallback for systems without it.

use std::ffi::{c_void, CString, OsStr};
use std::iter;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;

use libloading::os::windows::{

    Library, LOAD_LIBRARY_SEARCH_DEFAULT_DIRS, LOAD_LIBRARY_SEARCH_DLL_LOAD_DIR,

    LOAD_WITH_ALTERED_SEARCH_PATH,

};
use once_cell::sync::Lazy;
use tracing::{debug, warn};

use super::classify_with;
use crate::error::{LoadError, LoadFailureKind};
use crate::ffi::types::SymbolAddress;

pub(super) type OsLibrary = Library;

const ERROR_FILE_NOT_FOUND: i32 = 2;
const ERROR_PATH_NOT_FOUND: i32 = 3;
const ERROR_INVALID_PARAMETER: i32 = 87;
const ERROR_MOD_NOT_FOUND: i32 = 126;
const ERROR_PROC_NOT_FOUND: i32 = 127;
const ERROR_BAD_EXE_FORMAT: i32 = 193;
const ERROR_EXE_MACHINE_TYPE_MISMATCH: i32 = 216;

type AddDllDirectoryFn = unsafe extern "system" fn(*const u16) -> *mut c_void;
type RemoveDllDirectoryFn = unsafe extern "system" fn(*mut c_void) -> i32;
type SetDllDirectoryWFn = unsafe extern "system" fn(*const u16) -> i32;

/// Search-path entry points, resolved once from kernel32.
struct Kernel32 {
    add_dll_directory: Option<AddDllDirectoryFn>,
    remove_dll_directory: Option<RemoveDllDirectoryFn>,
    set_dll_directory: Option<SetDllDirectoryWFn>,
}

static KERNEL32: Lazy<Kernel32> = Lazy::new(|| {
    let kernel32 = match Library::open_already_loaded("kernel32.dll") {
        Ok(lib) => lib,
        Err(e) => {
            warn!(error = %e, "kernel32.dll not available; DLL search path left unchanged");
            return Kernel32 {
                add_dll_directory: None,
                remove_dll_directory: None,
                set_dll_directory: None,
            };
        }
    };

    // Safety: the declared signatures match the documented Win32 prototypes.
    // kernel32 is never unloaded, so the pointers outlive `kernel32`.
    unsafe {
        Kernel32 {
            add_dll_directory: kernel32
                .get::<AddDllDirectoryFn>(b"AddDllDirectory\0")
                .ok()
                .map(|s| *s),
            remove_dll_directory: kernel32
                .get::<RemoveDllDirectoryFn>(b"RemoveDllDirectory\0")
                .ok()
                .map(|s| *s),
            set_dll_directory: kernel32
                .get::<SetDllDirectoryWFn>(b"SetDllDirectoryW\0")
                .ok()
                .map(|s| *s),
        }
    }
});

/// Reverts a DLL search-path change on drop.
enum SearchPathGuard {
    Scoped {
        cookie: *mut c_void,
        remove: RemoveDllDirectoryFn,
    },
    ProcessWide {
        set: SetDllDirectoryWFn,
    },
    Unchanged,
}

impl SearchPathGuard {
    fn extend(dir: &Path) -> Self {
        let wide = to_wide(dir.as_os_str());

        if let (Some(add), Some(remove)) =
            (KERNEL32.add_dll_directory, KERNEL32.remove_dll_directory)
        {
            // Safety: `wide` is NUL-terminated and outlives the call.
            let cookie = unsafe { add(wide.as_ptr()) };
            if !cookie.is_null() {
                debug!(dir = %dir.display(), "added scoped DLL directory");
                return SearchPathGuard::Scoped { cookie, remove };
            }
        }

        if let Some(set) = KERNEL32.set_dll_directory {
            // Safety: as above.
            if unsafe { set(wide.as_ptr()) } != 0 {
                debug!(dir = %dir.display(), "set process-wide DLL directory");
                return SearchPathGuard::ProcessWide { set };
            }
        }

        warn!(dir = %dir.display(), "could not extend DLL search path");
        SearchPathGuard::Unchanged
    }

    fn is_scoped(&self) -> bool {
        matches!(self, SearchPathGuard::Scoped { .. })
    }
}

impl Drop for SearchPathGuard {
    fn drop(&mut self) {
        match *self {
            SearchPathGuard::Scoped { cookie, remove } => {
                // Safety: `cookie` came from AddDllDirectory and is removed once.
                if unsafe { remove(cookie) } == 0 {
                    warn!("RemoveDllDirectory failed");
                }
            }
            SearchPathGuard::ProcessWide { set } => {
                // Safety: NULL restores the default search order.
                unsafe { set(std::ptr::null()) };
            }
            SearchPathGuard::Unchanged => {}
        }
    }
}

pub(super) fn open(path: &Path) -> Result<Library, LoadError> {
    let flags = LOAD_LIBRARY_SEARCH_DEFAULT_DIRS | LOAD_LIBRARY_SEARCH_DLL_LOAD_DIR;
    // Safety: see `open_primary`.
    match unsafe { Library::load_with_flags(path, flags) } {
        Ok(lib) => Ok(lib),
        Err(e) if os_error_code(&e.to_string()) == Some(ERROR_INVALID_PARAMETER) => {
            // Pre-KB2533623 systems reject the LOAD_LIBRARY_SEARCH_* flags.
            unsafe { Library::load_with_flags(path, LOAD_WITH_ALTERED_SEARCH_PATH) }
                .map_err(|e| load_error(path, &e.to_string()))
        }
        Err(e) => Err(load_error(path, &e.to_string())),
    }
}

pub(super) fn open_primary(path: &Path) -> Result<Library, LoadError> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => return open(path),
    };

    let guard = SearchPathGuard::extend(dir);
    let flags = if guard.is_scoped() {
        LOAD_LIBRARY_SEARCH_DEFAULT_DIRS | LOAD_LIBRARY_SEARCH_DLL_LOAD_DIR
    } else {
        LOAD_WITH_ALTERED_SEARCH_PATH
    };

    // Safety: loading runs DllMain. The caller vouches for the artifact.
    let result = unsafe { Library::load_with_flags(path, flags) };
    drop(guard);

    result.map_err(|e| load_error(path, &e.to_string()))
}

pub(super) fn split(library: Library) -> (usize, Library) {
    let raw = library.into_raw();
    // Safety: `raw` came from `into_raw` on the line above.
    (raw as usize, unsafe { Library::from_raw(raw) })
}

pub(super) fn symbol(library: &Library, name: &str) -> Option<SymbolAddress> {
    let name = CString::new(name).ok()?;
    // Safety: the address is only reinterpreted through a declared signature.
    let symbol = unsafe { library.get::<*mut c_void>(name.as_bytes_with_nul()) }.ok()?;
    SymbolAddress::new(*symbol as usize)
}

pub(super) fn load_error(path: &Path, detail: &str) -> LoadError {
    LoadError::new(classify(path, os_error_code(detail)), path, detail)
}

fn classify(path: &Path, code: Option<i32>) -> LoadFailureKind {
    let detected = match code {
        Some(ERROR_FILE_NOT_FOUND) | Some(ERROR_PATH_NOT_FOUND) => LoadFailureKind::FileNotFound,
        // The file exists (checked below), so the missing module is an import.
        Some(ERROR_MOD_NOT_FOUND) | Some(ERROR_PROC_NOT_FOUND) => {
            LoadFailureKind::DependencyMissing
        }
        Some(ERROR_BAD_EXE_FORMAT) | Some(ERROR_EXE_MACHINE_TYPE_MISMATCH) => {
            LoadFailureKind::ArchitectureMismatch
        }
        _ => LoadFailureKind::Other,
    };
    classify_with(path, detected)
}

/// Extract the Win32 error code from an `io::Error` rendering ("... (os error 126)").
fn os_error_code(detail: &str) -> Option<i32> {
    let start = detail.rfind("(os error ")? + "(os error ".len();
    let rest = &detail[start..];
    let end = rest.find(')')?;
    rest[..end].trim().parse().ok()
}

fn to_wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(iter::once(0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_error_code() {
        assert_eq!(
            os_error_code(
                "LoadLibraryExW failed: %1 is not a valid Win32 application. (os error 193)"
            ),
            Some(193)
        );
        assert_eq!(os_error_code("no code here"), None);
    }

    #[test]
    fn test_classify_codes() {
        let exe = std::env::current_exe().unwrap();
        assert_eq!(classify(&exe, Some(193)), LoadFailureKind::ArchitectureMismatch);
        assert_eq!(classify(&exe, Some(126)), LoadFailureKind::DependencyMissing);
        assert_eq!(
            classify(Path::new("C:\\nope\\llama.dll"), Some(126)),
            LoadFailureKind::FileNotFound
        );
    }
}
