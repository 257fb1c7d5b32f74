//! dlopen/dlsym backend.

use std::ffi::{c_void, CString};
use std::path::Path;

use libloading::os::unix::{Library, RTLD_LOCAL, RTLD_NOW};

use super::classify_with;
use crate::error::{LoadError, LoadFailureKind};
use crate::ffi::types::SymbolAddress;

pub(super) type OsLibrary = Library;

/// dlerror fragments reported for files that are not a module for this
/// process (glibc, musl, dyld).
const FORMAT_MARKERS: &[&str] = &[
    "wrong elf class",
    "invalid elf header",
    "file too short",
    "elf file's phentsize",
    "exec format error",
    "not a mach-o file",
    "incompatible architecture",
    "wrong architecture",
    "slice is not valid mach-o",
    "mach-o, but wrong",
];

/// Fragments reported when a dependency of an existing file is missing.
const DEPENDENCY_MARKERS: &[&str] = &[
    "cannot open shared object file",
    "library not loaded",
    "error loading shared library",
];

pub(super) fn open(path: &Path) -> Result<Library, LoadError> {
    // Safety: loading runs the module's initializers. The caller vouches for
    // the artifact; the resolver only hands out paths it located on purpose.
    unsafe { Library::open(Some(path), RTLD_NOW | RTLD_LOCAL) }
        .map_err(|e| load_error(path, &e.to_string()))
}

pub(super) fn open_primary(path: &Path) -> Result<Library, LoadError> {
    open(path)
}

pub(super) fn split(library: Library) -> (usize, Library) {
    let raw = library.into_raw();
    // Safety: `raw` came from `into_raw` on the line above.
    (raw as usize, unsafe { Library::from_raw(raw) })
}

pub(super) fn symbol(library: &Library, name: &str) -> Option<SymbolAddress> {
    let name = CString::new(name).ok()?;
    // Safety: the address is only ever reinterpreted through a typed slot or
    // a call plan whose signature the caller declared.
    let symbol = unsafe { library.get::<*mut c_void>(name.as_bytes_with_nul()) }.ok()?;
    SymbolAddress::new(*symbol as usize)
}

pub(super) fn load_error(path: &Path, detail: &str) -> LoadError {
    LoadError::new(classify(path, detail), path, detail)
}

fn classify(path: &Path, detail: &str) -> LoadFailureKind {
    let lower = detail.to_lowercase();
    let detected = if FORMAT_MARKERS.iter().any(|m| lower.contains(m)) {
        LoadFailureKind::ArchitectureMismatch
    } else if DEPENDENCY_MARKERS.iter().any(|m| lower.contains(m)) {
        LoadFailureKind::DependencyMissing
    } else {
        LoadFailureKind::Other
    };
    classify_with(path, detected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_dlerror_messages() {
        // Any existing file will do; classification only checks existence.
        let exe = std::env::current_exe().unwrap();

        assert_eq!(
            classify(&exe, "/x/libllama.so: wrong ELF class: ELFCLASS32"),
            LoadFailureKind::ArchitectureMismatch
        );
        assert_eq!(
            classify(&exe, "/x/libllama.so: invalid ELF header"),
            LoadFailureKind::ArchitectureMismatch
        );
        assert_eq!(
            classify(&exe, "libggml.so: cannot open shared object file: No such file or directory"),
            LoadFailureKind::DependencyMissing
        );
        assert_eq!(
            classify(&exe, "dlopen(/x/libllama.dylib): Library not loaded: @rpath/libggml.dylib"),
            LoadFailureKind::DependencyMissing
        );
        assert_eq!(classify(&exe, "undefined symbol: foo"), LoadFailureKind::Other);
    }

    #[test]
    fn test_classify_missing_primary() {
        let path = Path::new("/nonexistent/llamalink/libllama.so");
        assert_eq!(
            classify(path, "cannot open shared object file: No such file or directory"),
            LoadFailureKind::FileNotFound
        );
    }
}
