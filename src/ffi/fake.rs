//! In-memory loader for unit tests.
//!
//! Modules are registered up front by path with a base handle and export
//! table. The first open of a module yields its base handle; every reopen
//! after a close yields a new one, as the real loader does. Nothing touches
//! the filesystem or the OS loader.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::loader::DynamicLoader;
use super::types::{NativeHandle, SymbolAddress};
use crate::error::{CloseFailure, Error, LoadError, LoadFailureKind, Result};

/// Distance between the handles of successive opens of one module.
const REOPEN_STRIDE: usize = 0x1_0000;

#[derive(Debug, Clone)]
struct FakeModule {
    base: usize,
    generation: usize,
    exports: HashMap<String, usize>,
    failure: Option<LoadFailureKind>,
}

#[derive(Debug, Default)]
struct FakeState {
    modules: HashMap<PathBuf, FakeModule>,
    open: HashMap<NativeHandle, PathBuf>,
    fail_close: HashSet<NativeHandle>,
    closed: Vec<NativeHandle>,
}

#[derive(Debug, Default)]
pub(crate) struct FakeLoader {
    state: Mutex<FakeState>,
    open_delay: Option<Duration>,
    opens: AtomicUsize,
}

impl FakeLoader {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a module at `path` exporting `exports` (name, address).
    pub(crate) fn with_module(
        self,
        path: impl Into<PathBuf>,
        handle: usize,
        exports: &[(&str, usize)],
    ) -> Self {
        let module = FakeModule {
            base: handle,
            generation: 0,
            exports: exports.iter().map(|(n, a)| (n.to_string(), *a)).collect(),
            failure: None,
        };
        self.state.lock().modules.insert(path.into(), module);
        self
    }

    /// Register a module at `path` whose open always fails with `kind`.
    pub(crate) fn with_failing_module(
        self,
        path: impl Into<PathBuf>,
        kind: LoadFailureKind,
    ) -> Self {
        let module = FakeModule {
            base: 0,
            generation: 0,
            exports: HashMap::new(),
            failure: Some(kind),
        };
        self.state.lock().modules.insert(path.into(), module);
        self
    }

    /// Sleep inside every open, to widen race windows.
    pub(crate) fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    /// Make closing `handle` fail.
    pub(crate) fn fail_close_of(self, handle: usize) -> Self {
        self.state.lock().fail_close.insert(NativeHandle::from_raw(handle));
        self
    }

    /// Total number of open attempts, successful or not.
    pub(crate) fn open_calls(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Handles currently open.
    pub(crate) fn open_count(&self) -> usize {
        self.state.lock().open.len()
    }

    pub(crate) fn is_open(&self, handle: NativeHandle) -> bool {
        self.state.lock().open.contains_key(&handle)
    }

    /// Handles closed so far, in close order.
    pub(crate) fn closed(&self) -> Vec<NativeHandle> {
        self.state.lock().closed.clone()
    }
}

impl DynamicLoader for FakeLoader {
    fn open(&self, path: &Path) -> std::result::Result<NativeHandle, LoadError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.open_delay {
            std::thread::sleep(delay);
        }

        let mut state = self.state.lock();
        if let Some((&handle, _)) = state.open.iter().find(|(_, open)| open.as_path() == path) {
            return Ok(handle);
        }
        let module = match state.modules.get_mut(path) {
            Some(module) => module,
            None => {
                let kind = LoadFailureKind::FileNotFound;
                return Err(LoadError::new(kind, path, "no such fake module"));
            }
        };
        if let Some(kind) = module.failure {
            return Err(LoadError::new(kind, path, "fake load failure"));
        }
        let handle = NativeHandle::from_raw(module.base + module.generation * REOPEN_STRIDE);
        module.generation += 1;
        state.open.insert(handle, path.to_path_buf());
        Ok(handle)
    }

    fn close(&self, handle: NativeHandle) -> std::result::Result<(), CloseFailure> {
        let mut state = self.state.lock();
        if state.open.remove(&handle).is_none() {
            return Err(CloseFailure {
                handle,
                detail: "handle is not open".to_string(),
            });
        }
        state.closed.push(handle);
        if state.fail_close.contains(&handle) {
            return Err(CloseFailure {
                handle,
                detail: "fake close failure".to_string(),
            });
        }
        Ok(())
    }

    fn resolve(&self, handle: NativeHandle, name: &str) -> Result<SymbolAddress> {
        let not_found = || Error::SymbolNotFound {
            name: name.to_string(),
            searched: 1,
        };

        let state = self.state.lock();
        let path = state.open.get(&handle).ok_or_else(not_found)?;
        let module = state.modules.get(path).ok_or_else(not_found)?;
        module
            .exports
            .get(name)
            .and_then(|&address| SymbolAddress::new(address))
            .ok_or_else(not_found)
    }
}
