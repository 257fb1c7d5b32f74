//! Library Load Orchestrator
//!
//! Owns one load session of the native library: the primary handle, every
//! sibling opened next to it, the registry that searches them and the
//! binding set filled from them.
//!
//! # Lifecycle
//!
//! ```text
//! Unloaded ──load()──► resolve ─► open primary ─► preload siblings ─► bind ──► Loaded
//!    ▲                    │             │                                │
//!    │                    └─────────────┴──── any failure: reset slots, ─┘
//!    │                                         close what was opened
//!    └──────────unload()── reset slots, close all handles, drop scratch dir
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{CloseFailure, Error, Result};
use crate::ffi::{
    bind_set, discover_siblings, reset_all, BindReport, BindSpec, DynamicLoader, NativeHandle,
    SiblingPolicy, SymbolRegistry, SystemLoader,
};
use crate::resolve::{ArtifactResolver, ResolvedArtifact};

/// Whether a library session is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    Unloaded,
    Loaded,
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadState::Unloaded => write!(f, "unloaded"),
            LoadState::Loaded => write!(f, "loaded"),
        }
    }
}

#[derive(Debug, Default)]
struct Session {
    state: LoadState,
    primary: NativeHandle,
    registry: SymbolRegistry,
    artifact: Option<ResolvedArtifact>,
    report: BindReport,
}

/// A native library and the function slots bound from it.
///
/// Loading is idempotent and safe to race: concurrent callers serialize on
/// the session lock and exactly one of them performs the work.
pub struct Library<L: DynamicLoader = SystemLoader> {
    loader: L,
    resolver: Box<dyn ArtifactResolver>,
    bindings: &'static [BindSpec],
    siblings: SiblingPolicy,
    session: RwLock<Session>,
}

impl Library<SystemLoader> {
    /// A library loaded through the OS loader.
    pub fn system(
        resolver: impl ArtifactResolver + 'static,
        bindings: &'static [BindSpec],
    ) -> Self {
        Self::new(SystemLoader::new(), resolver, bindings)
    }
}

impl<L: DynamicLoader> Library<L> {
    pub fn new(
        loader: L,
        resolver: impl ArtifactResolver + 'static,
        bindings: &'static [BindSpec],
    ) -> Self {
        Self {
            loader,
            resolver: Box::new(resolver),
            bindings,
            siblings: SiblingPolicy::platform_default(),
            session: RwLock::new(Session::default()),
        }
    }

    pub fn with_sibling_policy(mut self, policy: SiblingPolicy) -> Self {
        self.siblings = policy;
        self
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn bindings(&self) -> &'static [BindSpec] {
        self.bindings
    }

    /// Load and bind. A no-op when already loaded.
    pub fn load(&self) -> Result<()> {
        if self.session.read().state == LoadState::Loaded {
            return Ok(());
        }

        let mut session = self.session.write();
        if session.state == LoadState::Loaded {
            return Ok(());
        }

        *session = self.open_session()?;
        info!(
            path = %session
                .artifact
                .as_ref()
                .map(|a| a.path.display().to_string())
                .unwrap_or_default(),
            modules = session.registry.len(),
            bound = session.report.bound.len(),
            missing_optional = session.report.missing_optional.len(),
            "native library loaded"
        );
        Ok(())
    }

    fn open_session(&self) -> Result<Session> {
        let artifact = self.resolver.resolve()?;

        let primary = match self.loader.open_primary(&artifact.path) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(
                    path = %artifact.path.display(),
                    kind = %e.kind,
                    "failed to open native library"
                );
                remove_scratch(artifact.scratch_dir.as_deref());
                return Err(e.into());
            }
        };

        let mut registry = SymbolRegistry::new();
        registry.register(primary);
        for handle in discover_siblings(&self.loader, &artifact.path, &self.siblings) {
            registry.register(handle);
        }

        match bind_set(&self.loader, &registry, primary, self.bindings) {
            Ok(report) => {
                for binding in report.from_siblings(primary) {
                    debug!(
                        symbol = %binding.name,
                        owner = %binding.owner,
                        "bound from sibling module"
                    );
                }
                Ok(Session {
                    state: LoadState::Loaded,
                    primary,
                    registry,
                    artifact: Some(artifact),
                    report,
                })
            }
            Err(e) => {
                warn!(error = %e, "binding failed; rolling back load");
                reset_all(self.bindings);
                for failure in self.close_all(registry.handles()) {
                    warn!(
                        handle = %failure.handle,
                        detail = %failure.detail,
                        "close failed during rollback"
                    );
                }
                remove_scratch(artifact.scratch_dir.as_deref());
                Err(e)
            }
        }
    }

    /// Reset every slot, close every handle and return to
    /// [`LoadState::Unloaded`]. A no-op when not loaded.
    ///
    /// The state is `Unloaded` afterwards even if some handles failed to
    /// close; those are reported together as [`Error::CloseFailed`].
    pub fn unload(&self) -> Result<()> {
        let mut session = self.session.write();
        if session.state == LoadState::Unloaded {
            return Ok(());
        }

        let old = std::mem::take(&mut *session);
        reset_all(self.bindings);
        let failures = self.close_all(old.registry.handles());
        if let Some(artifact) = &old.artifact {
            remove_scratch(artifact.scratch_dir.as_deref());
        }

        if failures.is_empty() {
            info!(modules = old.registry.len(), "native library unloaded");
            Ok(())
        } else {
            for failure in &failures {
                warn!(
                    handle = %failure.handle,
                    detail = %failure.detail,
                    "failed to close native module"
                );
            }
            Err(Error::CloseFailed { failures })
        }
    }

    /// Close in reverse registration order, collecting failures.
    fn close_all(&self, handles: &[NativeHandle]) -> Vec<CloseFailure> {
        handles
            .iter()
            .rev()
            .filter_map(|&handle| self.loader.close(handle).err())
            .collect()
    }

    pub fn state(&self) -> LoadState {
        self.session.read().state
    }

    pub fn is_loaded(&self) -> bool {
        self.state() == LoadState::Loaded
    }

    /// The primary module handle while loaded.
    pub fn handle(&self) -> Option<NativeHandle> {
        let session = self.session.read();
        (session.state == LoadState::Loaded).then_some(session.primary)
    }

    /// Every open handle, primary first.
    pub fn handles(&self) -> Vec<NativeHandle> {
        self.session.read().registry.handles().to_vec()
    }

    /// Path of the loaded primary artifact.
    pub fn artifact_path(&self) -> Option<PathBuf> {
        self.session.read().artifact.as_ref().map(|a| a.path.clone())
    }

    /// What the last successful load bound.
    pub fn bind_report(&self) -> Option<BindReport> {
        let session = self.session.read();
        (session.state == LoadState::Loaded).then(|| session.report.clone())
    }
}

impl<L: DynamicLoader> Drop for Library<L> {
    fn drop(&mut self) {
        if let Err(e) = self.unload() {
            warn!(error = %e, "unload on drop failed");
        }
    }
}

impl<L: DynamicLoader> fmt::Debug for Library<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let session = self.session.read();
        f.debug_struct("Library")
            .field("state", &session.state)
            .field("primary", &session.primary)
            .field("modules", &session.registry.len())
            .field("bindings", &self.bindings.len())
            .finish()
    }
}

fn remove_scratch(dir: Option<&Path>) {
    if let Some(dir) = dir {
        match std::fs::remove_dir_all(dir) {
            Ok(()) => debug!(dir = %dir.display(), "removed scratch directory"),
            Err(e) => warn!(dir = %dir.display(), error = %e, "failed to remove scratch directory"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoadFailureKind;
    use crate::ffi::fake::FakeLoader;
    use crate::ffi::{library_filename, FunctionSlot};
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    /// Resolves to a fixed path without touching the filesystem.
    struct At(&'static str);

    impl ArtifactResolver for At {
        fn resolve(&self) -> Result<ResolvedArtifact> {
            Ok(ResolvedArtifact::at(self.0))
        }
    }

    struct Unavailable;

    impl ArtifactResolver for Unavailable {
        fn resolve(&self) -> Result<ResolvedArtifact> {
            Err(Error::ArtifactUnavailable("nothing here".to_string()))
        }
    }

    fn llama_module(loader: FakeLoader) -> FakeLoader {
        loader.with_module(
            "/fake/libllama",
            0x100,
            &[("llama_backend_init", 0x1000), ("llama_time_us", 0x1008)],
        )
    }

    #[test]
    fn test_load_is_idempotent() {
        static INIT: FunctionSlot<unsafe extern "C" fn()> = FunctionSlot::new("llama_backend_init");
        static SET: &[BindSpec] = &[BindSpec::required(&INIT)];

        let lib = Library::new(llama_module(FakeLoader::new()), At("/fake/libllama"), SET)
            .with_sibling_policy(SiblingPolicy::disabled());

        assert_eq!(lib.state(), LoadState::Unloaded);
        lib.load().unwrap();
        let first = lib.handle();
        lib.load().unwrap();

        assert!(lib.is_loaded());
        assert_eq!(lib.handle(), first);
        assert_eq!(lib.loader().open_calls(), 1);
        assert_eq!(lib.handles().len(), 1);
        assert_eq!(INIT.address().map(|a| a.as_raw()), Some(0x1000));
        lib.unload().unwrap();
    }

    #[test]
    fn test_unload_is_clean() {
        static INIT: FunctionSlot<unsafe extern "C" fn()> = FunctionSlot::new("llama_backend_init");
        static TIME: FunctionSlot<unsafe extern "C" fn() -> i64> =
            FunctionSlot::new("llama_time_us");
        static SET: &[BindSpec] = &[BindSpec::required(&INIT), BindSpec::required(&TIME)];

        let lib = Library::new(llama_module(FakeLoader::new()), At("/fake/libllama"), SET)
            .with_sibling_policy(SiblingPolicy::disabled());

        lib.load().unwrap();
        let first = lib.handles();
        lib.unload().unwrap();

        assert!(!lib.is_loaded());
        assert_eq!(lib.handle(), None);
        assert!(lib.handles().is_empty());
        assert!(lib.bind_report().is_none());
        assert!(!INIT.is_bound() && !TIME.is_bound());
        assert_eq!(lib.loader().open_count(), 0);
        assert!(!lib.loader().is_open(NativeHandle::from_raw(0x100)));

        // Unloading again does nothing; a reload starts a fresh session.
        lib.unload().unwrap();
        lib.load().unwrap();
        assert_eq!(lib.loader().open_calls(), 2);
        assert!(TIME.is_bound());

        // No handle from the first session comes back in the second.
        let second = lib.handles();
        assert_eq!(second.len(), 1);
        assert!(second.iter().all(|h| !first.contains(h)));
        assert!(lib.loader().close(first[0]).is_err());
        assert!(lib.loader().resolve(first[0], "llama_time_us").is_err());
        assert!(lib.is_loaded());
        lib.unload().unwrap();
    }

    #[test]
    fn test_optional_symbol_missing() {
        static INIT: FunctionSlot<unsafe extern "C" fn()> = FunctionSlot::new("llama_backend_init");
        static CUDA: FunctionSlot<unsafe extern "C" fn() -> *mut u8> =
            FunctionSlot::new("ggml_backend_cuda_init");
        static SET: &[BindSpec] = &[BindSpec::required(&INIT), BindSpec::optional(&CUDA)];

        let lib = Library::new(llama_module(FakeLoader::new()), At("/fake/libllama"), SET)
            .with_sibling_policy(SiblingPolicy::disabled());

        lib.load().unwrap();
        let report = lib.bind_report().unwrap();
        assert_eq!(report.missing_optional, vec!["ggml_backend_cuda_init"]);
        assert!(matches!(CUDA.require(), Err(Error::NotAvailable("ggml_backend_cuda_init"))));
        lib.unload().unwrap();
    }

    #[test]
    fn test_missing_required_rolls_back() {
        static INIT: FunctionSlot<unsafe extern "C" fn()> = FunctionSlot::new("llama_backend_init");
        static FREE: FunctionSlot<unsafe extern "C" fn()> = FunctionSlot::new("llama_backend_free");
        static SET: &[BindSpec] = &[BindSpec::required(&INIT), BindSpec::required(&FREE)];

        let lib = Library::new(llama_module(FakeLoader::new()), At("/fake/libllama"), SET)
            .with_sibling_policy(SiblingPolicy::disabled());

        let err = lib.load().unwrap_err();
        assert!(matches!(
            err,
            Error::SymbolNotFound { ref name, .. } if name == "llama_backend_free"
        ));
        assert_eq!(lib.state(), LoadState::Unloaded);
        assert!(!INIT.is_bound());
        assert_eq!(lib.loader().open_count(), 0);
        assert_eq!(lib.loader().closed(), vec![NativeHandle::from_raw(0x100)]);
    }

    #[test]
    fn test_open_failure_kind_is_preserved() {
        static SET: &[BindSpec] = &[];

        let loader = FakeLoader::new()
            .with_failing_module("/fake/libllama", LoadFailureKind::DependencyMissing);
        let lib = Library::new(loader, At("/fake/libllama"), SET)
            .with_sibling_policy(SiblingPolicy::disabled());

        let err = lib.load().unwrap_err();
        assert_eq!(err.load_failure(), Some(LoadFailureKind::DependencyMissing));
        assert!(!lib.is_loaded());

        // A failed load does not poison later attempts.
        assert!(lib.load().is_err());
        assert_eq!(lib.loader().open_calls(), 2);
    }

    #[test]
    fn test_resolver_failure() {
        static SET: &[BindSpec] = &[];

        let lib = Library::new(FakeLoader::new(), Unavailable, SET);
        assert!(matches!(lib.load(), Err(Error::ArtifactUnavailable(_))));
        assert_eq!(lib.loader().open_calls(), 0);
    }

    #[test]
    fn test_concurrent_load() {
        static INIT: FunctionSlot<unsafe extern "C" fn()> = FunctionSlot::new("llama_backend_init");
        static SET: &[BindSpec] = &[BindSpec::required(&INIT)];
        const THREADS: usize = 50;

        let loader = llama_module(FakeLoader::new()).with_open_delay(Duration::from_millis(20));
        let lib = Library::new(loader, At("/fake/libllama"), SET)
            .with_sibling_policy(SiblingPolicy::disabled());
        let barrier = Arc::new(Barrier::new(THREADS));

        std::thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let barrier = Arc::clone(&barrier);
                    let lib = &lib;
                    s.spawn(move || {
                        barrier.wait();
                        lib.load().map(|_| lib.handle())
                    })
                })
                .collect();

            for handle in handles {
                let loaded = handle.join().unwrap().unwrap();
                assert_eq!(loaded, Some(NativeHandle::from_raw(0x100)));
            }
        });

        assert_eq!(lib.loader().open_calls(), 1);
        assert_eq!(lib.loader().open_count(), 1);
        lib.unload().unwrap();
    }

    #[test]
    fn test_close_failures_are_aggregated() {
        static INIT: FunctionSlot<unsafe extern "C" fn()> = FunctionSlot::new("llama_backend_init");
        static SET: &[BindSpec] = &[BindSpec::required(&INIT)];

        let loader = llama_module(FakeLoader::new()).fail_close_of(0x100);
        let lib = Library::new(loader, At("/fake/libllama"), SET)
            .with_sibling_policy(SiblingPolicy::disabled());

        lib.load().unwrap();
        match lib.unload() {
            Err(Error::CloseFailed { failures }) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].handle, NativeHandle::from_raw(0x100));
            }
            other => panic!("expected CloseFailed, got {:?}", other),
        }
        assert!(!lib.is_loaded());
        assert!(!INIT.is_bound());
    }

    #[test]
    fn test_symbol_bound_from_sibling() {
        static INIT: FunctionSlot<unsafe extern "C" fn()> = FunctionSlot::new("llama_backend_init");
        static LOAD_ALL: FunctionSlot<unsafe extern "C" fn()> =
            FunctionSlot::new("ggml_backend_load_all");
        static SET: &[BindSpec] = &[BindSpec::required(&INIT), BindSpec::optional(&LOAD_ALL)];

        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join(library_filename("llama"));
        let base = dir.path().join(library_filename("ggml-base"));
        std::fs::write(&primary, b"").unwrap();
        std::fs::write(&base, b"").unwrap();

        let loader = FakeLoader::new()
            .with_module(&primary, 0x100, &[("llama_backend_init", 0x1000)])
            .with_module(&base, 0x200, &[("ggml_backend_load_all", 0x2000)]);
        let lib = Library::new(loader, crate::resolve::FixedPath::new(&primary), SET)
            .with_sibling_policy(SiblingPolicy::enabled("cpu"));

        lib.load().unwrap();
        assert_eq!(
            lib.handles(),
            vec![NativeHandle::from_raw(0x100), NativeHandle::from_raw(0x200)]
        );
        let report = lib.bind_report().unwrap();
        let from_siblings: Vec<_> = report.from_siblings(NativeHandle::from_raw(0x100)).collect();
        assert_eq!(from_siblings.len(), 1);
        assert_eq!(from_siblings[0].name, "ggml_backend_load_all");
        assert_eq!(LOAD_ALL.address().map(|a| a.as_raw()), Some(0x2000));

        lib.unload().unwrap();
        assert_eq!(lib.loader().open_count(), 0);
    }

    #[test]
    fn test_scratch_dir_removed_on_unload() {
        static SET: &[BindSpec] = &[];

        struct WithScratch(PathBuf);

        impl ArtifactResolver for WithScratch {
            fn resolve(&self) -> Result<ResolvedArtifact> {
                Ok(ResolvedArtifact {
                    path: PathBuf::from("/fake/libllama"),
                    scratch_dir: Some(self.0.clone()),
                })
            }
        }

        let root = tempfile::tempdir().unwrap();
        let scratch = root.path().join("scratch");
        std::fs::create_dir(&scratch).unwrap();

        let lib = Library::new(llama_module(FakeLoader::new()), WithScratch(scratch.clone()), SET)
            .with_sibling_policy(SiblingPolicy::disabled());
        lib.load().unwrap();
        assert!(scratch.exists());
        lib.unload().unwrap();
        assert!(!scratch.exists());
    }

    #[test]
    fn test_drop_unloads() {
        static INIT: FunctionSlot<unsafe extern "C" fn()> = FunctionSlot::new("llama_backend_init");
        static SET: &[BindSpec] = &[BindSpec::required(&INIT)];

        {
            let lib = Library::new(llama_module(FakeLoader::new()), At("/fake/libllama"), SET)
                .with_sibling_policy(SiblingPolicy::disabled());
            lib.load().unwrap();
            assert!(INIT.is_bound());
        }
        assert!(!INIT.is_bound());
    }
}
