//! llamalink - Runtime Binding Layer for llama.cpp
//!
//! Loads a prebuilt llama.cpp shared library at runtime, binds its C entry
//! points into typed function slots and exposes safe wrappers over them.
//! Nothing is linked at build time, so one binary can pick up a CPU-only
//! build on one machine and a CUDA build on another.
//!
//! # Features
//!
//! - **Artifact resolution**: explicit path, cache directory or the platform
//!   search paths, configured through llamalink.toml or `LLAMALINK_*`
//! - **Sibling modules**: split builds (`ggml-base`, `ggml`, backend
//!   modules) are preloaded next to the primary and searched for symbols
//! - **Typed slots**: each entry point has a compile-time signature; optional
//!   entry points missing from a build report "not available"
//! - **Struct-by-value calls**: a libffi call plan where typed pointers are
//!   not reliable for a signature
//! - **Safe lifecycle**: idempotent, race-free load and best-effort unload
//!
//! # Example
//!
//! ```no_run
//! use llamalink::llama;
//!
//! fn main() -> llamalink::Result<()> {
//!     llama::backend_init()?;
//!     let params = llama::model_default_params()?;
//!     println!("gpu layers: {}, mmap: {}", params.n_gpu_layers, params.use_mmap);
//!     println!("{}", llama::print_system_info()?);
//!     llama::backend_free()?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  llama wrappers │  ensure_loaded(), then call the slot
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │    Library      │  resolve ─► open ─► siblings ─► bind
//! └────────┬────────┘
//!          │
//!     ┌────┴─────┐
//!     ▼          ▼
//! ┌────────┐  ┌──────────┐
//! │ Loader │  │ Registry │  primary first, then siblings
//! └────────┘  └──────────┘
//! ```

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod ffi;
pub mod library;
pub mod llama;
pub mod resolve;

pub use config::{ConfigError, LibraryConfig, LoaderConfig, SiblingsConfig};
pub use error::{CloseFailure, Error, LoadError, LoadFailureKind, Result};
pub use ffi::{
    BindReport, BindSpec, CallPlan, DynamicLoader, FieldTag, FunctionSlot, NativeHandle,
    NativeValue, PlanCache, Platform, SiblingManifest, SiblingPolicy, Signature, StructLayout,
    SymbolAddress, SystemLoader, TypedCall, ValueKind,
};
pub use library::{Library, LoadState};
pub use resolve::{ArtifactResolver, FixedPath, ResolvedArtifact, SearchPathResolver};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_not_available_message() {
        let err = Error::NotAvailable("ggml_backend_cuda_init");
        assert!(err.is_not_available());
        assert!(err.to_string().contains("not available in this build"));
    }

    #[test]
    fn test_unloaded_is_not_not_available() {
        let err = Error::Unloaded("llama_time_us");
        assert!(!err.is_not_available());
        assert!(err.to_string().contains("unloaded before `llama_time_us`"));
    }

    #[test]
    fn test_load_error_message_has_path_and_detail() {
        let err: Error = LoadError::new(
            LoadFailureKind::DependencyMissing,
            "/opt/llama/libllama.so",
            "libggml.so: cannot open shared object file",
        )
        .into();
        let msg = err.to_string();
        assert!(msg.contains("/opt/llama/libllama.so"));
        assert!(msg.contains("dependency missing"));
        assert!(msg.contains("libggml.so"));
        assert_eq!(err.load_failure(), Some(LoadFailureKind::DependencyMissing));
    }

    #[test]
    fn test_close_failed_message() {
        let err = Error::CloseFailed {
            failures: vec![
                CloseFailure {
                    handle: NativeHandle::from_raw(0x10),
                    detail: "busy".to_string(),
                },
                CloseFailure {
                    handle: NativeHandle::from_raw(0x20),
                    detail: "gone".to_string(),
                },
            ],
        };
        assert_eq!(err.to_string(), "failed to close 2 native module(s): 0x10: busy; 0x20: gone");
    }
}
