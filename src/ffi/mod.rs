//! FFI Module
//!
//! Everything that touches the platform loader or raw function addresses.
//!
//! # Architecture
//!
//! ```text
//! primary artifact path
//!       │
//!       ▼
//! DynamicLoader (libloading)  ──►  sibling discovery (manifest + scan)
//!       │
//!       ▼
//! SymbolRegistry (primary first, then siblings)
//!       │
//!       ├──►  FunctionSlot<F>      typed, direct calls
//!       │
//!       └──►  CallPlan / TypedCall  struct-by-value calls via libffi
//! ```

pub mod callplan;
pub mod loader;
pub mod registry;
pub mod siblings;
pub mod slot;
mod types;

pub use callplan::{

    ArgList, CallPlan, NativeValue, PlanCache, Signature, StructLayout, TypedCall, ValueKind,

};
pub use loader::{is_loadable_module, library_filename, DynamicLoader, SystemLoader};
pub use registry::SymbolRegistry;
pub use siblings::{discover_siblings, ManifestError, SiblingManifest, SiblingPolicy};
pub use slot::{
    bind_optional, bind_required, bind_set, bind_set_for, reset_all, BindReport, BindSpec, Bindable,
    FunctionSlot, NativeFn,
};
pub use types::{FieldTag, NativeHandle, Platform, SymbolAddress, SymbolBinding, UnknownFieldTag};

#[cfg(test)]
pub(crate) mod fake;
