//! llama.cpp Entry Points
//!
//! A process-wide [`Library`] bound to the llama.cpp C API, plus one typed
//! wrapper per entry point. Every wrapper loads the library on first use.
//!
//! # Example
//!
//! ```ignore
//! use llamalink::llama;
//!
//! llama::backend_init()?;
//! let params = llama::model_default_params()?;
//! match llama::backend_cuda_init(0) {
//!     Ok(backend) => println!("CUDA backend at {:p}", backend),
//!     Err(e) if e.is_not_available() => println!("CPU-only build"),
//!     Err(e) => return Err(e),
//! }
//! ```
//!
//! The library location comes from llamalink.toml and the `LLAMALINK_*`
//! environment variables unless [`configure`] runs first.

pub mod types;

pub use types::{ModelParams, SplitMode};

use std::ffi::{c_char, c_void, CStr};

use once_cell::sync::{Lazy, OnceCell};
use tracing::warn;

use crate::config::LoaderConfig;
use crate::error::{Error, Result};
use crate::ffi::{
    ArgList, BindReport, BindSpec, FunctionSlot, NativeFn, NativeHandle, NativeValue, PlanCache,
    Platform, Signature, SymbolAddress, TypedCall,
};
use crate::library::Library;
use crate::resolve::SearchPathResolver;

static BACKEND_INIT: FunctionSlot<unsafe extern "C" fn()> = FunctionSlot::new("llama_backend_init");
static BACKEND_FREE: FunctionSlot<unsafe extern "C" fn()> = FunctionSlot::new("llama_backend_free");
static TIME_US: FunctionSlot<unsafe extern "C" fn() -> i64> = FunctionSlot::new("llama_time_us");
static MAX_DEVICES: FunctionSlot<unsafe extern "C" fn() -> usize> =
    FunctionSlot::new("llama_max_devices");
static SUPPORTS_MMAP: FunctionSlot<unsafe extern "C" fn() -> bool> =
    FunctionSlot::new("llama_supports_mmap");
static SUPPORTS_MLOCK: FunctionSlot<unsafe extern "C" fn() -> bool> =
    FunctionSlot::new("llama_supports_mlock");
static SUPPORTS_GPU_OFFLOAD: FunctionSlot<unsafe extern "C" fn() -> bool> =
    FunctionSlot::new("llama_supports_gpu_offload");
static SUPPORTS_RPC: FunctionSlot<unsafe extern "C" fn() -> bool> =
    FunctionSlot::new("llama_supports_rpc");
static PRINT_SYSTEM_INFO: FunctionSlot<unsafe extern "C" fn() -> *const c_char> =
    FunctionSlot::new("llama_print_system_info");
static MODEL_DEFAULT_PARAMS: FunctionSlot<unsafe extern "C" fn() -> ModelParams> =
    FunctionSlot::new("llama_model_default_params");

// Exported by ggml, which may be a sibling module.
static BACKEND_LOAD_ALL: FunctionSlot<unsafe extern "C" fn()> =
    FunctionSlot::new("ggml_backend_load_all");
static BACKEND_CUDA_INIT: FunctionSlot<unsafe extern "C" fn(i32) -> *mut c_void> =
    FunctionSlot::new("ggml_backend_cuda_init");

/// Every entry point the wrappers use.
pub static BINDINGS: &[BindSpec] = &[
    BindSpec::required(&BACKEND_INIT),
    BindSpec::required(&BACKEND_FREE),
    BindSpec::required(&TIME_US),
    BindSpec::required(&MAX_DEVICES),
    BindSpec::required(&SUPPORTS_MMAP),
    BindSpec::required(&SUPPORTS_MLOCK),
    BindSpec::optional(&SUPPORTS_GPU_OFFLOAD),
    BindSpec::optional(&SUPPORTS_RPC),
    BindSpec::required(&PRINT_SYSTEM_INFO),
    BindSpec::required(&MODEL_DEFAULT_PARAMS),
    BindSpec::optional(&BACKEND_LOAD_ALL),
    BindSpec::optional(&BACKEND_CUDA_INIT),
];

/// How an entry point is invoked once bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPath {
    /// Through the typed function pointer
    Direct,
    /// Through a prepared libffi call plan
    Planned,
}

/// Per-signature call path for entry points that pass structs by value.
/// Anything not listed is called directly everywhere.
#[derive(Debug, Clone, Copy)]
pub struct CallRoute {
    pub symbol: &'static str,
    pub unix: CallPath,
    pub windows: CallPath,
}

/// Struct returns through typed pointers are unreliable with some Windows
/// toolchains; those go through a call plan there.
pub static CALL_ROUTES: &[CallRoute] = &[CallRoute {
    symbol: "llama_model_default_params",
    unix: CallPath::Direct,
    windows: CallPath::Planned,
}];

/// The call path for `symbol` on `platform`.
pub fn call_path_for(symbol: &str, platform: Platform) -> CallPath {
    CALL_ROUTES
        .iter()
        .find(|route| route.symbol == symbol)
        .map_or(CallPath::Direct, |route| match platform {
            Platform::Unix => route.unix,
            Platform::Windows => route.windows,
        })
}

pub fn call_path(symbol: &str) -> CallPath {
    call_path_for(symbol, Platform::current())
}

static LIBRARY: OnceCell<Library> = OnceCell::new();
static PLANS: Lazy<PlanCache> = Lazy::new(PlanCache::new);

fn build(config: &LoaderConfig) -> Result<Library> {
    let policy = config.sibling_policy()?;
    let resolver = SearchPathResolver::new(config.library.clone());
    Ok(Library::system(resolver, BINDINGS).with_sibling_policy(policy))
}

fn library() -> Result<&'static Library> {
    LIBRARY.get_or_try_init(|| build(&LoaderConfig::from_env()?))
}

/// Use `config` instead of llamalink.toml and the environment.
///
/// Only effective before the library is first touched; returns `false`
/// (and leaves the existing library alone) afterwards.
pub fn configure(config: LoaderConfig) -> Result<bool> {
    let mut created = false;
    LIBRARY.get_or_try_init(|| {
        created = true;
        build(&config)
    })?;
    if !created {
        warn!("llama library already initialized; configuration ignored");
    }
    Ok(created)
}

/// Load and bind the library. A no-op when already loaded.
pub fn load() -> Result<()> {
    library()?.load()
}

/// Close the library and unset every entry point.
pub fn unload() -> Result<()> {
    match LIBRARY.get() {
        Some(library) => library.unload(),
        None => Ok(()),
    }
}

pub fn is_loaded() -> bool {
    LIBRARY.get().map_or(false, Library::is_loaded)
}

/// The primary module handle while loaded.
pub fn handle() -> Option<NativeHandle> {
    LIBRARY.get().and_then(Library::handle)
}

/// What the current session bound, including optional misses.
pub fn bind_report() -> Option<BindReport> {
    LIBRARY.get().and_then(Library::bind_report)
}

fn ensure_loaded() -> Result<()> {
    load()
}

/// Load if needed, then fetch the function bound to `slot`.
///
/// An [`unload`] from another thread can land between the load and the slot
/// read; that reports [`Error::Unloaded`] rather than [`Error::NotAvailable`].
/// Callers that unload while other threads are inside a wrapper call must
/// synchronize that themselves.
fn entry<F: NativeFn>(slot: &FunctionSlot<F>) -> Result<F> {
    ensure_loaded()?;
    checked(slot, is_loaded())
}

/// An unbound slot means "not in this build" only while the library is loaded.
fn checked<F: NativeFn>(slot: &FunctionSlot<F>, loaded: bool) -> Result<F> {
    match slot.get() {
        Some(f) => Ok(f),
        None if loaded => Err(Error::NotAvailable(slot.symbol())),
        None => Err(Error::Unloaded(slot.symbol())),
    }
}

pub fn backend_init() -> Result<()> {
    let f = entry(&BACKEND_INIT)?;
    unsafe { f() };
    Ok(())
}

pub fn backend_free() -> Result<()> {
    let f = entry(&BACKEND_FREE)?;
    unsafe { f() };
    Ok(())
}

/// Microseconds since an unspecified epoch, from llama's clock.
pub fn time_us() -> Result<i64> {
    let f = entry(&TIME_US)?;
    Ok(unsafe { f() })
}

pub fn max_devices() -> Result<usize> {
    let f = entry(&MAX_DEVICES)?;
    Ok(unsafe { f() })
}

pub fn supports_mmap() -> Result<bool> {
    let f = entry(&SUPPORTS_MMAP)?;
    Ok(unsafe { f() })
}

pub fn supports_mlock() -> Result<bool> {
    let f = entry(&SUPPORTS_MLOCK)?;
    Ok(unsafe { f() })
}

/// Not exported by older builds.
pub fn supports_gpu_offload() -> Result<bool> {
    let f = entry(&SUPPORTS_GPU_OFFLOAD)?;
    Ok(unsafe { f() })
}

/// Not exported by older builds.
pub fn supports_rpc() -> Result<bool> {
    let f = entry(&SUPPORTS_RPC)?;
    Ok(unsafe { f() })
}

/// The build's feature summary line.
pub fn print_system_info() -> Result<String> {
    let f = entry(&PRINT_SYSTEM_INFO)?;
    let ptr = unsafe { f() };
    if ptr.is_null() {
        return Ok(String::new());
    }
    // Safety: llama returns a pointer to a static NUL-terminated buffer.
    Ok(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

/// Default model parameters, returned by value.
pub fn model_default_params() -> Result<ModelParams> {
    model_default_params_via(call_path(MODEL_DEFAULT_PARAMS.symbol()))
}

/// [`model_default_params`] through an explicit call path.
pub fn model_default_params_via(path: CallPath) -> Result<ModelParams> {
    let f = entry(&MODEL_DEFAULT_PARAMS)?;
    match path {
        CallPath::Direct => Ok(unsafe { f() }),
        CallPath::Planned => {
            let address = SymbolAddress::of_fn(f);
            let call = planned::<(), ModelParams>(address)?;
            // Safety: the plan was checked against `ModelParams` and the
            // address is `llama_model_default_params`.
            Ok(unsafe { call.invoke(()) })
        }
    }
}

fn planned<A: ArgList, R: NativeValue>(address: SymbolAddress) -> Result<TypedCall<A, R>> {
    let plan = PLANS.get_or_prepare(Signature::of::<A, R>())?;
    TypedCall::new(plan, address)
}

/// Register every ggml backend module found next to ggml. Optional.
pub fn backend_load_all() -> Result<()> {
    let f = entry(&BACKEND_LOAD_ALL)?;
    unsafe { f() };
    Ok(())
}

/// Initialize the CUDA backend on `device`. Only GPU builds export this.
pub fn backend_cuda_init(device: i32) -> Result<*mut c_void> {
    let f = entry(&BACKEND_CUDA_INIT)?;
    Ok(unsafe { f(device) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::Bindable;

    #[test]
    fn test_bindings_are_unique() {
        let mut symbols: Vec<&str> = BINDINGS.iter().map(|b| b.slot.symbol()).collect();
        let total = symbols.len();
        symbols.sort_unstable();
        symbols.dedup();
        assert_eq!(symbols.len(), total);
    }

    #[test]
    fn test_optional_entry_points() {
        let optional: Vec<&str> = BINDINGS
            .iter()
            .filter(|b| !b.required)
            .map(|b| b.slot.symbol())
            .collect();
        assert!(optional.contains(&"ggml_backend_cuda_init"));
        assert!(optional.contains(&"ggml_backend_load_all"));
        assert!(optional.contains(&"llama_supports_rpc"));
        assert!(!optional.contains(&"llama_model_default_params"));
    }

    #[test]
    fn test_call_routes() {
        assert_eq!(
            call_path_for("llama_model_default_params", Platform::Unix),
            CallPath::Direct
        );
        assert_eq!(
            call_path_for("llama_model_default_params", Platform::Windows),
            CallPath::Planned
        );
        assert_eq!(call_path_for("llama_time_us", Platform::Windows), CallPath::Direct);

        // Every routed symbol is bound.
        for route in CALL_ROUTES {
            assert!(BINDINGS.iter().any(|b| b.slot.symbol() == route.symbol));
        }
    }

    #[test]
    fn test_unbound_slot_reason_follows_load_state() {
        static MISSING: FunctionSlot<unsafe extern "C" fn() -> i32> =
            FunctionSlot::new("llama_missing");

        match checked(&MISSING, true) {
            Err(Error::NotAvailable(name)) => assert_eq!(name, "llama_missing"),
            other => panic!("expected NotAvailable, got {:?}", other.map(|_| ())),
        }
        match checked(&MISSING, false) {
            Err(Error::Unloaded(name)) => assert_eq!(name, "llama_missing"),
            other => panic!("expected Unloaded, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_bound_slot_is_returned_either_way() {
        static ANSWER: FunctionSlot<unsafe extern "C" fn() -> i32> = FunctionSlot::new("answer");
        unsafe extern "C" fn answer() -> i32 {
            42
        }

        ANSWER.bind(SymbolAddress::of_fn(answer as unsafe extern "C" fn() -> i32));
        let f = checked(&ANSWER, true).unwrap();
        assert_eq!(unsafe { f() }, 42);
        assert!(checked(&ANSWER, false).is_ok());
        ANSWER.reset();
    }

    #[test]
    fn test_model_params_plan_prepares() {
        let plan = PLANS
            .get_or_prepare(Signature::of::<(), ModelParams>())
            .unwrap();
        assert!(plan.signature().args.is_empty());
        assert_eq!(plan.signature().ret.size(), std::mem::size_of::<ModelParams>());
    }
}
