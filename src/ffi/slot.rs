//! Function Registration
//!
//! A [`FunctionSlot`] is static, typed storage for one native entry point.
//! The function-pointer type is fixed at compile time, so a slot can only
//! ever be read back as the signature it was declared with.
//!
//! ```ignore
//! static BACKEND_INIT: FunctionSlot<unsafe extern "C" fn()> =
//!     FunctionSlot::new("llama_backend_init");
//!
//! static BINDINGS: &[BindSpec] = &[BindSpec::required(&BACKEND_INIT)];
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use super::loader::DynamicLoader;
use super::registry::SymbolRegistry;
use super::types::{NativeHandle, Platform, SymbolAddress, SymbolBinding};
use crate::error::{Error, Result};

/// Function-pointer types a slot can hold.
///
/// # Safety
///
/// Implementors must be pointer-sized function pointers. Only the
/// `unsafe extern "C" fn` family implements it, so calling a bound slot
/// always requires an `unsafe` block at the call site.
pub unsafe trait NativeFn: Copy + Send + Sync + 'static {
    /// Reinterpret a symbol address as this function type.
    ///
    /// # Safety
    ///
    /// `address` must point at a function with exactly this signature.
    unsafe fn from_address(address: SymbolAddress) -> Self;

    /// The raw code address.
    fn address(self) -> usize;
}

macro_rules! impl_native_fn {
    ($($arg:ident),*) => {
        unsafe impl<R: 'static, $($arg: 'static),*> NativeFn
            for unsafe extern "C" fn($($arg),*) -> R
        {
            unsafe fn from_address(address: SymbolAddress) -> Self {
                std::mem::transmute_copy::<usize, Self>(&address.as_raw())
            }

            fn address(self) -> usize {
                self as usize
            }
        }
    };
}

impl_native_fn!();
impl_native_fn!(A);
impl_native_fn!(A, B);
impl_native_fn!(A, B, C);
impl_native_fn!(A, B, C, D);
impl_native_fn!(A, B, C, D, E);
impl_native_fn!(A, B, C, D, E, F);
impl_native_fn!(A, B, C, D, E, F, G);
impl_native_fn!(A, B, C, D, E, F, G, H);

/// Type-erased view of a slot, used by batch binding and reset.
pub trait Bindable: Sync {
    /// Exported symbol name this slot binds.
    fn symbol(&self) -> &'static str;

    /// Store a resolved address.
    fn bind(&self, address: SymbolAddress);

    /// Return to the unset state.
    fn reset(&self);

    fn is_bound(&self) -> bool;
}

/// Typed storage for one native entry point. Unset until bound.
pub struct FunctionSlot<F> {
    symbol: &'static str,
    address: AtomicUsize,
    _marker: PhantomData<F>,
}

impl<F> FunctionSlot<F> {
    pub const fn new(symbol: &'static str) -> Self {
        Self {
            symbol,
            address: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    pub fn symbol(&self) -> &'static str {
        self.symbol
    }

    /// The bound address, if any.
    pub fn address(&self) -> Option<SymbolAddress> {
        SymbolAddress::new(self.address.load(Ordering::Acquire))
    }

    pub fn is_bound(&self) -> bool {
        self.address.load(Ordering::Acquire) != 0
    }
}

impl<F: NativeFn> FunctionSlot<F> {
    /// The bound function, or `None` when this build does not export it.
    pub fn get(&self) -> Option<F> {
        // Safety: addresses only enter the slot through binding, which
        // resolved `self.symbol`; the slot type is that symbol's signature.
        self.address().map(|address| unsafe { F::from_address(address) })
    }

    /// The bound function, or [`Error::NotAvailable`].
    pub fn require(&self) -> Result<F> {
        self.get().ok_or(Error::NotAvailable(self.symbol))
    }
}

impl<F: Sync> Bindable for FunctionSlot<F> {
    fn symbol(&self) -> &'static str {
        self.symbol
    }

    fn bind(&self, address: SymbolAddress) {
        self.address.store(address.as_raw(), Ordering::Release);
    }

    fn reset(&self) {
        self.address.store(0, Ordering::Release);
    }

    fn is_bound(&self) -> bool {
        FunctionSlot::is_bound(self)
    }
}

impl<F> fmt::Debug for FunctionSlot<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionSlot")
            .field("symbol", &self.symbol)
            .field("bound", &self.is_bound())
            .finish()
    }
}

/// One entry of a binding set.
#[derive(Clone, Copy)]
pub struct BindSpec {
    pub slot: &'static dyn Bindable,
    /// A missing required symbol aborts the load.
    pub required: bool,
    /// When set, the entry is skipped on every other platform.
    pub platform: Option<Platform>,
}

impl BindSpec {
    pub const fn required(slot: &'static dyn Bindable) -> Self {
        Self {
            slot,
            required: true,
            platform: None,
        }
    }

    pub const fn optional(slot: &'static dyn Bindable) -> Self {
        Self {
            slot,
            required: false,
            platform: None,
        }
    }

    /// Restrict this entry to one platform.
    pub const fn only_on(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn applies_to(&self, platform: Platform) -> bool {
        self.platform.map_or(true, |p| p == platform)
    }
}

impl fmt::Debug for BindSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindSpec")
            .field("symbol", &self.slot.symbol())
            .field("required", &self.required)
            .field("platform", &self.platform)
            .finish()
    }
}

/// Outcome of a binding pass.
#[derive(Debug, Clone, Default)]
pub struct BindReport {
    pub bound: Vec<SymbolBinding>,
    /// Optional symbols this build does not export
    pub missing_optional: Vec<&'static str>,
    /// Entries restricted to another platform
    pub skipped: Vec<&'static str>,
}

impl BindReport {
    /// Bindings that came from a module other than `primary`.
    pub fn from_siblings(&self, primary: NativeHandle) -> impl Iterator<Item = &SymbolBinding> {
        self.bound.iter().filter(move |b| b.owner != primary)
    }
}

/// Resolve and bind; a missing symbol is an error.
pub fn bind_required<L: DynamicLoader + ?Sized>(
    loader: &L,
    registry: &SymbolRegistry,
    handle: NativeHandle,
    slot: &dyn Bindable,
) -> Result<SymbolBinding> {
    let binding = registry.resolve(loader, slot.symbol(), handle)?;
    slot.bind(binding.address);
    Ok(binding)
}

/// Resolve and bind; a missing symbol leaves the slot unset.
pub fn bind_optional<L: DynamicLoader + ?Sized>(
    loader: &L,
    registry: &SymbolRegistry,
    handle: NativeHandle,
    slot: &dyn Bindable,
) -> Option<SymbolBinding> {
    match registry.resolve(loader, slot.symbol(), handle) {
        Ok(binding) => {
            slot.bind(binding.address);
            Some(binding)
        }
        Err(_) => {
            slot.reset();
            debug!(symbol = slot.symbol(), "optional symbol not exported by this build");
            None
        }
    }
}

/// Bind a whole set for the current platform.
pub fn bind_set<L: DynamicLoader + ?Sized>(
    loader: &L,
    registry: &SymbolRegistry,
    handle: NativeHandle,
    specs: &[BindSpec],
) -> Result<BindReport> {
    bind_set_for(loader, registry, handle, specs, Platform::current())
}

/// Bind a whole set as if running on `platform`.
///
/// Entries are independent: a required failure stops the pass, but slots
/// bound before it stay bound.
pub fn bind_set_for<L: DynamicLoader + ?Sized>(
    loader: &L,
    registry: &SymbolRegistry,
    handle: NativeHandle,
    specs: &[BindSpec],
    platform: Platform,
) -> Result<BindReport> {
    let mut report = BindReport::default();

    for spec in specs {
        if !spec.applies_to(platform) {
            report.skipped.push(spec.slot.symbol());
            continue;
        }

        if spec.required {
            report
                .bound
                .push(bind_required(loader, registry, handle, spec.slot)?);
        } else {
            match bind_optional(loader, registry, handle, spec.slot) {
                Some(binding) => report.bound.push(binding),
                None => report.missing_optional.push(spec.slot.symbol()),
            }
        }
    }

    Ok(report)
}

/// Return every slot in `specs` to the unset state.
pub fn reset_all(specs: &[BindSpec]) {
    for spec in specs {
        spec.slot.reset();
    }
}
