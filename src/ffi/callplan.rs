//! Call-Interface Builder
//!
//! Calls whose arguments or return value are structs passed by value go
//! through a libffi call interface described at runtime instead of a typed
//! function pointer. A [`CallPlan`] is prepared once per signature shape and
//! shared; a [`TypedCall`] pairs a plan with one function address and the
//! Rust types that mirror its signature, so mismatched shapes are rejected
//! when the pair is built rather than when the call is made.
//!
//! ```ignore
//! #[repr(C)]
//! #[derive(Clone, Copy)]
//! struct Triple { a: i32, b: f32, c: u8 }
//!
//! unsafe impl NativeValue for Triple {
//!     fn kind() -> ValueKind {
//!         ValueKind::Struct(StructLayout::describe(&[FieldTag::I32, FieldTag::F32, FieldTag::U8]))
//!     }
//! }
//!
//! let plan = cache.get_or_prepare(Signature::of::<(Triple,), Triple>())?;
//! let call = TypedCall::<(Triple,), Triple>::new(plan, address)?;
//! let out = unsafe { call.invoke((input,)) };
//! ```

use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use libffi::middle::{Cif, CodePtr, Type};
use parking_lot::RwLock;

use super::types::{FieldTag, SymbolAddress};
use crate::error::{Error, Result};

/// Memory layout of a native struct: fields in declaration order.
///
/// Offsets follow natural C alignment. Callers that list explicit padding
/// fields get them as ordinary members, which yields the same layout as
/// long as they sit where the compiler would have padded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructLayout {
    fields: Vec<FieldTag>,
    offsets: Vec<usize>,
    size: usize,
    align: usize,
}

impl StructLayout {
    /// Describe a struct from its field tags.
    pub fn describe(fields: &[FieldTag]) -> Self {
        let mut offsets = Vec::with_capacity(fields.len());
        let mut offset = 0;
        let mut align = 1;

        for field in fields {
            offset = align_up(offset, field.align());
            offsets.push(offset);
            offset += field.size();
            align = align.max(field.align());
        }

        Self {
            fields: fields.to_vec(),
            offsets,
            size: align_up(offset, align),
            align,
        }
    }

    pub fn fields(&self) -> &[FieldTag] {
        &self.fields
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn ffi_type(&self) -> Type {
        Type::structure(self.fields.iter().map(scalar_type).collect::<Vec<_>>())
    }
}

impl fmt::Display for StructLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", field)?;
        }
        write!(f, "}}")
    }
}

fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) / align * align
}

fn scalar_type(tag: &FieldTag) -> Type {
    match tag {
        FieldTag::U8 => Type::u8(),
        FieldTag::U16 => Type::u16(),
        FieldTag::U32 => Type::u32(),
        FieldTag::U64 => Type::u64(),
        FieldTag::I8 => Type::i8(),
        FieldTag::I16 => Type::i16(),
        FieldTag::I32 => Type::i32(),
        FieldTag::I64 => Type::i64(),
        FieldTag::F32 => Type::f32(),
        FieldTag::F64 => Type::f64(),
        FieldTag::Pointer => Type::pointer(),
    }
}

/// Shape of one argument or return value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Only valid as a return kind
    Void,
    Scalar(FieldTag),
    Struct(StructLayout),
}

impl ValueKind {
    pub fn size(&self) -> usize {
        match self {
            ValueKind::Void => 0,
            ValueKind::Scalar(tag) => tag.size(),
            ValueKind::Struct(layout) => layout.size(),
        }
    }

    pub fn align(&self) -> usize {
        match self {
            ValueKind::Void => 1,
            ValueKind::Scalar(tag) => tag.align(),
            ValueKind::Struct(layout) => layout.align(),
        }
    }

    fn ffi_type(&self) -> Type {
        match self {
            ValueKind::Void => Type::void(),
            ValueKind::Scalar(tag) => scalar_type(tag),
            ValueKind::Struct(layout) => layout.ffi_type(),
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Void => write!(f, "void"),
            ValueKind::Scalar(tag) => write!(f, "{}", tag),
            ValueKind::Struct(layout) => write!(f, "{}", layout),
        }
    }
}

/// Argument and return kinds of a native function; the plan cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub args: Vec<ValueKind>,
    pub ret: ValueKind,
}

impl Signature {
    pub fn new(args: Vec<ValueKind>, ret: ValueKind) -> Self {
        Self { args, ret }
    }

    /// Signature described by Rust types.
    pub fn of<A: ArgList, R: NativeValue>() -> Self {
        Self {
            args: A::kinds(),
            ret: R::kind(),
        }
    }

    /// Reject shapes libffi cannot prepare, before handing them over.
    fn validate(&self) -> Result<()> {
        for (i, arg) in self.args.iter().enumerate() {
            match arg {
                ValueKind::Void => {
                    return Err(Error::UnsupportedSignature(format!(
                        "{}: argument {} is void",
                        self, i
                    )))
                }
                ValueKind::Struct(layout) if layout.is_empty() => {
                    return Err(Error::UnsupportedSignature(format!(
                        "{}: argument {} is an empty struct",
                        self, i
                    )))
                }
                _ => {}
            }
        }

        if let ValueKind::Struct(layout) = &self.ret {
            if layout.is_empty() {
                return Err(Error::UnsupportedSignature(format!(
                    "{}: return value is an empty struct",
                    self
                )));
            }
        }

        Ok(())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn(")?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

struct PreparedCif(Cif);

// Safety: the CIF and the type descriptors it owns are never mutated after
// preparation; ffi_call only reads them.
unsafe impl Send for PreparedCif {}
unsafe impl Sync for PreparedCif {}

/// A prepared calling-convention plan for one signature.
pub struct CallPlan {
    signature: Signature,
    cif: PreparedCif,
}

impl CallPlan {
    /// Prepare a plan from argument and return descriptors.
    pub fn prepare(args: Vec<ValueKind>, ret: ValueKind) -> Result<Self> {
        Self::for_signature(Signature::new(args, ret))
    }

    pub fn for_signature(signature: Signature) -> Result<Self> {
        signature.validate()?;

        let arg_types: Vec<Type> = signature.args.iter().map(ValueKind::ffi_type).collect();
        let cif = Cif::new(arg_types, signature.ret.ffi_type());

        Ok(Self {
            signature,
            cif: PreparedCif(cif),
        })
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Call `address` with arguments given as raw memory blocks.
    ///
    /// Each block must be exactly as long as its descriptor, and `ret`
    /// exactly as long as the return descriptor; anything else is an
    /// [`Error::UnsupportedSignature`] and no call is made.
    ///
    /// # Safety
    ///
    /// `address` must be a function with this plan's signature, and the
    /// blocks must hold valid values for it (pointers included).
    pub unsafe fn invoke_raw(
        &self,
        address: SymbolAddress,
        args: &[&[u8]],
        ret: &mut [u8],
    ) -> Result<()> {
        if args.len() != self.signature.args.len() {
            return Err(Error::UnsupportedSignature(format!(
                "{}: expected {} argument(s), got {}",
                self.signature,
                self.signature.args.len(),
                args.len()
            )));
        }
        for (i, (block, kind)) in args.iter().zip(&self.signature.args).enumerate() {
            if block.len() != kind.size() {
                return Err(Error::UnsupportedSignature(format!(
                    "{}: argument {} is {} byte(s), expected {}",
                    self.signature,
                    i,
                    block.len(),
                    kind.size()
                )));
            }
        }
        if ret.len() != self.signature.ret.size() {
            return Err(Error::UnsupportedSignature(format!(
                "{}: return buffer is {} byte(s), expected {}",
                self.signature,
                ret.len(),
                self.signature.ret.size()
            )));
        }

        // Copy each block into 8-byte aligned storage.
        let mut storage: Vec<Vec<u64>> = args
            .iter()
            .map(|block| {
                let mut words = vec![0u64; block.len().div_ceil(8).max(1)];
                std::ptr::copy_nonoverlapping(
                    block.as_ptr(),
                    words.as_mut_ptr() as *mut u8,
                    block.len(),
                );
                words
            })
            .collect();
        let mut arg_ptrs: Vec<*mut c_void> = storage
            .iter_mut()
            .map(|words| words.as_mut_ptr() as *mut c_void)
            .collect();

        let scratch = self.call(address, &mut arg_ptrs);
        let offset = return_offset(&self.signature.ret);
        std::ptr::copy_nonoverlapping(
            (scratch.as_ptr() as *const u8).add(offset),
            ret.as_mut_ptr(),
            ret.len(),
        );
        Ok(())
    }

    /// Run the call and return the raw return storage.
    unsafe fn call(&self, address: SymbolAddress, arg_ptrs: &mut [*mut c_void]) -> Vec<u64> {
        // libffi writes at least a full ffi_arg for small integral returns.
        let words = self.signature.ret.size().max(16).div_ceil(8);
        let mut scratch = vec![0u64; words];
        let code = CodePtr::from_ptr(address.as_ptr());

        libffi::raw::ffi_call(
            self.cif.0.as_raw_ptr(),
            Some(*code.as_fun()),
            scratch.as_mut_ptr() as *mut c_void,
            arg_ptrs.as_mut_ptr(),
        );
        scratch
    }
}

impl fmt::Debug for CallPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPlan")
            .field("signature", &self.signature.to_string())
            .finish()
    }
}

/// Where the value sits inside libffi's return storage. Integral values
/// narrower than `ffi_arg` are widened, which matters on big-endian targets.
fn return_offset(ret: &ValueKind) -> usize {
    let widened = std::mem::size_of::<libffi::raw::ffi_arg>();
    match ret {
        ValueKind::Scalar(tag)
            if cfg!(target_endian = "big") && !tag.is_float() && tag.size() < widened =>
        {
            widened - tag.size()
        }
        _ => 0,
    }
}

/// Plans keyed by signature shape.
#[derive(Default)]
pub struct PlanCache {
    plans: RwLock<HashMap<Signature, Arc<CallPlan>>>,
}

impl PlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached plan for `signature`, preparing it on first use.
    pub fn get_or_prepare(&self, signature: Signature) -> Result<Arc<CallPlan>> {
        if let Some(plan) = self.plans.read().get(&signature) {
            return Ok(Arc::clone(plan));
        }

        let mut plans = self.plans.write();
        if let Some(plan) = plans.get(&signature) {
            return Ok(Arc::clone(plan));
        }
        let plan = Arc::new(CallPlan::for_signature(signature.clone())?);
        plans.insert(signature, Arc::clone(&plan));
        Ok(plan)
    }

    pub fn len(&self) -> usize {
        self.plans.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.read().is_empty()
    }
}

/// A Rust type with a known native shape.
///
/// # Safety
///
/// `kind()` must describe the type's actual C layout; for structs that
/// means `#[repr(C)]` with fields matching the tags in order.
pub unsafe trait NativeValue: Copy {
    fn kind() -> ValueKind;

    /// `kind()`, checked against the Rust type's size and alignment.
    fn checked_kind() -> Result<ValueKind> {
        let kind = Self::kind();
        let (size, align) = match kind {
            ValueKind::Void => (0, 1),
            _ => (std::mem::size_of::<Self>(), std::mem::align_of::<Self>()),
        };
        if kind.size() != size || kind.align() != align {
            return Err(Error::UnsupportedSignature(format!(
                "{} is described as {} ({} bytes, align {}) but is {} bytes, align {}",
                std::any::type_name::<Self>(),
                kind,
                kind.size(),
                kind.align(),
                size,
                align
            )));
        }
        Ok(kind)
    }
}

macro_rules! impl_native_scalar {
    ($($ty:ty => $tag:ident),* $(,)?) => {
        $(
            unsafe impl NativeValue for $ty {
                fn kind() -> ValueKind {
                    ValueKind::Scalar(FieldTag::$tag)
                }
            }
        )*
    };
}

impl_native_scalar!(
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    f32 => F32, f64 => F64,
    usize => Pointer, isize => Pointer,
);

unsafe impl NativeValue for () {
    fn kind() -> ValueKind {
        ValueKind::Void
    }
}

unsafe impl<T> NativeValue for *const T {
    fn kind() -> ValueKind {
        ValueKind::Scalar(FieldTag::Pointer)
    }
}

unsafe impl<T> NativeValue for *mut T {
    fn kind() -> ValueKind {
        ValueKind::Scalar(FieldTag::Pointer)
    }
}

/// Argument tuples for [`TypedCall`].
pub trait ArgList {
    fn kinds() -> Vec<ValueKind>;

    fn checked_kinds() -> Result<Vec<ValueKind>>;

    /// Pointers to each argument, in order.
    fn pointers(&self) -> Vec<*mut c_void>;
}

macro_rules! impl_arg_list {
    ($($name:ident : $idx:tt),*) => {
        impl<$($name: NativeValue),*> ArgList for ($($name,)*) {
            fn kinds() -> Vec<ValueKind> {
                vec![$($name::kind()),*]
            }

            fn checked_kinds() -> Result<Vec<ValueKind>> {
                Ok(vec![$($name::checked_kind()?),*])
            }

            fn pointers(&self) -> Vec<*mut c_void> {
                vec![$(&self.$idx as *const $name as *mut c_void),*]
            }
        }
    };
}

impl_arg_list!();
impl_arg_list!(A: 0);
impl_arg_list!(A: 0, B: 1);
impl_arg_list!(A: 0, B: 1, C: 2);
impl_arg_list!(A: 0, B: 1, C: 2, D: 3);
impl_arg_list!(A: 0, B: 1, C: 2, D: 3, E: 4);
impl_arg_list!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);

/// A call plan paired with one function address and its Rust signature.
pub struct TypedCall<A, R> {
    plan: Arc<CallPlan>,
    address: SymbolAddress,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A: ArgList, R: NativeValue> TypedCall<A, R> {
    /// Pair `plan` with `address`. Fails unless the plan was prepared for
    /// exactly the shape `A -> R` describes.
    pub fn new(plan: Arc<CallPlan>, address: SymbolAddress) -> Result<Self> {
        let expected = Signature::new(A::checked_kinds()?, R::checked_kind()?);
        if plan.signature() != &expected {
            return Err(Error::UnsupportedSignature(format!(
                "plan prepared for {} cannot call {}",
                plan.signature(),
                expected
            )));
        }
        Ok(Self {
            plan,
            address,
            _marker: PhantomData,
        })
    }

    pub fn address(&self) -> SymbolAddress {
        self.address
    }

    pub fn plan(&self) -> &Arc<CallPlan> {
        &self.plan
    }

    /// Call the function.
    ///
    /// # Safety
    ///
    /// The function at `address` must have the signature `A -> R`, and
    /// `args` must be valid for it.
    pub unsafe fn invoke(&self, args: A) -> R {
        let mut arg_ptrs = args.pointers();
        let scratch = self.plan.call(self.address, &mut arg_ptrs);
        let offset = return_offset(&self.plan.signature().ret);
        std::ptr::read_unaligned((scratch.as_ptr() as *const u8).add(offset) as *const R)
    }
}

impl<A, R> Clone for TypedCall<A, R> {
    fn clone(&self) -> Self {
        Self {
            plan: Arc::clone(&self.plan),
            address: self.address,
            _marker: PhantomData,
        }
    }
}
