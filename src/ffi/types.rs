//! FFI Type System
//!
//! Handles, addresses and the primitive tags used to describe native
//! memory layouts.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Opaque identifier of a loaded native module.
///
/// Issued by the loader that opened the module and only meaningful to it.
/// Once closed, the value is never handed out again by that loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NativeHandle(pub(crate) usize);

impl NativeHandle {
    /// The zero handle; never registered, never searched.
    pub const NULL: NativeHandle = NativeHandle(0);

    pub fn from_raw(raw: usize) -> Self {
        NativeHandle(raw)
    }

    pub fn as_raw(self) -> usize {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Address of a resolved native symbol. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolAddress(usize);

impl SymbolAddress {
    /// Wrap a raw address, rejecting null.
    pub fn new(raw: usize) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(SymbolAddress(raw))
        }
    }

    /// Address of a function defined in this process.
    pub fn of_fn<F: crate::ffi::NativeFn>(f: F) -> Self {
        SymbolAddress(f.address())
    }

    pub fn as_raw(self) -> usize {
        self.0
    }

    pub fn as_ptr(self) -> *const std::ffi::c_void {
        self.0 as *const std::ffi::c_void
    }
}

impl fmt::Display for SymbolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A resolved symbol together with the module that exported it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolBinding {
    pub name: String,
    pub address: SymbolAddress,
    pub owner: NativeHandle,
}

/// Platform families with distinct loading rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    /// dlopen/dlsym (Linux, macOS, BSDs)
    Unix,
    /// LoadLibraryExW/GetProcAddress
    Windows,
}

impl Platform {
    pub const fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Unix => write!(f, "unix"),
            Platform::Windows => write!(f, "windows"),
        }
    }
}

/// Primitive field kinds of a native struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldTag {
    /// 8-bit unsigned integer (also C `bool`)
    U8,
    /// 16-bit unsigned integer
    U16,
    /// 32-bit unsigned integer
    U32,
    /// 64-bit unsigned integer
    U64,
    /// 8-bit signed integer
    I8,
    /// 16-bit signed integer
    I16,
    /// 32-bit signed integer (also C enums)
    I32,
    /// 64-bit signed integer
    I64,
    /// 32-bit floating point
    F32,
    /// 64-bit floating point
    F64,
    /// Data or function pointer (platform-dependent width)
    Pointer,
}

impl FieldTag {
    /// Size in bytes of this field.
    pub fn size(&self) -> usize {
        match self {
            FieldTag::U8 | FieldTag::I8 => 1,
            FieldTag::U16 | FieldTag::I16 => 2,
            FieldTag::U32 | FieldTag::I32 | FieldTag::F32 => 4,
            FieldTag::U64 | FieldTag::I64 | FieldTag::F64 => 8,
            FieldTag::Pointer => std::mem::size_of::<usize>(),
        }
    }

    /// Natural C alignment of this field.
    pub fn align(&self) -> usize {
        match self {
            FieldTag::U64 | FieldTag::I64 => std::mem::align_of::<u64>(),
            FieldTag::F64 => std::mem::align_of::<f64>(),
            FieldTag::Pointer => std::mem::align_of::<usize>(),
            other => other.size(),
        }
    }

    pub fn is_integer(&self) -> bool {
        !self.is_float() && !self.is_pointer()
    }

    pub fn is_float(&self) -> bool {
        matches!(self, FieldTag::F32 | FieldTag::F64)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, FieldTag::Pointer)
    }
}

/// A field type name [`FieldTag`] does not know.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown field type: {0}")]
pub struct UnknownFieldTag(pub String);

impl FromStr for FieldTag {
    type Err = UnknownFieldTag;

    /// Parse from a C or Rust spelling.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "u8" | "uint8" | "uint8_t" | "bool" => Ok(FieldTag::U8),
            "u16" | "uint16" | "uint16_t" => Ok(FieldTag::U16),
            "u32" | "uint32" | "uint32_t" => Ok(FieldTag::U32),
            "u64" | "uint64" | "uint64_t" => Ok(FieldTag::U64),
            "i8" | "int8" | "int8_t" => Ok(FieldTag::I8),
            "i16" | "int16" | "int16_t" => Ok(FieldTag::I16),
            "i32" | "int32" | "int32_t" | "int" | "enum" => Ok(FieldTag::I32),
            "i64" | "int64" | "int64_t" => Ok(FieldTag::I64),
            "f32" | "float" => Ok(FieldTag::F32),
            "f64" | "double" => Ok(FieldTag::F64),
            "ptr" | "pointer" | "void*" => Ok(FieldTag::Pointer),
            _ => Err(UnknownFieldTag(s.to_string())),
        }
    }
}

impl fmt::Display for FieldTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldTag::U8 => write!(f, "u8"),
            FieldTag::U16 => write!(f, "u16"),
            FieldTag::U32 => write!(f, "u32"),
            FieldTag::U64 => write!(f, "u64"),
            FieldTag::I8 => write!(f, "i8"),
            FieldTag::I16 => write!(f, "i16"),
            FieldTag::I32 => write!(f, "i32"),
            FieldTag::I64 => write!(f, "i64"),
            FieldTag::F32 => write!(f, "f32"),
            FieldTag::F64 => write!(f, "f64"),
            FieldTag::Pointer => write!(f, "ptr"),
        }
    }
}
