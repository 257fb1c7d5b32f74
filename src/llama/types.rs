//! Mirrors of native llama structs.

use std::ffi::c_void;
use std::fmt;

use crate::ffi::{FieldTag, NativeValue, StructLayout, ValueKind};

/// How a model is split across several devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SplitMode {
    /// Single device
    None = 0,
    /// Split layers and KV cache across devices
    Layer = 1,
    /// Split rows across devices
    Row = 2,
}

impl SplitMode {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(SplitMode::None),
            1 => Some(SplitMode::Layer),
            2 => Some(SplitMode::Row),
            _ => None,
        }
    }
}

impl fmt::Display for SplitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitMode::None => write!(f, "none"),
            SplitMode::Layer => write!(f, "layer"),
            SplitMode::Row => write!(f, "row"),
        }
    }
}

/// `struct llama_model_params`, returned by value from
/// `llama_model_default_params`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ModelParams {
    /// NULL-terminated device list; NULL means all available devices
    pub devices: *mut c_void,
    /// NULL-terminated buffer-type overrides
    pub tensor_buft_overrides: *const c_void,
    /// Layers to offload to VRAM
    pub n_gpu_layers: i32,
    /// Raw `llama_split_mode`
    pub split_mode: i32,
    /// Device used for the whole model when `split_mode` is none
    pub main_gpu: i32,
    /// Per-device proportion of the model
    pub tensor_split: *const f32,
    pub progress_callback: *mut c_void,
    pub progress_callback_user_data: *mut c_void,
    /// Metadata overrides
    pub kv_overrides: *const c_void,
    pub vocab_only: bool,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub check_tensors: bool,
    pub use_extra_bufts: bool,
}

impl ModelParams {
    /// Native field order, as passed to the call-interface builder.
    pub const FIELDS: [FieldTag; 14] = [
        FieldTag::Pointer,
        FieldTag::Pointer,
        FieldTag::I32,
        FieldTag::I32,
        FieldTag::I32,
        FieldTag::Pointer,
        FieldTag::Pointer,
        FieldTag::Pointer,
        FieldTag::Pointer,
        FieldTag::U8,
        FieldTag::U8,
        FieldTag::U8,
        FieldTag::U8,
        FieldTag::U8,
    ];

    pub fn split_mode(&self) -> Option<SplitMode> {
        SplitMode::from_raw(self.split_mode)
    }

    pub fn has_progress_callback(&self) -> bool {
        !self.progress_callback.is_null()
    }
}

// Safety: `FIELDS` lists the `#[repr(C)]` fields above in order; C `bool`
// is one byte.
unsafe impl NativeValue for ModelParams {
    fn kind() -> ValueKind {
        ValueKind::Struct(StructLayout::describe(&Self::FIELDS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_params_layout() {
        let kind = ModelParams::checked_kind().unwrap();
        assert_eq!(kind.size(), std::mem::size_of::<ModelParams>());

        let layout = match kind {
            ValueKind::Struct(layout) => layout,
            other => panic!("expected struct, got {}", other),
        };
        assert_eq!(layout.offsets()[2], std::mem::offset_of!(ModelParams, n_gpu_layers));
        assert_eq!(layout.offsets()[5], std::mem::offset_of!(ModelParams, tensor_split));
        assert_eq!(layout.offsets()[9], std::mem::offset_of!(ModelParams, vocab_only));
        assert_eq!(layout.offsets()[13], std::mem::offset_of!(ModelParams, use_extra_bufts));
    }

    #[test]
    fn test_split_mode() {
        assert_eq!(SplitMode::from_raw(1), Some(SplitMode::Layer));
        assert_eq!(SplitMode::from_raw(9), None);
        assert_eq!(SplitMode::Row.to_string(), "row");
    }
}
