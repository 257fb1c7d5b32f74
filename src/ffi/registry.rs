//! Symbol Registry
//!
//! Tracks every module handle opened during one load session and resolves
//! symbol names across them. A symbol expected from the primary module may
//! live in a sibling, so lookup falls back through the other handles in
//! registration order.

use tracing::trace;

use super::loader::DynamicLoader;
use super::types::{NativeHandle, SymbolBinding};
use crate::error::{Error, Result};

/// Ordered, deduplicated set of open handles.
#[derive(Debug, Default, Clone)]
pub struct SymbolRegistry {
    handles: Vec<NativeHandle>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an opened handle. Returns `false` for NULL or an already
    /// registered handle.
    pub fn register(&mut self, handle: NativeHandle) -> bool {
        if handle.is_null() || self.handles.contains(&handle) {
            return false;
        }
        self.handles.push(handle);
        true
    }

    /// Resolve `name`, trying `preferred` first and then every other
    /// registered handle in registration order.
    pub fn resolve<L: DynamicLoader + ?Sized>(
        &self,
        loader: &L,
        name: &str,
        preferred: NativeHandle,
    ) -> Result<SymbolBinding> {
        let mut searched = 0;

        if !preferred.is_null() {
            searched += 1;
            if let Ok(address) = loader.resolve(preferred, name) {
                return Ok(SymbolBinding {
                    name: name.to_string(),
                    address,
                    owner: preferred,
                });
            }
        }

        for &handle in self.handles.iter().filter(|&&h| h != preferred) {
            searched += 1;
            if let Ok(address) = loader.resolve(handle, name) {
                trace!(symbol = name, owner = %handle, "resolved symbol from sibling module");
                return Ok(SymbolBinding {
                    name: name.to_string(),
                    address,
                    owner: handle,
                });
            }
        }

        Err(Error::SymbolNotFound {
            name: name.to_string(),
            searched,
        })
    }

    /// Drop all handles. Called on unload so a later session starts clean.
    pub fn clear(&mut self) {
        self.handles.clear();
    }

    pub fn handles(&self) -> &[NativeHandle] {
        &self.handles
    }

    pub fn contains(&self, handle: NativeHandle) -> bool {
        self.handles.contains(&handle)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
