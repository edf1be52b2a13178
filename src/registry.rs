//! Device-wide registry of bound memory objects.
//!
//! Every allocation backing a currently-bound external memory object must be
//! resident for any submission on the device, because shaders may reach it
//! through bindless indices the driver cannot see at record time. The
//! registry is one shared object with interior locking, injected into the
//! queue rather than reached through globals.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::bo::{AccessFlags, Bo};
use crate::push::PushStream;

/// Registry of allocations that must be resident for every submission.
pub struct MemoryRegistry {
    objects: Mutex<Vec<Arc<Bo>>>,
}

impl MemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(Vec::new()),
        }
    }

    /// Register an allocation. Called when external memory is bound.
    pub fn bind(&self, bo: Arc<Bo>) {
        let mut objects = self.objects.lock();
        debug_assert!(
            !objects.iter().any(|b| b.handle() == bo.handle()),
            "memory object {} bound twice",
            bo.handle()
        );
        objects.push(bo);
    }

    /// Drop an allocation from the registry. Called when the external memory
    /// object is destroyed.
    pub fn unbind(&self, handle: u32) {
        let mut objects = self.objects.lock();
        if let Some(pos) = objects.iter().position(|b| b.handle() == handle) {
            objects.swap_remove(pos);
        } else {
            log::warn!("unbind of unknown memory object {handle}");
        }
    }

    /// Add every registered allocation to a stream's reference set,
    /// read-write: the driver cannot know which ranges a shader touches.
    pub fn add_refs(&self, push: &mut PushStream) {
        let objects = self.objects.lock();
        for bo in objects.iter() {
            push.reference(bo, AccessFlags::RDWR);
        }
    }

    /// Number of registered allocations.
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegistry")
            .field("objects", &self.len())
            .finish()
    }
}

static_assertions::assert_impl_all!(MemoryRegistry: Send, Sync);
