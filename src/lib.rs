//! # nvsub
//!
//! Command submission and GPU memory residency core for Fermi+ NVIDIA GPUs.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`PushStream`] - Append-only encoder for 32-bit FIFO command words
//! - [`Heap`] - Growable sub-allocator over kernel backing allocations
//! - [`DescriptorTable`] - Fixed-slot table for hardware descriptors
//! - [`Queue`] - Residency assembly and in-order kernel hand-off
//! - [`DrmDevice`] - Trait at the kernel boundary, mockable for testing
//!
//! ## Example
//!
//! ```ignore
//! use nvsub::{HdrForm, PushStream, SUBC_3D};
//!
//! let mut push = PushStream::new(&dev, 1024)?;
//! push.space(4)?;
//! push.begin(HdrForm::NInc, SUBC_3D, 0x1574);
//! push.emit(pool_addr_hi);
//! push.emit(pool_addr_lo);
//! push.emit(count - 1);
//! queue.submit(&mut [&mut push], &[&done])?;
//! ```

pub mod bo;
pub mod cl;
pub mod descriptor;
pub mod dump;
pub mod error;
pub mod heap;
pub mod push;
pub mod queue;
pub mod registry;
pub mod sync;

// Re-export main types for convenience
pub use bo::{
    AccessFlags, Bo, BoDescriptor, BoFlags, BoMap, DeviceInfo, DrmDevice, PushRange, SubmitRequest,
    GEM_DOMAIN_GART, GEM_DOMAIN_VRAM,
};
pub use descriptor::DescriptorTable;
pub use dump::{dump_push, DebugFlags};
pub use error::DriverError;
pub use heap::{Heap, HeapAlloc};
pub use push::{
    decode_header, encode_header, HdrForm, Header, PushRef, PushStream, Record, MAX_METHOD_COUNT,
    SUBC_2D, SUBC_3D, SUBC_COMPUTE, SUBC_COPY, SUBC_M2MF,
};
pub use queue::Queue;
pub use registry::MemoryRegistry;
pub use sync::{SyncObject, SyncState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the submission core.
///
/// This should be called once before creating queues; it only logs the
/// version, so skipping it is harmless.
pub fn init() {
    log::info!("nvsub v{VERSION} initialized");
}
