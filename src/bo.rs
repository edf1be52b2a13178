//! Backing allocations and the kernel device boundary.
//!
//! A [`Bo`] is an opaque handle to a region of GPU-addressable memory with a
//! stable virtual address. This crate never creates one directly; it asks the
//! [`DrmDevice`] collaborator, which wraps the kernel allocator. Ownership is
//! shared via `Arc<Bo>` and the kernel's own reference counting protects
//! in-flight allocations, so dropping the last `Arc` is always safe here.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::Arc;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use crate::error::DriverError;

bitflags! {
    /// Placement flags for a backing allocation.
    ///
    /// The empty set means device-local memory (VRAM on discrete parts).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BoFlags: u32 {
        /// Host-shared, DMA-accessible memory rather than device-local.
        const GART = 1 << 0;
        /// Request a CPU mapping for the allocation.
        const MAP = 1 << 1;
    }
}

bitflags! {
    /// Access-domain flags attached to a residency-set entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        /// The GPU reads from the allocation.
        const RD = 1 << 0;
        /// The GPU writes to the allocation.
        const WR = 1 << 1;
        /// Read-write access.
        const RDWR = Self::RD.bits() | Self::WR.bits();
    }
}

/// Memory domain bits in the kernel submission interface.
pub const GEM_DOMAIN_VRAM: u32 = 1 << 1;
/// See [`GEM_DOMAIN_VRAM`].
pub const GEM_DOMAIN_GART: u32 = 1 << 2;

/// A host mapping of a backing allocation.
///
/// Mappings come either from the kernel (an `mmap` of the allocation, wrapped
/// with [`BoMap::from_raw`]) or from a software [`DrmDevice`] implementation
/// that backs the allocation with ordinary host memory. Torn or racing
/// accesses to *disjoint* ranges are fine; callers that share a mapping
/// (heap, slot table) serialize overlapping access through their own lock.
pub struct BoMap {
    ptr: NonNull<u8>,
    len: usize,
    // Keeps software-backed mappings alive. The heap allocation behind the
    // box is stable, so `ptr` stays valid when the map (or its Bo) moves.
    _storage: Option<Box<[UnsafeCell<u8>]>>,
}

// SAFETY: BoMap points at memory shared with the GPU; CPU-side exclusion for
// overlapping writes is provided by the owning container's lock, the same
// contract a raw mmap carries.
unsafe impl Send for BoMap {}
unsafe impl Sync for BoMap {}

impl BoMap {
    /// Wrap a mapping obtained from the kernel.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` bytes that stay valid for the lifetime of
    /// the returned map and are not freed through any other path.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        Self {
            ptr: NonNull::new(ptr).expect("null mapping"),
            len,
            _storage: None,
        }
    }

    /// Create a zero-filled host-memory mapping of `len` bytes.
    ///
    /// Used by software device implementations (and the test mock) in place
    /// of a real kernel mapping.
    pub fn new_host(len: usize) -> Self {
        let storage: Box<[UnsafeCell<u8>]> = (0..len).map(|_| UnsafeCell::new(0)).collect();
        let ptr = NonNull::new(storage.as_ptr() as *mut u8).expect("empty mapping");
        Self {
            ptr,
            len,
            _storage: Some(storage),
        }
    }

    /// Length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw base pointer of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Write one 32-bit word at a word index.
    pub fn write_u32(&self, word_idx: usize, value: u32) {
        let offset = word_idx * 4;
        assert!(offset + 4 <= self.len, "write past end of mapping");
        // SAFETY: in bounds per the assert above; exclusion per the type
        // contract. The mapping has no alignment guarantee beyond the page,
        // so write unaligned-tolerant.
        unsafe {
            self.ptr
                .as_ptr()
                .add(offset)
                .cast::<u32>()
                .write_unaligned(value)
        };
    }

    /// Read one 32-bit word at a word index.
    pub fn read_u32(&self, word_idx: usize) -> u32 {
        let offset = word_idx * 4;
        assert!(offset + 4 <= self.len, "read past end of mapping");
        // SAFETY: in bounds per the assert above.
        unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().read_unaligned() }
    }

    /// Copy `data` into the mapping at a byte offset.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len, "write past end of mapping");
        // SAFETY: in bounds per the assert above; `data` cannot overlap the
        // mapping because the mapping is never exposed as a slice.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len())
        };
    }

    /// Copy words into the mapping starting at a word index.
    pub fn write_words(&self, word_idx: usize, words: &[u32]) {
        self.write_bytes(word_idx * 4, bytemuck::cast_slice(words));
    }

    /// Copy bytes out of the mapping at a byte offset.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= self.len, "read past end of mapping");
        // SAFETY: in bounds per the assert above.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), out.len())
        };
    }
}

impl std::fmt::Debug for BoMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoMap")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// A backing allocation: device memory with a stable GPU virtual address.
#[derive(Debug)]
pub struct Bo {
    handle: u32,
    addr: u64,
    size: u64,
    flags: BoFlags,
    map: Option<BoMap>,
}

impl Bo {
    /// Create an unmapped allocation record. For [`DrmDevice`] implementors.
    pub fn new(handle: u32, addr: u64, size: u64, flags: BoFlags) -> Self {
        Self {
            handle,
            addr,
            size,
            flags,
            map: None,
        }
    }

    /// Create an allocation record with a host mapping attached.
    pub fn new_mapped(handle: u32, addr: u64, size: u64, flags: BoFlags, map: BoMap) -> Self {
        assert_eq!(map.len() as u64, size, "mapping length mismatch");
        Self {
            handle,
            addr,
            size,
            flags,
            map: Some(map),
        }
    }

    /// Kernel handle of the allocation.
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// GPU virtual address of the first byte.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Placement flags.
    pub fn flags(&self) -> BoFlags {
        self.flags
    }

    /// The host mapping, if one was requested at creation.
    pub fn map(&self) -> Option<&BoMap> {
        self.map.as_ref()
    }

    /// Whether `addr` falls inside this allocation's GPU address range.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.addr && addr - self.addr < self.size
    }
}

/// One entry in the kernel submission's buffer list.
///
/// Matches the layout the kernel expects, hence the plain-old-data derive.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct BoDescriptor {
    /// Kernel handle of the allocation.
    pub handle: u32,
    /// Domains the allocation may legally be placed in for this submission.
    pub valid_domains: u32,
    /// Domains the GPU reads the allocation from.
    pub read_domains: u32,
    /// Domains the GPU writes the allocation in.
    pub write_domains: u32,
}

/// One executable range of command-stream words.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct PushRange {
    /// Index into [`SubmitRequest::buffers`] of the segment's allocation.
    pub bo_index: u32,
    /// Padding to match the kernel struct layout.
    pub pad: u32,
    /// Byte offset of the first word inside the allocation.
    pub offset: u64,
    /// Byte length of the range.
    pub length: u64,
}

/// Everything the kernel needs to execute one logical stream.
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    /// Stream segments first, then the residency set.
    pub buffers: Vec<BoDescriptor>,
    /// Ranges to execute, in order, indexing into `buffers`.
    pub push_ranges: Vec<PushRange>,
}

/// Engine classes bound to the channel, used to resolve method names and
/// generation-specific behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    /// 3D engine class (e.g. `0x9097`).
    pub cls_eng3d: u16,
    /// Compute engine class (e.g. `0xa0c0`).
    pub cls_compute: u16,
    /// Copy engine class (e.g. `0x90b5`).
    pub cls_copy: u16,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            cls_eng3d: 0x9097,
            cls_compute: 0xa0c0,
            cls_copy: 0x90b5,
        }
    }
}

/// The kernel-side collaborator: allocates backing memory, accepts
/// submissions and answers completion polls.
///
/// Implementations wrap the real DRM file descriptor; tests install a
/// software mock. All methods block until the kernel accepts the work, never
/// until the GPU finishes it.
pub trait DrmDevice: Send + Sync {
    /// Allocate a backing allocation of `size` bytes.
    ///
    /// `align` is a minimum alignment for the GPU virtual address (0 means
    /// no requirement). A mapping is attached when `flags` contains
    /// [`BoFlags::MAP`].
    fn new_bo(&self, size: u64, align: u64, flags: BoFlags) -> Result<Arc<Bo>, DriverError>;

    /// Hand a validated stream plus its residency set to the kernel.
    ///
    /// Returns once the kernel has accepted (not executed) the work. A
    /// device-removal condition must surface as [`DriverError::DeviceLost`]
    /// so it is distinguishable from ordinary rejections.
    fn submit(&self, req: &SubmitRequest) -> Result<(), DriverError>;

    /// Poll whether all GPU work touching `bo` has completed.
    fn bo_idle(&self, bo: &Bo) -> Result<bool, DriverError>;
}
