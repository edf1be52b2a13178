//! Growable suballocator for driver-managed GPU memory.
//!
//! A [`Heap`] hands out ranges of GPU-addressable memory from a pool of
//! backing allocations that grows geometrically: the first two allocations
//! are [`HEAP_MIN_SIZE`], each one after that doubles, capped at
//! [`HEAP_MAX_BO_COUNT`] allocations. Backing allocations are never returned
//! to the device allocator before the heap is dropped; the pool only grows.
//!
//! Internally the free space of all backing allocations forms one virtual
//! address space: a 64-bit value packing `(allocation index + 1) << 48 |
//! offset`. The free list allocates out of that space and the result is
//! translated back to a real GPU address on the way out.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::bo::{AccessFlags, Bo, BoFlags, DrmDevice};
use crate::error::DriverError;
use crate::push::PushStream;

/// Size of the first two backing allocations; the growth increment doubles
/// after that.
pub const HEAP_MIN_SIZE: u64 = 64 * 1024;

/// Hard cap on backing allocations. With the doubling policy this bounds
/// the heap at 4 GiB.
pub const HEAP_MAX_BO_COUNT: usize = 17;

const VMA_OFFSET_BITS: u32 = 48;
const VMA_OFFSET_MASK: u64 = (1 << VMA_OFFSET_BITS) - 1;

fn encode_vma(bo_idx: usize, bo_offset: u64) -> u64 {
    assert!(bo_idx < u16::MAX as usize - 1);
    assert!(bo_offset < (1 << VMA_OFFSET_BITS));
    ((bo_idx as u64 + 1) << VMA_OFFSET_BITS) | bo_offset
}

fn vma_bo_idx(vma: u64) -> usize {
    let idx = vma >> VMA_OFFSET_BITS;
    assert!(idx > 0);
    (idx - 1) as usize
}

fn vma_bo_offset(vma: u64) -> u64 {
    vma & VMA_OFFSET_MASK
}

/// A first-fit, coalescing free-range list over a 64-bit address space.
struct FreeList {
    /// Free ranges as `(start, size)`, sorted by start, never adjacent.
    ranges: Vec<(u64, u64)>,
}

impl FreeList {
    fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Carve `size` bytes at `align` out of the first range that fits.
    fn alloc(&mut self, size: u64, align: u64) -> Option<u64> {
        let align = align.max(1);
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        assert!(size > 0);

        for i in 0..self.ranges.len() {
            let (start, range_size) = self.ranges[i];
            let aligned = (start + align - 1) & !(align - 1);
            let pad = aligned - start;
            if pad + size > range_size {
                continue;
            }

            let tail = range_size - pad - size;
            match (pad > 0, tail > 0) {
                (false, false) => {
                    self.ranges.remove(i);
                }
                (false, true) => {
                    self.ranges[i] = (aligned + size, tail);
                }
                (true, false) => {
                    self.ranges[i] = (start, pad);
                }
                (true, true) => {
                    self.ranges[i] = (start, pad);
                    self.ranges.insert(i + 1, (aligned + size, tail));
                }
            }
            return Some(aligned);
        }
        None
    }

    /// Return a range to the list, merging with neighbors.
    fn free(&mut self, start: u64, size: u64) {
        assert!(size > 0);
        let pos = self.ranges.partition_point(|&(s, _)| s < start);

        if pos > 0 {
            let (prev_start, prev_size) = self.ranges[pos - 1];
            assert!(prev_start + prev_size <= start, "double free in heap range list");
        }
        if pos < self.ranges.len() {
            assert!(start + size <= self.ranges[pos].0, "double free in heap range list");
        }

        self.ranges.insert(pos, (start, size));

        // Merge with the following range, then the preceding one.
        if pos + 1 < self.ranges.len() && start + size == self.ranges[pos + 1].0 {
            self.ranges[pos].1 += self.ranges[pos + 1].1;
            self.ranges.remove(pos + 1);
        }
        if pos > 0 && self.ranges[pos - 1].0 + self.ranges[pos - 1].1 == start {
            self.ranges[pos - 1].1 += self.ranges[pos].1;
            self.ranges.remove(pos);
        }
    }
}

struct HeapInner {
    bos: Vec<Arc<Bo>>,
    free: FreeList,
    total_size: u64,
}

/// A range handed out by [`Heap::alloc`].
#[derive(Debug, Clone)]
pub struct HeapAlloc {
    addr: u64,
    size: u64,
    bo: Arc<Bo>,
    bo_offset: u64,
}

impl HeapAlloc {
    /// GPU virtual address of the range.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Size of the range in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Copy `data` into the range at `offset` through the host mapping.
    ///
    /// Panics if the heap's backing allocations are not host-mapped or the
    /// write runs past the range.
    pub fn write(&self, offset: u64, data: &[u8]) {
        assert!(offset + data.len() as u64 <= self.size, "write past end of heap range");
        let map = self.bo.map().expect("heap is not host-mapped");
        map.write_bytes((self.bo_offset + offset) as usize, data);
    }
}

/// The growable suballocator. All public operations take the heap lock and
/// are safe to call from multiple threads.
pub struct Heap {
    dev: Arc<dyn DrmDevice>,
    flags: BoFlags,
    overalloc: u64,
    inner: Mutex<HeapInner>,
}

impl Heap {
    /// Create an empty heap; no backing is allocated until the first
    /// [`alloc`](Self::alloc).
    ///
    /// `flags` selects the placement domain of the backing allocations
    /// (include [`BoFlags::MAP`] for heaps that serve
    /// [`upload`](Self::upload)). `overalloc` bytes of padding are appended
    /// to every backing allocation but never handed out, for engines that
    /// read a fixed distance past the end of their inputs.
    pub fn new(dev: &Arc<dyn DrmDevice>, flags: BoFlags, overalloc: u64) -> Self {
        Self {
            dev: Arc::clone(dev),
            flags,
            overalloc,
            inner: Mutex::new(HeapInner {
                bos: Vec::new(),
                free: FreeList::new(),
                total_size: 0,
            }),
        }
    }

    fn grow_locked(&self, inner: &mut HeapInner) -> Result<(), DriverError> {
        if inner.bos.len() >= HEAP_MAX_BO_COUNT {
            log::warn!("heap hit its maximum size ({} backing allocations)", inner.bos.len());
            return Err(DriverError::OutOfDeviceMemory);
        }

        // First two backing allocations are minimum-size, doubling after.
        let new_bo_size = HEAP_MIN_SIZE << (inner.bos.len().max(1) - 1);

        let bo = self.dev.new_bo(new_bo_size + self.overalloc, 0, self.flags)?;
        let vma = encode_vma(inner.bos.len(), 0);
        inner.free.free(vma, new_bo_size);
        inner.total_size += new_bo_size;
        log::debug!(
            "heap grew to {} backing allocations, {} bytes",
            inner.bos.len() + 1,
            inner.total_size
        );
        inner.bos.push(bo);
        Ok(())
    }

    fn alloc_locked(
        &self,
        inner: &mut HeapInner,
        size: u64,
        align: u64,
    ) -> Result<HeapAlloc, DriverError> {
        assert!(size > 0, "zero-sized heap allocation");
        loop {
            if let Some(vma) = inner.free.alloc(size, align) {
                let bo_idx = vma_bo_idx(vma);
                let bo_offset = vma_bo_offset(vma);

                assert!(bo_idx < inner.bos.len());
                let bo = &inner.bos[bo_idx];
                assert!(bo_offset + size + self.overalloc <= bo.size());

                return Ok(HeapAlloc {
                    addr: bo.addr() + bo_offset,
                    size,
                    bo: Arc::clone(bo),
                    bo_offset,
                });
            }

            self.grow_locked(inner)?;
        }
    }

    /// Allocate `size` bytes at `align`, growing the pool if needed.
    pub fn alloc(&self, size: u64, align: u64) -> Result<HeapAlloc, DriverError> {
        let mut inner = self.inner.lock();
        self.alloc_locked(&mut inner, size, align)
    }

    /// Allocate and fill a range with `data`; returns its GPU address.
    ///
    /// Requires a host-mapped heap. The copy happens under the heap lock so
    /// a concurrent free/realloc of the same range cannot interleave.
    pub fn upload(&self, data: &[u8], align: u64) -> Result<u64, DriverError> {
        let mut inner = self.inner.lock();
        let alloc = self.alloc_locked(&mut inner, data.len() as u64, align)?;
        alloc.write(0, data);
        Ok(alloc.addr)
    }

    /// Return a range to the heap.
    ///
    /// `addr` and `size` must exactly describe a currently live range; the
    /// owning backing allocation is located by address containment.
    pub fn free(&self, addr: u64, size: u64) {
        assert!(addr + size > addr);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        for (bo_idx, bo) in inner.bos.iter().enumerate() {
            if !bo.contains(addr) {
                continue;
            }
            let bo_offset = addr - bo.addr();
            assert!(bo_offset + size <= bo.size());
            let vma = encode_vma(bo_idx, bo_offset);
            inner.free.free(vma, size);
            return;
        }
        panic!("freed address {addr:#x} is not in any heap backing allocation");
    }

    /// Add every backing allocation to a stream's reference set.
    pub fn add_refs(&self, push: &mut PushStream, access: AccessFlags) {
        let inner = self.inner.lock();
        for bo in &inner.bos {
            push.reference(bo, access);
        }
    }

    /// Number of backing allocations currently in the pool.
    pub fn bo_count(&self) -> usize {
        self.inner.lock().bos.len()
    }

    /// Total usable bytes across all backing allocations.
    pub fn total_size(&self) -> u64 {
        self.inner.lock().total_size
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Heap")
            .field("flags", &self.flags)
            .field("bo_count", &inner.bos.len())
            .field("total_size", &inner.total_size)
            .finish()
    }
}

static_assertions::assert_impl_all!(Heap: Send, Sync);
