//! Fixed-capacity descriptor slot table.
//!
//! Bindless resource indices point into one device-local, host-mapped
//! backing allocation divided into fixed-size slots. Slots are handed out
//! from a free-index stack first, then a bump cursor over never-used
//! indices. Capacity is fixed at creation: growing the table would require
//! re-pointing the hardware descriptor pool under live work, which this
//! crate does not attempt. Callers that outgrow a table create a larger one
//! and migrate.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::bo::{Bo, BoFlags, DrmDevice};
use crate::error::DriverError;

struct TableInner {
    /// Next never-used slot index.
    next: u32,
    /// Stack of freed indices.
    free: Vec<u32>,
}

/// A fixed-slot descriptor table. Thread-safe behind its own lock.
pub struct DescriptorTable {
    bo: Arc<Bo>,
    desc_size: u32,
    capacity: u32,
    inner: Mutex<TableInner>,
}

impl DescriptorTable {
    /// Allocate a table of `capacity` slots of `desc_size` bytes each.
    ///
    /// The backing allocation is device-local, host-mapped and 256-byte
    /// aligned as the descriptor pool pointers require.
    pub fn new(
        dev: &Arc<dyn DrmDevice>,
        desc_size: u32,
        capacity: u32,
    ) -> Result<Self, DriverError> {
        assert!(desc_size > 0 && capacity > 0);
        let bo_size = u64::from(desc_size) * u64::from(capacity);
        let bo = dev.new_bo(bo_size, 256, BoFlags::MAP)?;
        assert!(bo.map().is_some(), "descriptor table must be host-mapped");

        Ok(Self {
            bo,
            desc_size,
            capacity,
            inner: Mutex::new(TableInner {
                next: 0,
                free: Vec::with_capacity(capacity as usize),
            }),
        })
    }

    /// Allocate a slot and fill it with `data`; returns the slot index.
    ///
    /// Fails with out-of-device-memory when every slot is live; the table
    /// never grows.
    pub fn alloc(&self, data: &[u8]) -> Result<u32, DriverError> {
        assert!(data.len() <= self.desc_size as usize, "descriptor larger than a slot");
        let mut inner = self.inner.lock();

        let index = if let Some(index) = inner.free.pop() {
            index
        } else if inner.next < self.capacity {
            let index = inner.next;
            inner.next += 1;
            index
        } else {
            log::warn!("descriptor table exhausted ({} slots)", self.capacity);
            return Err(DriverError::OutOfDeviceMemory);
        };

        self.write_slot(index, data);
        Ok(index)
    }

    /// Allocate a slot for a plain-old-data descriptor record.
    pub fn alloc_typed<T: bytemuck::Pod>(&self, desc: &T) -> Result<u32, DriverError> {
        self.alloc(bytemuck::bytes_of(desc))
    }

    /// Overwrite a live slot in place.
    pub fn update(&self, index: u32, data: &[u8]) {
        assert!(data.len() <= self.desc_size as usize, "descriptor larger than a slot");
        let _guard = self.inner.lock();
        self.write_slot(index, data);
    }

    fn write_slot(&self, index: u32, data: &[u8]) {
        assert!(index < self.capacity);
        let offset = index as usize * self.desc_size as usize;
        self.bo.map().unwrap().write_bytes(offset, data);
    }

    /// Return a slot to the free stack.
    pub fn free(&self, index: u32) {
        assert!(index < self.capacity);
        let mut inner = self.inner.lock();
        assert!(inner.free.len() < self.capacity as usize);
        debug_assert!(
            !inner.free.contains(&index),
            "descriptor slot {index} freed twice"
        );
        inner.free.push(index);
    }

    /// GPU virtual address of slot zero.
    pub fn base_address(&self) -> u64 {
        self.bo.addr()
    }

    /// The table's backing allocation.
    pub fn bo(&self) -> &Arc<Bo> {
        &self.bo
    }

    /// Backing allocation and slot capacity, as the queue-state stream
    /// programs them into the hardware pool pointers.
    pub fn snapshot(&self) -> (Arc<Bo>, u32) {
        (Arc::clone(&self.bo), self.capacity)
    }

    /// Size of one slot in bytes.
    pub fn desc_size(&self) -> u32 {
        self.desc_size
    }

    /// Number of slots.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl std::fmt::Debug for DescriptorTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DescriptorTable")
            .field("desc_size", &self.desc_size)
            .field("capacity", &self.capacity)
            .field("next", &inner.next)
            .field("free", &inner.free.len())
            .finish()
    }
}

static_assertions::assert_impl_all!(DescriptorTable: Send, Sync);
