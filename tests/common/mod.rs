//! Common utilities for submission-core integration tests.
//!
//! The centerpiece is [`MockDevice`], a software [`DrmDevice`] that backs
//! allocations with host memory and records every kernel interaction so
//! tests can assert on buffer lists, push ranges and allocation patterns.

// Each test binary uses a different slice of this module.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use nvsub::{Bo, BoFlags, BoMap, DriverError, DrmDevice, SubmitRequest};

/// Install the test logger once; safe to call from every test.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Size and placement of one allocation request, as the mock saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRecord {
    pub handle: u32,
    pub size: u64,
    pub align: u64,
    pub flags: BoFlags,
}

/// A software kernel device.
///
/// Allocations get bump-allocated GPU addresses and, when mapping is
/// requested, host memory behind the map. Submissions are recorded, not
/// executed; completion polls answer from a single switchable flag.
pub struct MockDevice {
    next_handle: AtomicU32,
    next_addr: AtomicU64,
    idle: AtomicBool,
    /// When set, the next `new_bo` calls fail with out-of-device-memory.
    fail_alloc: AtomicBool,
    /// Error to return from every `submit` call, if any.
    submit_error: Mutex<Option<DriverError>>,
    allocs: Mutex<Vec<AllocRecord>>,
    bos: Mutex<Vec<Arc<Bo>>>,
    submissions: Mutex<Vec<SubmitRequest>>,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_handle: AtomicU32::new(1),
            next_addr: AtomicU64::new(0x1_0000_0000),
            idle: AtomicBool::new(false),
            fail_alloc: AtomicBool::new(false),
            submit_error: Mutex::new(None),
            allocs: Mutex::new(Vec::new()),
            bos: Mutex::new(Vec::new()),
            submissions: Mutex::new(Vec::new()),
        })
    }

    /// The same device as a trait object, the shape the crate's
    /// constructors take.
    pub fn as_drm(self: &Arc<Self>) -> Arc<dyn DrmDevice> {
        Arc::clone(self) as Arc<dyn DrmDevice>
    }

    /// Every allocation request seen so far, in order.
    pub fn allocs(&self) -> Vec<AllocRecord> {
        self.allocs.lock().clone()
    }

    /// Look up a live allocation by kernel handle.
    pub fn bo(&self, handle: u32) -> Option<Arc<Bo>> {
        self.bos.lock().iter().find(|b| b.handle() == handle).cloned()
    }

    /// Look up the allocation whose GPU address range contains `addr`.
    pub fn bos_containing(&self, addr: u64) -> Option<Arc<Bo>> {
        self.bos.lock().iter().find(|b| b.contains(addr)).cloned()
    }

    /// Every submission accepted so far, in order.
    pub fn submissions(&self) -> Vec<SubmitRequest> {
        self.submissions.lock().clone()
    }

    pub fn num_submissions(&self) -> usize {
        self.submissions.lock().len()
    }

    /// Make subsequent allocation requests fail.
    pub fn set_fail_alloc(&self, fail: bool) {
        self.fail_alloc.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent submissions fail with `err`.
    pub fn set_submit_error(&self, err: Option<DriverError>) {
        *self.submit_error.lock() = err;
    }

    /// Flip the answer `bo_idle` gives.
    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::SeqCst);
    }
}

impl DrmDevice for MockDevice {
    fn new_bo(&self, size: u64, align: u64, flags: BoFlags) -> Result<Arc<Bo>, DriverError> {
        if self.fail_alloc.load(Ordering::SeqCst) {
            return Err(DriverError::OutOfDeviceMemory);
        }

        let align = align.max(0x1000);
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let addr = loop {
            let cur = self.next_addr.load(Ordering::SeqCst);
            let aligned = (cur + align - 1) & !(align - 1);
            if self
                .next_addr
                .compare_exchange(cur, aligned + size, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break aligned;
            }
        };

        self.allocs.lock().push(AllocRecord {
            handle,
            size,
            align,
            flags,
        });

        let bo = if flags.contains(BoFlags::MAP) {
            Bo::new_mapped(handle, addr, size, flags, BoMap::new_host(size as usize))
        } else {
            Bo::new(handle, addr, size, flags)
        };
        let bo = Arc::new(bo);
        self.bos.lock().push(Arc::clone(&bo));
        Ok(bo)
    }

    fn submit(&self, req: &SubmitRequest) -> Result<(), DriverError> {
        if let Some(err) = self.submit_error.lock().clone() {
            return Err(err);
        }
        self.submissions.lock().push(req.clone());
        Ok(())
    }

    fn bo_idle(&self, _bo: &Bo) -> Result<bool, DriverError> {
        Ok(self.idle.load(Ordering::SeqCst))
    }
}
