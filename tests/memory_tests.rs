//! Integration tests for the growable heap and the descriptor slot table.

mod common;

use std::sync::Arc;
use std::thread;

use common::MockDevice;
use nvsub::heap::{HEAP_MAX_BO_COUNT, HEAP_MIN_SIZE};
use nvsub::{BoFlags, DescriptorTable, DriverError, Heap};

// ============================================================================
// Heap
// ============================================================================

#[test]
fn test_heap_allocates_lazily() {
    common::init_logging();
    let mock = MockDevice::new();
    let heap = Heap::new(&mock.as_drm(), BoFlags::empty(), 0);
    assert_eq!(heap.bo_count(), 0);
    assert_eq!(heap.total_size(), 0);
    assert!(mock.allocs().is_empty());

    heap.alloc(0x100, 0x10).unwrap();
    assert_eq!(heap.bo_count(), 1);
    assert_eq!(heap.total_size(), HEAP_MIN_SIZE);
}

#[test]
fn test_heap_growth_doubles_after_second_allocation() {
    let mock = MockDevice::new();
    let heap = Heap::new(&mock.as_drm(), BoFlags::empty(), 0);

    // Consume each backing allocation whole to force the next growth step.
    heap.alloc(HEAP_MIN_SIZE, 1).unwrap();
    heap.alloc(HEAP_MIN_SIZE, 1).unwrap();
    heap.alloc(2 * HEAP_MIN_SIZE, 1).unwrap();
    heap.alloc(4 * HEAP_MIN_SIZE, 1).unwrap();

    let sizes: Vec<u64> = mock.allocs().iter().map(|a| a.size).collect();
    assert_eq!(
        sizes,
        vec![
            HEAP_MIN_SIZE,
            HEAP_MIN_SIZE,
            2 * HEAP_MIN_SIZE,
            4 * HEAP_MIN_SIZE
        ]
    );
    assert_eq!(heap.total_size(), 8 * HEAP_MIN_SIZE);
}

#[test]
fn test_heap_overalloc_pads_backing_but_not_capacity() {
    let mock = MockDevice::new();
    let heap = Heap::new(&mock.as_drm(), BoFlags::empty(), 0x1000);

    heap.alloc(HEAP_MIN_SIZE, 1).unwrap();
    // The padding is present in the kernel allocation...
    assert_eq!(mock.allocs()[0].size, HEAP_MIN_SIZE + 0x1000);
    // ...but not allocatable: the next byte comes from a new allocation.
    heap.alloc(1, 1).unwrap();
    assert_eq!(heap.bo_count(), 2);
}

#[test]
fn test_heap_addresses_stay_inside_backing() {
    let mock = MockDevice::new();
    let heap = Heap::new(&mock.as_drm(), BoFlags::empty(), 0);

    let mut allocs = Vec::new();
    for i in 1..64u64 {
        allocs.push(heap.alloc(i * 0x40, 0x100).unwrap());
    }

    for a in &allocs {
        assert_eq!(a.addr() % 0x100, 0);
        let owner = mock
            .bos_containing(a.addr())
            .expect("allocation outside every backing allocation");
        assert!(a.addr() + a.size() <= owner.addr() + owner.size());
    }

    // No two live ranges overlap.
    let mut ranges: Vec<(u64, u64)> = allocs.iter().map(|a| (a.addr(), a.size())).collect();
    ranges.sort_unstable();
    for w in ranges.windows(2) {
        assert!(w[0].0 + w[0].1 <= w[1].0, "overlapping heap ranges");
    }
}

#[test]
fn test_heap_free_and_reuse() {
    let mock = MockDevice::new();
    let heap = Heap::new(&mock.as_drm(), BoFlags::empty(), 0);

    let a = heap.alloc(0x1000, 0x100).unwrap();
    let addr = a.addr();
    heap.free(addr, 0x1000);

    // The freed range is the first fit for an identical request.
    let b = heap.alloc(0x1000, 0x100).unwrap();
    assert_eq!(b.addr(), addr);
    assert_eq!(heap.bo_count(), 1);
}

#[test]
fn test_heap_hard_cap() {
    let mock = MockDevice::new();
    let heap = Heap::new(&mock.as_drm(), BoFlags::empty(), 0);

    // Fill every backing allocation the growth policy will ever create.
    heap.alloc(HEAP_MIN_SIZE, 1).unwrap();
    for i in 0..(HEAP_MAX_BO_COUNT - 1) as u32 {
        heap.alloc(HEAP_MIN_SIZE << i, 1).unwrap();
    }
    assert_eq!(heap.bo_count(), HEAP_MAX_BO_COUNT);

    let err = heap.alloc(HEAP_MIN_SIZE, 1).unwrap_err();
    assert_eq!(err, DriverError::OutOfDeviceMemory);
}

#[test]
fn test_heap_allocation_failure_propagates() {
    let mock = MockDevice::new();
    let heap = Heap::new(&mock.as_drm(), BoFlags::empty(), 0);

    mock.set_fail_alloc(true);
    let err = heap.alloc(0x100, 1).unwrap_err();
    assert_eq!(err, DriverError::OutOfDeviceMemory);

    // Nothing half-grown: a later attempt succeeds cleanly.
    mock.set_fail_alloc(false);
    heap.alloc(0x100, 1).unwrap();
    assert_eq!(heap.bo_count(), 1);
}

#[test]
fn test_heap_upload_round_trip() {
    let mock = MockDevice::new();
    let heap = Heap::new(&mock.as_drm(), BoFlags::GART | BoFlags::MAP, 0);

    let data: Vec<u8> = (0..=255).collect();
    let addr = heap.upload(&data, 0x10).unwrap();

    let bo = mock.bos_containing(addr).unwrap();
    let mut out = vec![0u8; data.len()];
    bo.map().unwrap().read_bytes((addr - bo.addr()) as usize, &mut out);
    assert_eq!(out, data);
}

#[test]
fn test_heap_concurrent_alloc() {
    let mock = MockDevice::new();
    let heap = Arc::new(Heap::new(&mock.as_drm(), BoFlags::empty(), 0));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let heap = Arc::clone(&heap);
        handles.push(thread::spawn(move || {
            let mut addrs = Vec::new();
            for _ in 0..128 {
                addrs.push(heap.alloc(0x200, 0x40).unwrap().addr());
            }
            addrs
        }));
    }

    let mut all: Vec<u64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    all.sort_unstable();
    for w in all.windows(2) {
        assert!(w[1] - w[0] >= 0x200, "overlapping concurrent allocations");
    }
}

// ============================================================================
// Descriptor table
// ============================================================================

#[test]
fn test_table_backing_alignment() {
    let mock = MockDevice::new();
    let table = DescriptorTable::new(&mock.as_drm(), 32, 1024).unwrap();

    assert_eq!(mock.allocs().len(), 1);
    assert_eq!(mock.allocs()[0].size, 32 * 1024);
    assert!(mock.allocs()[0].align >= 256);
    assert_eq!(table.base_address() % 256, 0);
}

#[test]
fn test_table_alloc_writes_slot() {
    let mock = MockDevice::new();
    let table = DescriptorTable::new(&mock.as_drm(), 8, 16).unwrap();

    let idx = table.alloc(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
    assert_eq!(idx, 0);

    let bo = mock.bo(mock.allocs()[0].handle).unwrap();
    let mut out = [0u8; 8];
    bo.map().unwrap().read_bytes(0, &mut out);
    assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn test_table_free_slot_is_reused() {
    let mock = MockDevice::new();
    let table = DescriptorTable::new(&mock.as_drm(), 8, 16).unwrap();

    let a = table.alloc(&[0; 8]).unwrap();
    let b = table.alloc(&[0; 8]).unwrap();
    assert_ne!(a, b);

    table.free(a);
    let c = table.alloc(&[0; 8]).unwrap();
    assert_eq!(c, a);
}

#[test]
fn test_table_exhaustion() {
    let mock = MockDevice::new();
    let table = DescriptorTable::new(&mock.as_drm(), 8, 4).unwrap();

    for _ in 0..4 {
        table.alloc(&[0; 8]).unwrap();
    }
    let err = table.alloc(&[0; 8]).unwrap_err();
    assert_eq!(err, DriverError::OutOfDeviceMemory);

    // Freeing any slot makes the table allocatable again.
    table.free(2);
    assert_eq!(table.alloc(&[0; 8]).unwrap(), 2);
}

#[test]
fn test_table_update_in_place() {
    let mock = MockDevice::new();
    let table = DescriptorTable::new(&mock.as_drm(), 4, 8).unwrap();

    let idx = table.alloc(&0xdead_beefu32.to_le_bytes()).unwrap();
    table.update(idx, &0x0102_0304u32.to_le_bytes());

    let bo = mock.bo(mock.allocs()[0].handle).unwrap();
    assert_eq!(bo.map().unwrap().read_u32(idx as usize), 0x0102_0304);
}
