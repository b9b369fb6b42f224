//! # Allocator Property Tests
//!
//! End-to-end checks of the allocator over a recording pinner:
//!
//! 1. **Coverage**: every page of a live allocation is pinned
//! 2. **Sharing**: overlapping allocations pin a page once and unpin it once
//! 3. **Rollback**: a failed pin leaves nothing pinned and nothing reserved
//! 4. **Concurrency**: refcounts always match the live allocations
//!
//! Run with: cargo test -p bastion_alloc --test allocator_properties

#![allow(unsafe_code)]

use std::alloc::Layout;
use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use bastion_alloc::{
    AllocError, AllocatorConfig, CountingHeap, HostHeap, SecureAllocation, SecureBuffer,
    SecurePagedAllocator, SystemHeap,
};
use bastion_core::{
    PageKey, PageLockError, PageLockTable, PagePinner, PageSize, RecordingPinner, TableConfig,
};
use parking_lot::Mutex;

const PAGE: usize = 4096;
const ARENA_PAGES: usize = 64;

fn page_size() -> PageSize {
    PageSize::new(PAGE).unwrap()
}

/// Heap handing out preplanned offsets inside a page-aligned arena.
struct ScriptedHeap {
    base: usize,
    offsets: Mutex<VecDeque<usize>>,
    released: AtomicUsize,
}

impl ScriptedHeap {
    fn arena_layout() -> Layout {
        Layout::from_size_align(ARENA_PAGES * PAGE, PAGE).unwrap()
    }

    fn new(offsets: &[usize]) -> Self {
        let base = unsafe { std::alloc::alloc(Self::arena_layout()) };
        assert!(!base.is_null());
        Self {
            base: base as usize,
            offsets: Mutex::new(offsets.iter().copied().collect()),
            released: AtomicUsize::new(0),
        }
    }

    fn key(&self, page: usize) -> PageKey {
        PageKey::containing(self.base + page * PAGE, page_size())
    }
}

impl HostHeap for ScriptedHeap {
    fn reserve(&self, layout: Layout) -> Option<NonNull<u8>> {
        let offset = self.offsets.lock().pop_front()?;
        assert!(offset + layout.size() <= ARENA_PAGES * PAGE);
        NonNull::new((self.base + offset) as *mut u8)
    }

    unsafe fn release(&self, _ptr: NonNull<u8>, _layout: Layout) {
        self.released.fetch_add(1, Ordering::AcqRel);
    }
}

impl Drop for ScriptedHeap {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.base as *mut u8, Self::arena_layout()) };
    }
}

fn allocator_over(
    pinner: &Arc<RecordingPinner>,
    heap: Arc<dyn HostHeap>,
    config: TableConfig,
) -> SecurePagedAllocator {
    let table = PageLockTable::with_pinner(
        Arc::clone(pinner) as Arc<dyn PagePinner>,
        page_size(),
        config,
    )
    .unwrap();
    SecurePagedAllocator::with_heap(Arc::new(table), heap, &AllocatorConfig::default()).unwrap()
}

fn scripted(offsets: &[usize]) -> (Arc<RecordingPinner>, Arc<ScriptedHeap>, SecurePagedAllocator) {
    let pinner = Arc::new(RecordingPinner::new());
    let heap = Arc::new(ScriptedHeap::new(offsets));
    let allocator = allocator_over(
        &pinner,
        Arc::clone(&heap) as Arc<dyn HostHeap>,
        TableConfig::default(),
    );
    (pinner, heap, allocator)
}

fn free(allocator: &SecurePagedAllocator, allocation: SecureAllocation) {
    unsafe { allocator.deallocate(allocation) }.unwrap();
}

// ============================================================================
// COVERAGE
// ============================================================================

#[test]
fn every_overlapping_page_is_pinned_after_allocate() {
    let pinner = Arc::new(RecordingPinner::new());
    let heap = Arc::new(CountingHeap::new(SystemHeap));
    let allocator = allocator_over(&pinner, Arc::clone(&heap) as Arc<dyn HostHeap>, TableConfig::default());

    for size in [1, 15, 4095, 4096, 4097, 10_000, 65_536] {
        let allocation = allocator.allocate(size, 1).unwrap();
        let start = allocation.as_ptr() as usize;
        for address in (start..start + size).step_by(PAGE).chain([start + size - 1]) {
            let page = PageKey::containing(address, page_size());
            assert!(allocator.table().refcount(page).unwrap() >= 1, "size {size}");
            assert!(pinner.is_pinned(page));
        }
        free(&allocator, allocation);
    }

    assert_eq!(heap.live(), 0);
    assert!(pinner.pinned_pages().is_empty());
    assert!(pinner.violations().is_empty());
}

#[test]
fn boundary_page_counts() {
    // aligned 1 byte | full page from mid-page | 2 bytes straddling a boundary
    let (pinner, heap, allocator) = scripted(&[0, 10 * PAGE + 100, 21 * PAGE - 1]);

    let one = allocator.allocate(1, 1).unwrap();
    assert_eq!(allocator.pages_of(&one).len(), 1);

    let page = allocator.allocate(PAGE, 1).unwrap();
    assert_eq!(allocator.pages_of(&page).len(), 2);

    let straddle = allocator.allocate(2, 1).unwrap();
    assert_eq!(allocator.pages_of(&straddle).len(), 2);
    assert!(pinner.is_pinned(heap.key(20)));
    assert!(pinner.is_pinned(heap.key(21)));

    assert_eq!(pinner.total_pins(), 5);
    for allocation in [one, page, straddle] {
        free(&allocator, allocation);
    }
    assert_eq!(pinner.total_unpins(), 5);
}

#[test]
fn ten_thousand_bytes_on_aligned_page() {
    let (pinner, heap, allocator) = scripted(&[0]);

    let allocation = allocator.allocate(10_000, 1).unwrap();
    assert_eq!(pinner.total_pins(), 3);
    for page in 0..3 {
        assert_eq!(allocator.table().refcount(heap.key(page)), Some(1));
    }

    free(&allocator, allocation);
    assert_eq!(pinner.total_unpins(), 3);
    assert_eq!(allocator.table().tracked_pages(), 0);

    let stats = allocator.table().stats();
    assert_eq!((stats.pin_failures, stats.unpin_failures), (0, 0));
}

#[test]
fn round_trip_restores_table() {
    let (pinner, heap, allocator) = scripted(&[2 * PAGE + 64, 0]);

    // Long-lived neighbour on page 2, the last page of the big allocation
    let neighbour = allocator.allocate(32, 1).unwrap();
    let before = allocator.table().snapshot();

    let allocation = allocator.allocate(3 * PAGE, 1).unwrap();
    free(&allocator, allocation);

    assert_eq!(allocator.table().snapshot(), before);
    assert!(pinner.is_pinned(heap.key(2)));
    assert!(!pinner.is_pinned(heap.key(0)));
    assert_eq!(pinner.pins(heap.key(2)), 1);

    free(&allocator, neighbour);
    assert!(allocator.table().snapshot().is_empty());
}

// ============================================================================
// ROLLBACK
// ============================================================================

#[test]
fn pin_failure_on_second_of_three_pages() {
    let (pinner, heap, allocator) = scripted(&[0]);
    pinner.fail_pin_on(heap.key(1));

    let err = allocator.allocate(3 * PAGE, 1).unwrap_err();
    match err {
        AllocError::Pin(PageLockError::PinFailure { address, .. }) => assert_eq!(address, heap.key(1)),
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(pinner.pins(heap.key(0)), 1);
    assert_eq!(pinner.unpins(heap.key(0)), 1);
    assert_eq!(pinner.record(heap.key(2)).pins, 0);
    assert!(pinner.pinned_pages().is_empty());
    assert_eq!(heap.released.load(Ordering::Acquire), 1);
    assert_eq!(allocator.table().tracked_pages(), 0);
}

// ============================================================================
// CONCURRENCY
// ============================================================================

#[test]
fn two_concurrent_allocations_share_one_pin() {
    let pinner = Arc::new(RecordingPinner::with_delay(Duration::from_millis(5)));
    let heap = Arc::new(ScriptedHeap::new(&[100, 2000]));
    let allocator = allocator_over(&pinner, Arc::clone(&heap) as Arc<dyn HostHeap>, TableConfig::default());
    let page = heap.key(0);

    let barrier = Arc::new(Barrier::new(2));
    let (tx, rx) = crossbeam_channel::unbounded();
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let allocator = allocator.clone();
            let barrier = Arc::clone(&barrier);
            let tx = tx.clone();
            thread::spawn(move || {
                barrier.wait();
                tx.send(allocator.allocate(16, 1).unwrap()).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    drop(tx);
    let mut live: Vec<SecureAllocation> = rx.iter().collect();

    assert_eq!(pinner.pins(page), 1);
    assert_eq!(allocator.table().refcount(page), Some(2));

    free(&allocator, live.pop().unwrap());
    assert_eq!(allocator.table().refcount(page), Some(1));
    assert_eq!(pinner.unpins(page), 0);

    free(&allocator, live.pop().unwrap());
    assert_eq!(allocator.table().refcount(page), None);
    assert_eq!(pinner.unpins(page), 1);
    assert!(pinner.violations().is_empty());
}

#[test]
fn refcounts_match_live_allocations_under_churn() {
    for config in [TableConfig::default(), TableConfig::retaining()] {
        let pinner = Arc::new(RecordingPinner::with_delay(Duration::from_micros(20)));
        let heap = Arc::new(CountingHeap::new(SystemHeap));
        let allocator = allocator_over(&pinner, Arc::clone(&heap) as Arc<dyn HostHeap>, config);

        let (tx, rx) = crossbeam_channel::unbounded();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let allocator = allocator.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    let mut held = Vec::new();
                    for i in 0..300 {
                        let size = 1 + (t * 131 + i * 977) % (3 * PAGE);
                        held.push(allocator.allocate(size, 1).unwrap());
                        if held.len() > 4 {
                            let victim = held.swap_remove(i % held.len());
                            free(&allocator, victim);
                        }
                    }
                    // Keep a few alive past the join
                    for allocation in held.drain(..2) {
                        tx.send(allocation).unwrap();
                    }
                    for allocation in held {
                        free(&allocator, allocation);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        drop(tx);
        let live: Vec<SecureAllocation> = rx.iter().collect();

        let mut expected: HashMap<PageKey, usize> = HashMap::new();
        for allocation in &live {
            for page in &allocator.pages_of(allocation) {
                *expected.entry(page).or_default() += 1;
            }
        }
        for (page, count) in &expected {
            assert_eq!(allocator.table().refcount(*page), Some(*count));
            let record = pinner.record(*page);
            assert_eq!(record.pins - record.unpins, 1);
        }
        assert_eq!(allocator.table().stats().pinned_pages, expected.len());

        for allocation in live {
            free(&allocator, allocation);
        }

        assert!(pinner.violations().is_empty(), "{:?}", pinner.violations());
        assert!(pinner.pinned_pages().is_empty());
        assert_eq!(pinner.total_pins(), pinner.total_unpins());
        assert_eq!(heap.live(), 0);
        assert_eq!(allocator.table().stats().pinned_pages, 0);
    }
}

// ============================================================================
// OS PINNING
// ============================================================================

#[test]
fn os_pinned_buffer_round_trip() {
    let allocator = SecurePagedAllocator::from_config(&Default::default()).unwrap();

    match SecureBuffer::from_slice(&allocator, b"correct horse battery staple") {
        Ok(buffer) => {
            assert_eq!(&buffer[..5], b"corre");
            let pages = buffer.pages();
            for page in &pages {
                assert!(allocator.table().is_pinned(page));
            }
            buffer.release().unwrap();
            for page in &pages {
                assert!(!allocator.table().is_pinned(page));
            }
        }
        // Environments without a memlock allowance refuse the pin.
        Err(AllocError::Pin(PageLockError::PinFailure { .. })) => {
            assert_eq!(allocator.table().tracked_pages(), 0);
        }
        Err(other) => panic!("unexpected error: {other}"),
    }
}
