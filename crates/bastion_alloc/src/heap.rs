//! # Host Heap
//!
//! The raw memory source behind the secure allocator. Reservation and
//! release are thin requests to the host heap; pinning happens elsewhere.

#![allow(unsafe_code)]

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Raw memory provider.
pub trait HostHeap: Send + Sync {
    /// Reserves memory for `layout`. `layout.size()` is never zero.
    ///
    /// Returns `None` when the heap is exhausted.
    fn reserve(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Returns memory to the heap.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`HostHeap::reserve`] on this heap
    /// with the same `layout`, and must not be released twice.
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The process's global allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemHeap;

impl HostHeap for SystemHeap {
    fn reserve(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.size() > 0, "zero-sized reservation");
        // SAFETY: layout has a non-zero size (checked by the allocator).
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: guaranteed by the caller contract of `HostHeap::release`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

/// Heap wrapper counting reservations, for leak checks and diagnostics.
#[derive(Debug, Default)]
pub struct CountingHeap<H = SystemHeap> {
    inner: H,
    reserved: AtomicUsize,
    released: AtomicUsize,
    live: AtomicUsize,
    live_bytes: AtomicUsize,
}

impl<H: HostHeap> CountingHeap<H> {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            reserved: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
        }
    }

    /// Returns the number of successful reservations.
    #[must_use]
    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }

    /// Returns the number of releases.
    #[must_use]
    pub fn released(&self) -> usize {
        self.released.load(Ordering::Acquire)
    }

    /// Returns reservations not yet released.
    #[must_use]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Returns bytes reserved and not yet released.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Acquire)
    }
}

impl<H: HostHeap> HostHeap for CountingHeap<H> {
    fn reserve(&self, layout: Layout) -> Option<NonNull<u8>> {
        let ptr = self.inner.reserve(layout)?;
        self.reserved.fetch_add(1, Ordering::AcqRel);
        self.live.fetch_add(1, Ordering::AcqRel);
        self.live_bytes.fetch_add(layout.size(), Ordering::AcqRel);
        Some(ptr)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.release(ptr, layout) };
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.live_bytes.fetch_sub(layout.size(), Ordering::AcqRel);
        self.released.fetch_add(1, Ordering::AcqRel);
    }
}
