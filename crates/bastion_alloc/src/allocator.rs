//! # Secure Paged Allocator
//!
//! Heap memory whose pages are pinned for as long as the allocation lives.
//!
//! ## Lifecycle
//!
//! ```text
//!   Reserved ──► Pinning ──┬──► Secured ──► Unpinning ──► Released
//!                          │
//!                          └──► Failed
//! ```
//!
//! `Failed` and `Released` are terminal. A pointer is handed out only in
//! `Secured`.

#![allow(unsafe_code)]

use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use bastion_core::{ConfigError, PageLockTable, PageRange};

use crate::config::{AllocatorConfig, BastionConfig};
use crate::error::{AllocError, AllocResult, DeallocError};
use crate::heap::{HostHeap, SystemHeap};

/// Tracing target for allocation lifecycle events.
const ALLOC_TARGET: &str = "bastion::alloc";

/// Lifecycle state of one allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationState {
    /// Raw memory reserved, nothing pinned yet.
    Reserved,
    /// Pages are being acquired.
    Pinning,
    /// Every page is pinned; the pointer is owned by the caller.
    Secured,
    /// Pinning failed; raw memory returned.
    Failed,
    /// Pages are being released.
    Unpinning,
    /// Raw memory returned to the heap.
    Released,
}

impl AllocationState {
    /// Returns true for states an allocation never leaves.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Released)
    }

    /// Returns whether `next` is a legal successor of this state.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Reserved, Self::Pinning)
                | (Self::Pinning, Self::Secured | Self::Failed)
                | (Self::Secured, Self::Unpinning)
                | (Self::Unpinning, Self::Released)
        )
    }
}

/// Traces one allocation through its states.
struct Lifecycle {
    address: usize,
    size: usize,
    state: AllocationState,
}

impl Lifecycle {
    fn start(address: usize, size: usize, state: AllocationState) -> Self {
        tracing::trace!(target: ALLOC_TARGET, address, size, state = ?state, "allocation state");
        Self { address, size, state }
    }

    fn advance(&mut self, next: AllocationState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal allocation transition {:?} -> {next:?}",
            self.state
        );
        self.state = next;
        tracing::trace!(
            target: ALLOC_TARGET,
            address = self.address,
            size = self.size,
            state = ?next,
            "allocation state"
        );
    }
}

/// A secured allocation. Owns the memory until handed back to
/// [`SecurePagedAllocator::deallocate`].
///
/// Deliberately neither `Clone` nor `Copy`: there is exactly one owner.
pub struct SecureAllocation {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl SecureAllocation {
    /// Returns the start of the allocation.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Returns the start of the allocation as `NonNull`.
    #[inline]
    #[must_use]
    pub fn as_non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the size in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Returns the layout the memory was reserved with.
    #[inline]
    #[must_use]
    pub fn layout(&self) -> Layout {
        self.layout
    }
}

impl fmt::Debug for SecureAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureAllocation")
            .field("ptr", &self.ptr)
            .field("size", &self.layout.size())
            .field("align", &self.layout.align())
            .finish()
    }
}

// SAFETY: SecureAllocation is a unique owner of raw heap memory; moving that
// ownership between threads is sound, as it is for Box<[u8]>.
unsafe impl Send for SecureAllocation {}
// SAFETY: a shared reference only exposes the address and layout.
unsafe impl Sync for SecureAllocation {}

/// Allocation facade: reserve raw memory, pin its pages, hand out the pointer.
///
/// Cheap to clone. Every clone shares the same page lock table and heap,
/// so pages shared by allocations from different clones are counted once.
///
/// # Example
///
/// ```rust,ignore
/// let table = Arc::new(PageLockTable::new(TableConfig::default())?);
/// let allocator = SecurePagedAllocator::new(table);
///
/// let key = allocator.allocate(32, 1)?;   // 32 pinned bytes
/// // ...
/// unsafe { allocator.deallocate(key) }?;
/// ```
#[derive(Clone)]
pub struct SecurePagedAllocator {
    table: Arc<PageLockTable>,
    heap: Arc<dyn HostHeap>,
    default_alignment: usize,
}

impl SecurePagedAllocator {
    /// Creates an allocator over the global heap with default settings.
    #[must_use]
    pub fn new(table: Arc<PageLockTable>) -> Self {
        Self {
            table,
            heap: Arc::new(SystemHeap),
            default_alignment: AllocatorConfig::default().default_alignment,
        }
    }

    /// Creates an allocator over an explicit heap.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the config fails validation.
    pub fn with_heap(
        table: Arc<PageLockTable>,
        heap: Arc<dyn HostHeap>,
        config: &AllocatorConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            table,
            heap,
            default_alignment: config.default_alignment,
        })
    }

    /// Builds an OS-pinning table and an allocator over the global heap.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if any section fails validation.
    pub fn from_config(config: &BastionConfig) -> Result<Self, ConfigError> {
        let table = Arc::new(PageLockTable::new(config.table.clone())?);
        Self::with_heap(table, Arc::new(SystemHeap), &config.allocator)
    }

    /// Returns the shared page lock table.
    #[must_use]
    pub fn table(&self) -> &Arc<PageLockTable> {
        &self.table
    }

    /// Returns the alignment used by [`SecurePagedAllocator::allocate`].
    #[must_use]
    pub fn default_alignment(&self) -> usize {
        self.default_alignment
    }

    /// Returns the pages an allocation keeps pinned.
    #[must_use]
    pub fn pages_of(&self, allocation: &SecureAllocation) -> PageRange {
        self.table.range_of(allocation.as_ptr(), allocation.size())
    }

    /// Allocates `count * element_size` bytes with every spanned page pinned.
    ///
    /// # Errors
    ///
    /// - [`AllocError::ZeroSized`] / [`AllocError::SizeOverflow`] for bad sizes
    /// - [`AllocError::OutOfMemory`] if the heap is exhausted
    /// - [`AllocError::Pin`] if a page could not be pinned
    pub fn allocate(&self, count: usize, element_size: usize) -> AllocResult<SecureAllocation> {
        self.allocate_aligned(count, element_size, self.default_alignment)
    }

    /// Allocates `count * element_size` bytes aligned to `align`.
    ///
    /// # Errors
    ///
    /// As [`SecurePagedAllocator::allocate`], plus [`AllocError::InvalidAlignment`].
    pub fn allocate_aligned(
        &self,
        count: usize,
        element_size: usize,
        align: usize,
    ) -> AllocResult<SecureAllocation> {
        if !align.is_power_of_two() {
            return Err(AllocError::InvalidAlignment(align));
        }
        let overflow = AllocError::SizeOverflow { count, element_size };
        let size = count.checked_mul(element_size).ok_or_else(|| overflow.clone())?;
        let layout = Layout::from_size_align(size, align).map_err(|_| overflow)?;
        self.allocate_layout(layout)
    }

    /// Allocates memory for `layout` with every spanned page pinned.
    ///
    /// # Errors
    ///
    /// As [`SecurePagedAllocator::allocate`].
    pub fn allocate_layout(&self, layout: Layout) -> AllocResult<SecureAllocation> {
        if layout.size() == 0 {
            return Err(AllocError::ZeroSized);
        }

        let Some(ptr) = self.heap.reserve(layout) else {
            tracing::warn!(target: ALLOC_TARGET, size = layout.size(), "host heap exhausted");
            return Err(AllocError::OutOfMemory { bytes: layout.size() });
        };
        let mut lifecycle = Lifecycle::start(ptr.as_ptr() as usize, layout.size(), AllocationState::Reserved);

        let pages = self.table.range_of(ptr.as_ptr(), layout.size());
        lifecycle.advance(AllocationState::Pinning);

        if let Err(err) = self.table.acquire(pages) {
            // SAFETY: reserved above with this layout and never exposed.
            unsafe { self.heap.release(ptr, layout) };
            lifecycle.advance(AllocationState::Failed);
            tracing::warn!(
                target: ALLOC_TARGET,
                size = layout.size(),
                pages = pages.len(),
                error = %err,
                "allocation failed while pinning"
            );
            return Err(AllocError::Pin(err));
        }

        lifecycle.advance(AllocationState::Secured);
        Ok(SecureAllocation { ptr, layout })
    }

    /// Releases the allocation's pages, then returns its memory to the heap.
    ///
    /// The memory is returned even if unpinning fails; a page left locked on
    /// the host side is preferable to leaked memory.
    ///
    /// # Errors
    ///
    /// Returns [`DeallocError::Unpin`] as a diagnostic when a page could not
    /// be unpinned.
    ///
    /// # Panics
    ///
    /// Panics if the page lock table has no reference for one of the
    /// allocation's pages. That only happens after a contract violation or
    /// table corruption and is not recoverable.
    ///
    /// # Safety
    ///
    /// `allocation` must have been returned by this allocator, or a clone of
    /// it, so that it is released to the heap it was reserved from.
    pub unsafe fn deallocate(&self, allocation: SecureAllocation) -> Result<(), DeallocError> {
        let SecureAllocation { ptr, layout } = allocation;
        let mut lifecycle = Lifecycle::start(ptr.as_ptr() as usize, layout.size(), AllocationState::Secured);

        let pages = self.table.range_of(ptr.as_ptr(), layout.size());
        lifecycle.advance(AllocationState::Unpinning);

        let outcome = self.table.release(pages);
        if let Err(err) = &outcome {
            if err.is_fatal() {
                tracing::error!(
                    target: ALLOC_TARGET,
                    address = ptr.as_ptr() as usize,
                    size = layout.size(),
                    error = %err,
                    "page lock table consistency fault"
                );
                panic!("page lock table consistency fault: {err}");
            }
        }

        // SAFETY: caller guarantees the allocation came from this heap.
        unsafe { self.heap.release(ptr, layout) };
        lifecycle.advance(AllocationState::Released);

        outcome.map_err(DeallocError::Unpin)
    }
}

impl fmt::Debug for SecurePagedAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurePagedAllocator")
            .field("page_size", &self.table.page_size())
            .field("default_alignment", &self.default_alignment)
            .field("tracked_pages", &self.table.tracked_pages())
            .finish_non_exhaustive()
    }
}
