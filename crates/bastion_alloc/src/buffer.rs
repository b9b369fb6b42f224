//! # Secure Buffer
//!
//! Owned byte buffer living in pinned memory. The buffer keeps a handle to
//! the allocator that produced it and gives the memory back on drop.

#![allow(unsafe_code)]

use std::fmt;
use std::ops::{Deref, DerefMut};

use bastion_core::PageRange;

use crate::allocator::{SecureAllocation, SecurePagedAllocator};
use crate::error::{AllocResult, DeallocError};

/// Pinned, zero-initialised byte buffer.
///
/// # Example
///
/// ```rust,ignore
/// let mut key = SecureBuffer::new(&allocator, 32)?;
/// key.copy_from_slice(&derived_key);
/// // pages stay pinned until `key` is dropped
/// ```
pub struct SecureBuffer {
    /// `None` only after `release` has taken it.
    allocation: Option<SecureAllocation>,
    allocator: SecurePagedAllocator,
}

impl SecureBuffer {
    /// Allocates `len` zeroed bytes in pinned memory.
    ///
    /// # Errors
    ///
    /// Returns the allocator's error; zero-length buffers are rejected with
    /// [`AllocError::ZeroSized`](crate::AllocError::ZeroSized).
    pub fn new(allocator: &SecurePagedAllocator, len: usize) -> AllocResult<Self> {
        let allocation = allocator.allocate(len, 1)?;
        // SAFETY: the allocation is `len` writable bytes owned by us.
        unsafe { allocation.as_ptr().write_bytes(0, len) };
        Ok(Self {
            allocation: Some(allocation),
            allocator: allocator.clone(),
        })
    }

    /// Copies `data` into a new pinned buffer.
    ///
    /// # Errors
    ///
    /// As [`SecureBuffer::new`].
    pub fn from_slice(allocator: &SecurePagedAllocator, data: &[u8]) -> AllocResult<Self> {
        let mut buffer = Self::new(allocator, data.len())?;
        buffer.copy_from_slice(data);
        Ok(buffer)
    }

    /// Returns the pages this buffer keeps pinned.
    #[must_use]
    pub fn pages(&self) -> PageRange {
        self.allocator.pages_of(self.allocation())
    }

    /// Releases the buffer, reporting unpin failures instead of logging them.
    ///
    /// # Errors
    ///
    /// Returns [`DeallocError::Unpin`] if a page could not be unpinned. The
    /// memory is released either way.
    pub fn release(mut self) -> Result<(), DeallocError> {
        match self.allocation.take() {
            // SAFETY: produced by `self.allocator` in `new`.
            Some(allocation) => unsafe { self.allocator.deallocate(allocation) },
            None => Ok(()),
        }
    }

    fn allocation(&self) -> &SecureAllocation {
        // Only `release` takes the allocation, and it consumes `self`.
        self.allocation
            .as_ref()
            .unwrap_or_else(|| unreachable!("buffer used after release"))
    }
}

impl Deref for SecureBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        let allocation = self.allocation();
        // SAFETY: initialised in `new`, owned exclusively by this buffer.
        unsafe { std::slice::from_raw_parts(allocation.as_ptr(), allocation.size()) }
    }
}

impl DerefMut for SecureBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        let allocation = self.allocation();
        let (ptr, len) = (allocation.as_ptr(), allocation.size());
        // SAFETY: initialised in `new`; `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(ptr, len) }
    }
}

impl Drop for SecureBuffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            // SAFETY: produced by `self.allocator` in `new`.
            if let Err(err) = unsafe { self.allocator.deallocate(allocation) } {
                tracing::warn!(target: "bastion::alloc", error = %err, "secure buffer dropped with a page still pinned");
            }
        }
    }
}

impl fmt::Debug for SecureBuffer {
    // Contents are secret; only the shape is printed.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureBuffer")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
