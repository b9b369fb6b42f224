//! # Allocation Error Types

use bastion_core::PageLockError;
use thiserror::Error;

/// Errors that can occur while allocating secured memory.
///
/// No variant ever comes with a pointer: a failed allocation leaves nothing
/// reserved and nothing pinned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// The host heap is exhausted. No pinning was attempted.
    #[error("out of memory: could not reserve {bytes} bytes")]
    OutOfMemory {
        /// Bytes requested.
        bytes: usize,
    },

    /// A zero-byte allocation was requested.
    #[error("zero-sized allocation requested")]
    ZeroSized,

    /// `count * element_size` does not fit a valid allocation size.
    #[error("allocation size overflows: {count} x {element_size} bytes")]
    SizeOverflow {
        /// Number of elements requested.
        count: usize,
        /// Size of one element.
        element_size: usize,
    },

    /// The requested alignment is not a power of two.
    #[error("invalid alignment {0}: must be a power of two")]
    InvalidAlignment(usize),

    /// A page could not be pinned. The reservation was returned to the heap.
    #[error("could not pin allocation: {0}")]
    Pin(#[source] PageLockError),
}

/// Diagnostic raised by a deallocation.
///
/// The memory has been returned to the heap regardless.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeallocError {
    /// A page could not be unpinned and may remain locked by the host.
    #[error("memory released but a page could not be unpinned: {0}")]
    Unpin(#[source] PageLockError),
}

/// Result type for allocation operations.
pub type AllocResult<T> = Result<T, AllocError>;
