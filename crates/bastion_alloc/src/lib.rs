//! # BASTION Allocator
//!
//! Heap allocations that never reach swap while they are alive.
//!
//! ## Architecture
//!
//! ```text
//! allocate(n, size)                         deallocate(allocation)
//!     │                                         │
//!     ▼                                         ▼
//! HostHeap::reserve ──► PageRange ──►      PageRange ──► PageLockTable::release
//!                        │                                    │
//!                        ▼                                    ▼
//!              PageLockTable::acquire               HostHeap::release (always)
//!                        │
//!             ok ◄───────┴───────► pin failed: HostHeap::release, Err
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use bastion_alloc::{BastionConfig, SecureBuffer, SecurePagedAllocator};
//!
//! let config = BastionConfig::from_file("bastion.toml")?;
//! let allocator = SecurePagedAllocator::from_config(&config)?;
//!
//! let password = SecureBuffer::from_slice(&allocator, input.as_bytes())?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod allocator;
pub mod buffer;
pub mod config;
pub mod error;
pub mod heap;

pub use allocator::{AllocationState, SecureAllocation, SecurePagedAllocator};
pub use buffer::SecureBuffer;
pub use config::{AllocatorConfig, BastionConfig, DEFAULT_ALIGNMENT};
pub use error::{AllocError, AllocResult, DeallocError};
pub use heap::{CountingHeap, HostHeap, SystemHeap};

pub use bastion_core::{PageKey, PageLockTable, PageRange, PageSize, TableConfig};
