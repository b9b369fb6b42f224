//! # BASTION Core
//!
//! Reference-counted page pinning for memory that must never reach swap.
//!
//! Allocations share pages. A page stays pinned while at least one live
//! allocation overlaps it and is unpinned the moment the last one goes away:
//! - exactly one host pin per 0->1 transition
//! - exactly one host unpin per 1->0 transition
//! - no lock on the steady-state path
//!
//! ## Example
//!
//! ```rust,ignore
//! use bastion_core::{PageLockTable, TableConfig};
//!
//! let table = Arc::new(PageLockTable::new(TableConfig::default())?);
//! let pages = table.range_of(ptr, len);
//! table.acquire(pages)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod error;
pub mod page;
pub mod pin;
pub mod table;

pub use config::TableConfig;
pub use error::{ConfigError, HostError, PageLockError, PageLockResult};
pub use page::{PageIter, PageKey, PageRange, PageSize};
pub use pin::{OsPagePinner, PagePinner};
#[cfg(any(test, feature = "testing"))]
pub use pin::{PinRecord, PinViolation, RecordingPinner};
pub use table::{PageLockTable, TableStats};
