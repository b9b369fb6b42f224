//! # Host Page Pinning
//!
//! The contract the page lock table requires from the host: pin or unpin a
//! single page-aligned, page-sized region, succeeding or failing synchronously.
//!
//! ## Implementations
//!
//! - [`OsPagePinner`]: `mlock`/`munlock` on Unix, `VirtualLock`/`VirtualUnlock`
//!   on Windows (through the `region` crate)
//! - `RecordingPinner` (feature `testing`): in-memory double that counts calls
//!   per page, flags doubled-up pins and injects failures

mod os;
#[cfg(any(test, feature = "testing"))]
mod recording;

pub use os::OsPagePinner;
#[cfg(any(test, feature = "testing"))]
pub use recording::{PinRecord, PinViolation, RecordingPinner};

use crate::error::HostError;
use crate::page::{PageKey, PageSize};

/// Host primitive that keeps pages resident in physical memory.
///
/// The table calls `pin` and `unpin` only while holding the page's entry
/// lock, so an implementation never sees two in-flight calls for the same
/// page. Calls for different pages may arrive concurrently.
pub trait PagePinner: Send + Sync {
    /// Pins `page_size` bytes starting at `page`.
    ///
    /// # Errors
    ///
    /// Returns the host failure if the page could not be pinned.
    fn pin(&self, page: PageKey, page_size: PageSize) -> Result<(), HostError>;

    /// Unpins `page_size` bytes starting at `page`.
    ///
    /// # Errors
    ///
    /// Returns the host failure if the page could not be unpinned.
    fn unpin(&self, page: PageKey, page_size: PageSize) -> Result<(), HostError>;
}
