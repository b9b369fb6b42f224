//! OS-backed page pinning.

use super::PagePinner;
use crate::error::HostError;
use crate::page::{PageKey, PageSize};

/// Pins pages with the operating system's memory locking facility.
///
/// Unprivileged processes are usually capped by `RLIMIT_MEMLOCK` on Linux;
/// exceeding it surfaces as a pin failure carrying `ENOMEM` or `EPERM`.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsPagePinner;

impl OsPagePinner {
    /// Creates the OS pinner.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl PagePinner for OsPagePinner {
    fn pin(&self, page: PageKey, page_size: PageSize) -> Result<(), HostError> {
        let guard = region::lock(page.as_ptr(), page_size.bytes()).map_err(host_error)?;
        // The guard unlocks on drop; the table issues the matching unpin itself.
        std::mem::forget(guard);
        Ok(())
    }

    fn unpin(&self, page: PageKey, page_size: PageSize) -> Result<(), HostError> {
        region::unlock(page.as_ptr(), page_size.bytes()).map_err(host_error)
    }
}

fn host_error(err: region::Error) -> HostError {
    match err {
        region::Error::SystemCall(io) => match io.raw_os_error() {
            Some(code) => HostError::from_code(code),
            None => HostError::new(None, io.to_string()),
        },
        other => HostError::new(None, other.to_string()),
    }
}
