//! Table counters.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Snapshot of table activity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TableStats {
    /// Successful host pin calls.
    pub pin_calls: u64,
    /// Successful host unpin calls.
    pub unpin_calls: u64,
    /// Host pin calls that failed.
    pub pin_failures: u64,
    /// Host unpin calls that failed.
    pub unpin_failures: u64,
    /// Pages with a refcount above zero.
    pub pinned_pages: usize,
    /// Entries currently stored in the table, empty ones included.
    pub live_entries: usize,
}

#[derive(Debug, Default)]
pub(crate) struct TableCounters {
    pin_calls: AtomicU64,
    unpin_calls: AtomicU64,
    pin_failures: AtomicU64,
    unpin_failures: AtomicU64,
    pinned_pages: AtomicUsize,
}

impl TableCounters {
    pub(crate) fn record_pin(&self) {
        self.pin_calls.fetch_add(1, Ordering::Relaxed);
        self.pinned_pages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pin_failure(&self) {
        self.pin_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a 1->0 transition and the outcome of its unpin call.
    pub(crate) fn record_unpin(&self, succeeded: bool) {
        self.pinned_pages.fetch_sub(1, Ordering::Relaxed);
        if succeeded {
            self.unpin_calls.fetch_add(1, Ordering::Relaxed);
        } else {
            self.unpin_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self, live_entries: usize) -> TableStats {
        TableStats {
            pin_calls: self.pin_calls.load(Ordering::Relaxed),
            unpin_calls: self.unpin_calls.load(Ordering::Relaxed),
            pin_failures: self.pin_failures.load(Ordering::Relaxed),
            unpin_failures: self.unpin_failures.load(Ordering::Relaxed),
            pinned_pages: self.pinned_pages.load(Ordering::Relaxed),
            live_entries,
        }
    }
}
