//! Per-page lock entry.
//!
//! ```text
//!            try_retain (CAS, count >= 1)
//!          ┌─────────────────────────────┐
//!          ▼                             │
//!   ┌────────────┐  pin + publish  ┌────────────┐
//!   │ count == 0 │ ──────────────► │ count >= 1 │
//!   │  unpinned  │ ◄────────────── │   pinned   │
//!   └────────────┘  1->0 + unpin   └────────────┘
//!         │        (under lock)          │
//!         │ retire                       │ try_release_shared (CAS, count >= 2)
//!         ▼                              └──────────────┐
//!   ┌────────────┐                                      ▼
//!   │  retired   │                               count - 1 (>= 1)
//!   └────────────┘
//! ```
//!
//! The count only crosses zero while the entry lock is held. Lock-free CAS
//! traffic moves it between positive values and never touches zero, so a
//! thread holding the lock at count zero sees it stay zero.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

/// Whether an entry is still reachable through the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EntryPhase {
    /// Mapped in the table.
    Live,
    /// Removed from the table. Never pinned again.
    Retired,
}

/// Refcount and transition lock for one page.
#[derive(Debug)]
pub(crate) struct PageLockEntry {
    /// Live allocations requiring the page pinned.
    refcount: AtomicUsize,
    /// Held across every 0->1 and 1->0 transition and the host call it makes.
    phase: Mutex<EntryPhase>,
}

impl PageLockEntry {
    /// Creates an unpinned entry with refcount zero.
    pub(crate) fn new() -> Self {
        Self {
            refcount: AtomicUsize::new(0),
            phase: Mutex::new(EntryPhase::Live),
        }
    }

    #[inline]
    pub(crate) fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Increments the refcount if the page is already pinned.
    ///
    /// Returns false when the count is zero; the caller must take the lock.
    #[inline]
    pub(crate) fn try_retain(&self) -> bool {
        let mut current = self.refcount.load(Ordering::Acquire);
        while current > 0 {
            match self.refcount.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Decrements the refcount if it stays at one or above.
    ///
    /// Returns false when this release could be the last; the caller must take the lock.
    #[inline]
    pub(crate) fn try_release_shared(&self) -> bool {
        let mut current = self.refcount.load(Ordering::Acquire);
        while current > 1 {
            match self.refcount.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Locks the entry for a transition.
    pub(crate) fn lock(&self) -> MutexGuard<'_, EntryPhase> {
        self.phase.lock()
    }

    /// Publishes the first reference after a successful pin.
    ///
    /// Must be called with the lock held and the count at zero.
    pub(crate) fn publish_pinned(&self, _guard: &MutexGuard<'_, EntryPhase>) {
        let previous = self.refcount.swap(1, Ordering::AcqRel);
        debug_assert_eq!(previous, 0, "page published twice");
    }

    /// Drops one reference with the lock held.
    ///
    /// Returns `None` if the count was already zero, otherwise whether this
    /// call performed the 1->0 transition.
    pub(crate) fn release_locked(&self, _guard: &MutexGuard<'_, EntryPhase>) -> Option<bool> {
        let mut current = self.refcount.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return None;
            }
            match self.refcount.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current == 1),
                Err(actual) => current = actual,
            }
        }
    }
}
