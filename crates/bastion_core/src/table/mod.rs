//! # Page Lock Table
//!
//! Reference-counted registry of pinned pages shared by every allocator in
//! the process.
//!
//! ## Architecture
//!
//! ```text
//!   allocate A ──┐                          ┌──► pin(page)   (0 -> 1 only)
//!   allocate B ──┼──► acquire(range) ──┐    │
//!   free A     ──┘    release(range) ──┼────┤
//!                                      ▼    └──► unpin(page) (1 -> 0 only)
//!                  ┌───────────────────────────────┐
//!                  │ DashMap<PageKey, Arc<Entry>>  │  insert-if-absent / remove-if
//!                  │   Entry { refcount, lock }    │  CAS for count >= 1
//!                  └───────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **One host call per transition**: pin runs only on 0->1, unpin only on
//!    1->0, both under the page's entry lock
//! 2. **No global serialization**: only requests touching the same page
//!    contend, and only on transitions
//! 3. **All-or-nothing acquire**: a failed pin rolls back every page the
//!    request already acquired
//!
//! Pages of a request are walked in ascending address order and at most one
//! entry lock is held at a time.

mod entry;
mod stats;

pub use stats::TableStats;

use std::sync::Arc;
use std::thread;

use dashmap::DashMap;
use parking_lot::MutexGuard;

use crate::config::TableConfig;
use crate::error::{ConfigError, PageLockError, PageLockResult};
use crate::page::{PageKey, PageRange, PageSize};
use crate::pin::{OsPagePinner, PagePinner};
use entry::{EntryPhase, PageLockEntry};
use stats::TableCounters;

/// Tracing target for pin/unpin events.
const PIN_TARGET: &str = "bastion::pin";

/// Process-wide registry of pinned pages.
///
/// Construct once at startup and share it by `Arc` with every allocator.
///
/// # Example
///
/// ```rust,ignore
/// let table = Arc::new(PageLockTable::new(TableConfig::default())?);
/// let pages = table.range_of(ptr, len);
///
/// table.acquire(pages)?;   // every page in range is now pinned
/// // ...
/// table.release(pages)?;   // pages nobody else needs are unpinned
/// ```
pub struct PageLockTable {
    /// One entry per page that is pinned (or was, when entries are retained).
    entries: DashMap<PageKey, Arc<PageLockEntry>>,
    /// Host pin/unpin primitive.
    pinner: Arc<dyn PagePinner>,
    /// Page size every range must be built with.
    page_size: PageSize,
    config: TableConfig,
    counters: TableCounters,
}

impl PageLockTable {
    /// Creates a table pinning through the OS, using the system page size.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the config fails validation.
    pub fn new(config: TableConfig) -> Result<Self, ConfigError> {
        Self::with_pinner(Arc::new(OsPagePinner::new()), PageSize::system(), config)
    }

    /// Creates a table with an explicit pin primitive and page size.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the config fails validation.
    pub fn with_pinner(
        pinner: Arc<dyn PagePinner>,
        page_size: PageSize,
        config: TableConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let entries = match config.shard_count {
            Some(shards) => DashMap::with_shard_amount(shards),
            None => DashMap::new(),
        };

        Ok(Self {
            entries,
            pinner,
            page_size,
            config,
            counters: TableCounters::default(),
        })
    }

    /// Returns the page size of this table.
    #[inline]
    #[must_use]
    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    /// Returns the config the table was built with.
    #[must_use]
    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    /// Computes the pages spanned by `len` bytes at `ptr`.
    #[must_use]
    pub fn range_of(&self, ptr: *const u8, len: usize) -> PageRange {
        PageRange::of_ptr(ptr, len, self.page_size)
    }

    /// Ensures every page in `pages` is pinned, taking one reference on each.
    ///
    /// # Errors
    ///
    /// Returns [`PageLockError::PinFailure`] if the host refuses a pin. Every
    /// reference taken by this call has been dropped again by then, and pages
    /// that went back to zero were unpinned.
    pub fn acquire(&self, pages: PageRange) -> PageLockResult<()> {
        debug_assert_eq!(pages.page_size(), self.page_size, "range built with a foreign page size");

        for (acquired, page) in pages.iter().enumerate() {
            if let Err(err) = self.acquire_page(page) {
                self.roll_back(pages, acquired);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Drops one reference on every page in `pages`, unpinning those that reach zero.
    ///
    /// Unpin failures do not stop the walk; every page is still released.
    ///
    /// # Errors
    ///
    /// - [`PageLockError::ConsistencyFault`] if a page has no reference to drop.
    ///   The walk stops at that page.
    /// - [`PageLockError::UnpinFailure`] for the first page the host refused
    ///   to unpin.
    pub fn release(&self, pages: PageRange) -> PageLockResult<()> {
        debug_assert_eq!(pages.page_size(), self.page_size, "range built with a foreign page size");

        let mut first_failure = None;
        for page in &pages {
            match self.release_page(page) {
                Ok(()) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    first_failure.get_or_insert(err);
                }
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    /// Returns the refcount of `page`, or `None` if the table has no entry for it.
    #[must_use]
    pub fn refcount(&self, page: PageKey) -> Option<usize> {
        self.lookup(page).map(|entry| entry.refcount())
    }

    /// Returns whether the table currently holds `page` pinned.
    #[must_use]
    pub fn is_pinned(&self, page: PageKey) -> bool {
        self.refcount(page).is_some_and(|count| count > 0)
    }

    /// Returns the number of entries in the table, empty ones included.
    #[must_use]
    pub fn tracked_pages(&self) -> usize {
        self.entries.len()
    }

    /// Returns `(page, refcount)` for every entry, ascending by page.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(PageKey, usize)> {
        let mut pages: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (*entry.key(), entry.value().refcount()))
            .collect();
        pages.sort_unstable_by_key(|(page, _)| *page);
        pages
    }

    /// Returns activity counters.
    #[must_use]
    pub fn stats(&self) -> TableStats {
        self.counters.snapshot(self.entries.len())
    }

    fn lookup(&self, page: PageKey) -> Option<Arc<PageLockEntry>> {
        self.entries.get(&page).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns the live entry for `page`, inserting an empty one if absent.
    fn entry_for(&self, page: PageKey) -> Arc<PageLockEntry> {
        if let Some(entry) = self.lookup(page) {
            return entry;
        }
        let entry = self
            .entries
            .entry(page)
            .or_insert_with(|| Arc::new(PageLockEntry::new()));
        Arc::clone(entry.value())
    }

    fn acquire_page(&self, page: PageKey) -> PageLockResult<()> {
        loop {
            let entry = self.entry_for(page);
            if entry.try_retain() {
                return Ok(());
            }

            let mut phase = entry.lock();
            if *phase == EntryPhase::Retired {
                // Removed between lookup and lock; a fresh entry takes its place.
                continue;
            }
            // Another acquirer may have pinned it while we waited.
            if entry.try_retain() {
                return Ok(());
            }

            // Count is zero and stays zero while we hold the lock.
            return match self.pinner.pin(page, self.page_size) {
                Ok(()) => {
                    entry.publish_pinned(&phase);
                    self.counters.record_pin();
                    tracing::trace!(
                        target: PIN_TARGET,
                        event = "pin",
                        page = %page,
                        thread = ?thread::current().id(),
                        "page pinned"
                    );
                    Ok(())
                }
                Err(source) => {
                    self.counters.record_pin_failure();
                    tracing::warn!(
                        target: PIN_TARGET,
                        event = "pin-failed",
                        page = %page,
                        thread = ?thread::current().id(),
                        error = %source,
                        "failed to pin page"
                    );
                    self.retire_if_empty(page, &entry, &mut phase);
                    Err(PageLockError::PinFailure { address: page, source })
                }
            };
        }
    }

    fn release_page(&self, page: PageKey) -> PageLockResult<()> {
        let Some(entry) = self.lookup(page) else {
            return Err(self.consistency_fault(page));
        };
        if entry.try_release_shared() {
            return Ok(());
        }

        let mut phase = entry.lock();
        if *phase == EntryPhase::Retired {
            return Err(self.consistency_fault(page));
        }

        match entry.release_locked(&phase) {
            None => Err(self.consistency_fault(page)),
            Some(false) => Ok(()),
            Some(true) => {
                let result = match self.pinner.unpin(page, self.page_size) {
                    Ok(()) => {
                        self.counters.record_unpin(true);
                        tracing::trace!(
                            target: PIN_TARGET,
                            event = "unpin",
                            page = %page,
                            thread = ?thread::current().id(),
                            "page unpinned"
                        );
                        Ok(())
                    }
                    Err(source) => {
                        self.counters.record_unpin(false);
                        tracing::warn!(
                            target: PIN_TARGET,
                            event = "unpin-failed",
                            page = %page,
                            thread = ?thread::current().id(),
                            error = %source,
                            "failed to unpin page"
                        );
                        Err(PageLockError::UnpinFailure { address: page, source })
                    }
                };
                self.retire_if_empty(page, &entry, &mut phase);
                result
            }
        }
    }

    /// Releases the first `acquired` pages of a request whose acquire failed.
    fn roll_back(&self, pages: PageRange, acquired: usize) {
        for page in pages.iter().take(acquired) {
            if let Err(err) = self.release_page(page) {
                tracing::warn!(
                    target: PIN_TARGET,
                    page = %page,
                    error = %err,
                    "rollback could not release page"
                );
            }
        }
    }

    /// Removes an empty entry from the table, with its lock held.
    fn retire_if_empty(
        &self,
        page: PageKey,
        entry: &Arc<PageLockEntry>,
        phase: &mut MutexGuard<'_, EntryPhase>,
    ) {
        if !self.config.reclaim_empty_entries || entry.refcount() != 0 {
            return;
        }
        self.entries.remove_if(&page, |_, current| Arc::ptr_eq(current, entry));
        **phase = EntryPhase::Retired;
    }

    fn consistency_fault(&self, page: PageKey) -> PageLockError {
        tracing::error!(
            target: PIN_TARGET,
            page = %page,
            thread = ?thread::current().id(),
            tracked = self.entries.len(),
            "release of a page the table does not hold pinned"
        );
        PageLockError::ConsistencyFault { address: page }
    }
}
