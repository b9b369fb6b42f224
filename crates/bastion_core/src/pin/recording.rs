//! In-memory pinner for tests.
//!
//! Never touches the OS. Every call is recorded per page, overlapping or
//! doubled-up calls are flagged as violations, and pin/unpin failures can be
//! injected on chosen pages.

use std::collections::{HashMap, HashSet};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::PagePinner;
use crate::error::HostError;
use crate::page::{PageKey, PageSize};

/// Error code reported for injected failures (`ENOMEM`).
const INJECTED_CODE: i32 = 12;

/// Per-page call history.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PinRecord {
    /// Successful pin calls.
    pub pins: usize,
    /// Successful unpin calls.
    pub unpins: usize,
    /// Pin calls that failed (injected).
    pub failed_pins: usize,
    /// Unpin calls that failed (injected).
    pub failed_unpins: usize,
    /// Whether the page is currently pinned.
    pub pinned: bool,
}

/// A broken pin/unpin protocol observed by the recorder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PinViolation {
    /// A page was pinned while already pinned.
    DoublePin(PageKey),
    /// A page was unpinned while not pinned.
    UnpinWithoutPin(PageKey),
    /// Two calls for the same page were in flight at once.
    Overlapping(PageKey),
}

#[derive(Default)]
struct RecorderState {
    pages: HashMap<PageKey, PinRecord>,
    in_flight: HashSet<PageKey>,
    fail_pin: HashSet<PageKey>,
    fail_unpin: HashSet<PageKey>,
    violations: Vec<PinViolation>,
}

/// Test double implementing [`PagePinner`].
#[derive(Default)]
pub struct RecordingPinner {
    state: Mutex<RecorderState>,
    /// Time spent "inside" the host call, to widen race windows.
    delay: Option<Duration>,
}

#[derive(Clone, Copy)]
enum Call {
    Pin,
    Unpin,
}

impl RecordingPinner {
    /// Creates a recorder with no delay and no injected failures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a recorder that holds every call open for `delay`.
    #[must_use]
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            state: Mutex::default(),
            delay: Some(delay),
        }
    }

    /// Makes every future pin of `page` fail.
    pub fn fail_pin_on(&self, page: PageKey) {
        self.state.lock().fail_pin.insert(page);
    }

    /// Makes every future unpin of `page` fail.
    pub fn fail_unpin_on(&self, page: PageKey) {
        self.state.lock().fail_unpin.insert(page);
    }

    /// Removes all injected failures.
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.fail_pin.clear();
        state.fail_unpin.clear();
    }

    /// Returns the call history of `page`.
    #[must_use]
    pub fn record(&self, page: PageKey) -> PinRecord {
        self.state.lock().pages.get(&page).copied().unwrap_or_default()
    }

    /// Returns the number of successful pin calls for `page`.
    #[must_use]
    pub fn pins(&self, page: PageKey) -> usize {
        self.record(page).pins
    }

    /// Returns the number of successful unpin calls for `page`.
    #[must_use]
    pub fn unpins(&self, page: PageKey) -> usize {
        self.record(page).unpins
    }

    /// Returns whether `page` is currently pinned.
    #[must_use]
    pub fn is_pinned(&self, page: PageKey) -> bool {
        self.record(page).pinned
    }

    /// Returns the successful pin calls across all pages.
    #[must_use]
    pub fn total_pins(&self) -> usize {
        self.state.lock().pages.values().map(|r| r.pins).sum()
    }

    /// Returns the successful unpin calls across all pages.
    #[must_use]
    pub fn total_unpins(&self) -> usize {
        self.state.lock().pages.values().map(|r| r.unpins).sum()
    }

    /// Returns the pages currently pinned, ascending.
    #[must_use]
    pub fn pinned_pages(&self) -> Vec<PageKey> {
        let state = self.state.lock();
        let mut pages: Vec<_> = state
            .pages
            .iter()
            .filter(|(_, r)| r.pinned)
            .map(|(page, _)| *page)
            .collect();
        pages.sort_unstable();
        pages
    }

    /// Returns every protocol violation observed so far.
    #[must_use]
    pub fn violations(&self) -> Vec<PinViolation> {
        self.state.lock().violations.clone()
    }

    fn call(&self, page: PageKey, call: Call) -> Result<(), HostError> {
        {
            let mut state = self.state.lock();
            if !state.in_flight.insert(page) {
                state.violations.push(PinViolation::Overlapping(page));
            }
        }

        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }

        let mut state = self.state.lock();
        state.in_flight.remove(&page);

        let fail = match call {
            Call::Pin => state.fail_pin.contains(&page),
            Call::Unpin => state.fail_unpin.contains(&page),
        };
        let pinned = state.pages.get(&page).is_some_and(|r| r.pinned);

        if !fail {
            match (call, pinned) {
                (Call::Pin, true) => state.violations.push(PinViolation::DoublePin(page)),
                (Call::Unpin, false) => state.violations.push(PinViolation::UnpinWithoutPin(page)),
                _ => {}
            }
        }

        let record = state.pages.entry(page).or_default();
        match (call, fail) {
            (Call::Pin, false) => {
                record.pins += 1;
                record.pinned = true;
            }
            (Call::Unpin, false) => {
                record.unpins += 1;
                record.pinned = false;
            }
            (Call::Pin, true) => record.failed_pins += 1,
            // A failed unpin leaves the host-side pin in place.
            (Call::Unpin, true) => record.failed_unpins += 1,
        }

        if fail {
            Err(HostError::new(Some(INJECTED_CODE), "injected failure"))
        } else {
            Ok(())
        }
    }
}

impl PagePinner for RecordingPinner {
    fn pin(&self, page: PageKey, _page_size: PageSize) -> Result<(), HostError> {
        self.call(page, Call::Pin)
    }

    fn unpin(&self, page: PageKey, _page_size: PageSize) -> Result<(), HostError> {
        self.call(page, Call::Unpin)
    }
}
