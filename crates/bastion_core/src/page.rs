//! # Page Geometry
//!
//! Page size discovery, page keys and the page ranges spanned by an allocation.
//!
//! ```text
//!   page 0          page 1          page 2          page 3
//! |---------------|---------------|---------------|---------------|
//!         [ start ............................. start+len )
//!  ^ first key                                     ^ last key
//! ```
//!
//! A range always yields its keys in ascending address order. The page lock
//! table relies on that order to keep lock acquisition consistent between
//! overlapping multi-page requests.

use std::fmt;
use std::sync::OnceLock;

/// Size of a virtual-memory page in bytes.
///
/// Always a non-zero power of two.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PageSize(usize);

impl PageSize {
    /// Creates a page size, returning `None` unless `bytes` is a non-zero power of two.
    #[must_use]
    pub const fn new(bytes: usize) -> Option<Self> {
        if bytes.is_power_of_two() {
            Some(Self(bytes))
        } else {
            None
        }
    }

    /// Returns the host platform's page size.
    ///
    /// Queried once per process and cached afterwards.
    #[must_use]
    pub fn system() -> Self {
        static SYSTEM: OnceLock<PageSize> = OnceLock::new();
        *SYSTEM.get_or_init(|| {
            let bytes = region::page::size();
            // Every supported platform reports a power of two; fall back to 4K otherwise.
            Self::new(bytes).unwrap_or(Self(4096))
        })
    }

    /// Returns the size in bytes.
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> usize {
        self.0
    }

    /// Rounds `address` down to the start of its page.
    #[inline]
    #[must_use]
    pub const fn floor(self, address: usize) -> usize {
        address & !(self.0 - 1)
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes", self.0)
    }
}

/// Base address of a virtual-memory page.
///
/// Identifies a page within the lock table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageKey(usize);

impl PageKey {
    /// Returns the key of the page containing `address`.
    #[inline]
    #[must_use]
    pub const fn containing(address: usize, page_size: PageSize) -> Self {
        Self(page_size.floor(address))
    }

    /// Returns the page base address.
    #[inline]
    #[must_use]
    pub const fn address(self) -> usize {
        self.0
    }

    /// Returns the base address as a pointer, for handing to the host primitive.
    #[inline]
    #[must_use]
    pub fn as_ptr(self) -> *const u8 {
        self.0 as *const u8
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// The ascending, duplicate-free set of pages overlapping `[start, start+len)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRange {
    /// Key of the first page.
    first: PageKey,
    /// Exclusive end address of the byte range.
    end: usize,
    /// Page size used to step through the range.
    page_size: PageSize,
}

impl PageRange {
    /// Computes the pages spanned by `len` bytes starting at `start`.
    ///
    /// A zero-length range spans no pages.
    #[must_use]
    pub fn spanning(start: usize, len: usize, page_size: PageSize) -> Self {
        let first = PageKey::containing(start, page_size);
        // An empty range ends where it starts, at the page boundary.
        let end = if len == 0 { first.address() } else { start.saturating_add(len) };
        Self {
            first,
            end,
            page_size,
        }
    }

    /// Computes the pages spanned by a pointer and a byte length.
    #[must_use]
    pub fn of_ptr(ptr: *const u8, len: usize, page_size: PageSize) -> Self {
        Self::spanning(ptr as usize, len, page_size)
    }

    /// Returns the page size this range steps by.
    #[inline]
    #[must_use]
    pub const fn page_size(&self) -> PageSize {
        self.page_size
    }

    /// Returns the first page of the range, if it spans any.
    #[must_use]
    pub fn first(&self) -> Option<PageKey> {
        (!self.is_empty()).then_some(self.first)
    }

    /// Returns the number of pages in the range.
    #[must_use]
    pub fn len(&self) -> usize {
        let base = self.first.address();
        if self.end <= base {
            return 0;
        }
        (self.end - base).div_ceil(self.page_size.bytes())
    }

    /// Returns true if the range spans no pages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end <= self.first.address()
    }

    /// Returns true if `key` is one of the pages in the range.
    #[must_use]
    pub fn contains(&self, key: PageKey) -> bool {
        key.address() >= self.first.address()
            && key.address() < self.end
            && self.page_size.floor(key.address()) == key.address()
    }

    /// Iterates over the page keys in ascending order.
    #[must_use]
    pub fn iter(&self) -> PageIter {
        PageIter {
            next: (!self.is_empty()).then_some(self.first.address()),
            end: self.end,
            step: self.page_size.bytes(),
        }
    }
}

impl IntoIterator for PageRange {
    type Item = PageKey;
    type IntoIter = PageIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl IntoIterator for &PageRange {
    type Item = PageKey;
    type IntoIter = PageIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Ascending iterator over the keys of a [`PageRange`].
#[derive(Clone, Debug)]
pub struct PageIter {
    next: Option<usize>,
    end: usize,
    step: usize,
}

impl Iterator for PageIter {
    type Item = PageKey;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        if current >= self.end {
            self.next = None;
            return None;
        }
        self.next = current.checked_add(self.step);
        Some(PageKey(current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 4096;

    fn page_size() -> PageSize {
        PageSize::new(PAGE).unwrap()
    }

    fn keys(range: PageRange) -> Vec<usize> {
        range.iter().map(PageKey::address).collect()
    }

    #[test]
    fn test_page_size_must_be_power_of_two() {
        assert!(PageSize::new(0).is_none());
        assert!(PageSize::new(3000).is_none());
        assert_eq!(PageSize::new(PAGE).unwrap().bytes(), PAGE);
    }

    #[test]
    fn test_system_page_size_is_stable() {
        let first = PageSize::system();
        assert!(first.bytes().is_power_of_two());
        assert_eq!(first, PageSize::system());
    }

    #[test]
    fn test_key_rounds_down() {
        let key = PageKey::containing(3 * PAGE + 17, page_size());
        assert_eq!(key.address(), 3 * PAGE);
        assert_eq!(format!("{key}"), "0x3000");
    }

    #[test]
    fn test_aligned_single_byte_spans_one_page() {
        let range = PageRange::spanning(8 * PAGE, 1, page_size());
        assert_eq!(range.len(), 1);
        assert_eq!(keys(range), vec![8 * PAGE]);
    }

    #[test]
    fn test_full_page_mid_page_spans_two() {
        let range = PageRange::spanning(8 * PAGE + 100, PAGE, page_size());
        assert_eq!(range.len(), 2);
        assert_eq!(keys(range), vec![8 * PAGE, 9 * PAGE]);
    }

    #[test]
    fn test_full_page_aligned_spans_one() {
        let range = PageRange::spanning(8 * PAGE, PAGE, page_size());
        assert_eq!(range.len(), 1);
    }

    #[test]
    fn test_straddling_boundary_spans_two() {
        let range = PageRange::spanning(9 * PAGE - 1, 2, page_size());
        assert_eq!(keys(range), vec![8 * PAGE, 9 * PAGE]);
    }

    #[test]
    fn test_ten_thousand_bytes_span_three_pages() {
        let range = PageRange::spanning(16 * PAGE, 10_000, page_size());
        assert_eq!(range.len(), 3);
        assert_eq!(keys(range), vec![16 * PAGE, 17 * PAGE, 18 * PAGE]);
    }

    #[test]
    fn test_empty_range() {
        let range = PageRange::spanning(5 * PAGE + 3, 0, page_size());
        assert!(range.is_empty());
        assert_eq!(range.len(), 0);
        assert!(range.first().is_none());
        assert_eq!(range.iter().count(), 0);
        assert!(!range.contains(PageKey::containing(5 * PAGE, page_size())));
    }

    #[test]
    fn test_keys_ascend_without_duplicates() {
        let range = PageRange::spanning(PAGE / 2, 7 * PAGE, page_size());
        let keys = keys(range);
        assert_eq!(keys.len(), range.len());
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_contains() {
        let range = PageRange::spanning(2 * PAGE + 5, PAGE, page_size());
        assert!(range.contains(PageKey::containing(2 * PAGE, page_size())));
        assert!(range.contains(PageKey::containing(3 * PAGE, page_size())));
        assert!(!range.contains(PageKey::containing(4 * PAGE, page_size())));
    }

    #[test]
    fn test_top_of_address_space_terminates() {
        let start = usize::MAX - PAGE / 2;
        let range = PageRange::spanning(start, 16, page_size());
        assert_eq!(range.iter().count(), 1);
    }
}
