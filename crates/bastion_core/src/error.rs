//! # Page Lock Error Types
//!
//! All errors that can occur while pinning, unpinning or configuring the page table.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::page::PageKey;

/// Failure reported by the host page-pinning primitive.
///
/// The platform code is carried for diagnostics only. The table never
/// interprets it beyond success or failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostError {
    /// Platform error code (`errno` / `GetLastError`), if one was reported.
    pub code: Option<i32>,
    /// Human readable description.
    pub message: String,
}

impl HostError {
    /// Creates a host error from a platform code and description.
    #[must_use]
    pub fn new(code: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Creates a host error carrying only a platform code.
    #[must_use]
    pub fn from_code(code: i32) -> Self {
        Self::new(Some(code), std::io::Error::from_raw_os_error(code).to_string())
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {code:#x})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for HostError {}

/// Errors that can occur in the page lock table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PageLockError {
    /// The host refused to pin a page. The whole acquire was rolled back.
    #[error("failed to pin page {address}: {source}")]
    PinFailure {
        /// The page that could not be pinned.
        address: PageKey,
        /// The host failure.
        source: HostError,
    },

    /// The host refused to unpin a page. The refcount was still released.
    #[error("failed to unpin page {address}: {source}")]
    UnpinFailure {
        /// The page that could not be unpinned.
        address: PageKey,
        /// The host failure.
        source: HostError,
    },

    /// A page being released has no live entry, or its refcount is already zero.
    ///
    /// Only reachable through a contract violation (mismatched sizes, double
    /// release) or table corruption.
    #[error("page {address} is not pinned by this table; lock table state is inconsistent")]
    ConsistencyFault {
        /// The page whose entry was missing.
        address: PageKey,
    },
}

impl PageLockError {
    /// Returns the page the error refers to.
    #[must_use]
    pub fn address(&self) -> PageKey {
        match self {
            Self::PinFailure { address, .. }
            | Self::UnpinFailure { address, .. }
            | Self::ConsistencyFault { address } => *address,
        }
    }

    /// Returns true for errors that indicate a violated table invariant.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConsistencyFault { .. })
    }
}

/// Result type for page lock operations.
pub type PageLockResult<T> = Result<T, PageLockError>;

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// File that was being read.
        path: PathBuf,
        /// Underlying IO failure.
        source: std::io::Error,
    },

    /// The configuration is not valid TOML for the expected schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of its permitted range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
