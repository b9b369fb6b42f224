//! # Page Table Configuration
//!
//! Loaded once at startup, usually as the `[table]` section of the BASTION
//! config file.
//!
//! ```toml
//! reclaim_empty_entries = true
//! shard_count = 64
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Tuning for a [`PageLockTable`](crate::PageLockTable).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TableConfig {
    /// Remove an entry from the table once its refcount returns to zero.
    ///
    /// Keeping empty entries saves an insert on the next pin of the same page
    /// at the cost of a table that grows with every page ever pinned.
    pub reclaim_empty_entries: bool,
    /// Number of map shards. Must be a power of two greater than one.
    /// `None` lets the map pick from the available parallelism.
    pub shard_count: Option<usize>,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            reclaim_empty_entries: true,
            shard_count: None,
        }
    }
}

impl TableConfig {
    /// Config that keeps empty entries around for reuse.
    #[must_use]
    pub fn retaining() -> Self {
        Self {
            reclaim_empty_entries: false,
            ..Self::default()
        }
    }

    /// Parses a config from TOML text and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`TableConfig::from_toml_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `shard_count` is not a power of two
    /// greater than one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(shards) = self.shard_count {
            if shards < 2 || !shards.is_power_of_two() {
                return Err(ConfigError::Invalid(format!(
                    "shard_count must be a power of two greater than 1, got {shards}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TableConfig::from_toml_str("").unwrap();
        assert_eq!(config, TableConfig::default());
        assert!(config.reclaim_empty_entries);
    }

    #[test]
    fn test_parse() {
        let config = TableConfig::from_toml_str(
            "reclaim_empty_entries = false\nshard_count = 16\n",
        )
        .unwrap();
        assert!(!config.reclaim_empty_entries);
        assert_eq!(config.shard_count, Some(16));
    }

    #[test]
    fn test_rejects_bad_shard_count() {
        let err = TableConfig::from_toml_str("shard_count = 12").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = TableConfig::from_toml_str("shard_count = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let err = TableConfig::from_toml_str("reclaim = true").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = TableConfig::from_file("/nonexistent/bastion.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
