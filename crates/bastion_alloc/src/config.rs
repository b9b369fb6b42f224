//! # BASTION Configuration
//!
//! One TOML file, loaded once at startup.
//!
//! ```toml
//! [table]
//! reclaim_empty_entries = true
//! shard_count = 64
//!
//! [allocator]
//! default_alignment = 16
//! ```

use std::path::Path;

use bastion_core::{ConfigError, TableConfig};
use serde::{Deserialize, Serialize};

/// Alignment matching what `malloc` guarantees on 64-bit targets.
pub const DEFAULT_ALIGNMENT: usize = 16;

/// Allocator tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllocatorConfig {
    /// Alignment used by `allocate` when the caller does not pass one.
    pub default_alignment: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            default_alignment: DEFAULT_ALIGNMENT,
        }
    }
}

impl AllocatorConfig {
    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the alignment is not a power of two.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.default_alignment.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "default_alignment must be a power of two, got {}",
                self.default_alignment
            )));
        }
        Ok(())
    }
}

/// Top-level configuration file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BastionConfig {
    /// Page lock table section.
    pub table: TableConfig,
    /// Allocator section.
    pub allocator: AllocatorConfig,
}

impl BastionConfig {
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
    /// [`BastionConfig::from_toml_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns the first section error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.table.validate()?;
        self.allocator.validate()
    }
}
