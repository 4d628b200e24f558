//! Store configuration via `soupstore.toml`
//!
//! On first use a default `soupstore.toml` is written to the manager's root
//! directory. To change settings, edit the file and restart, or pass a config
//! to the builder (which writes it back so restarts pick it up).

use serde::{Deserialize, Serialize};
use soupstore_core::{Error, Result};
use std::path::Path;

/// Config file name placed in the manager's root directory.
pub const CONFIG_FILE_NAME: &str = "soupstore.toml";

/// SQLite journal mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalMode {
    /// Write-ahead log
    #[default]
    Wal,
    /// Rollback journal, deleted after each transaction
    Delete,
}

impl JournalMode {
    /// Pragma value
    pub fn as_str(self) -> &'static str {
        match self {
            JournalMode::Wal => "WAL",
            JournalMode::Delete => "DELETE",
        }
    }
}

/// SQLite synchronous level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynchronousMode {
    /// fsync on every commit
    #[default]
    Full,
    /// fsync at checkpoints only (WAL), may lose the last commits on power loss
    Normal,
}

impl SynchronousMode {
    /// Pragma value
    pub fn as_str(self) -> &'static str {
        match self {
            SynchronousMode::Full => "FULL",
            SynchronousMode::Normal => "NORMAL",
        }
    }
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_smart_sql_cache_size() -> usize {
    100
}

/// Store configuration loaded from `soupstore.toml`.
///
/// # Example
///
/// ```toml
/// journal_mode = "wal"
/// synchronous = "full"
/// busy_timeout_ms = 5000
/// smart_sql_cache_size = 100
/// verify_external_entries = false
/// capture_explain_query_plan = false
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Journal mode of every container.
    #[serde(default)]
    pub journal_mode: JournalMode,
    /// Synchronous level of every container.
    #[serde(default)]
    pub synchronous: SynchronousMode,
    /// How long a statement waits on a locked container, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Number of converted smart-SQL statements kept per store.
    #[serde(default = "default_smart_sql_cache_size")]
    pub smart_sql_cache_size: usize,
    /// Read back each external entry file after writing it.
    #[serde(default)]
    pub verify_external_entries: bool,
    /// Initial value of the explain-query-plan capture toggle.
    #[serde(default)]
    pub capture_explain_query_plan: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            journal_mode: JournalMode::default(),
            synchronous: SynchronousMode::default(),
            busy_timeout_ms: default_busy_timeout_ms(),
            smart_sql_cache_size: default_smart_sql_cache_size(),
            verify_external_entries: false,
            capture_explain_query_plan: false,
        }
    }
}

impl StoreConfig {
    /// Check values that serde cannot
    pub fn validate(&self) -> Result<()> {
        if self.smart_sql_cache_size == 0 {
            return Err(Error::invalid_argument(
                "smart_sql_cache_size in soupstore.toml must be positive",
            ));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Soupstore configuration
#
# Journal mode: "wal" (default) or "delete"
journal_mode = "wal"

# Synchronous level: "full" (default) or "normal"
#   "full"   = fsync every commit
#   "normal" = fsync at checkpoints, last commits may be lost on power loss
synchronous = "full"

# How long a statement waits on a locked container (milliseconds)
busy_timeout_ms = 5000

# Converted smart-SQL statements kept per store
smart_sql_cache_size = 100

# Read back each external entry file after writing it (default: false)
verify_external_entries = false

# Capture EXPLAIN QUERY PLAN for every query (default: false)
capture_explain_query_plan = false
"#
    }

    /// Read and parse config from a file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::storage(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: StoreConfig = toml::from_str(&content).map_err(|e| {
            Error::invalid_argument(format!(
                "failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::storage(format!(
                    "failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            Error::storage(format!(
                "failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_toml_parses_to_default() {
        let parsed: StoreConfig = toml::from_str(StoreConfig::default_toml()).unwrap();
        assert_eq!(parsed, StoreConfig::default());
    }

    #[test]
    fn write_default_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        StoreConfig::write_default_if_missing(&path).unwrap();
        assert_eq!(StoreConfig::from_file(&path).unwrap(), StoreConfig::default());
    }

    #[test]
    fn write_default_keeps_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "journal_mode = \"delete\"\n").unwrap();
        StoreConfig::write_default_if_missing(&path).unwrap();
        let cfg = StoreConfig::from_file(&path).unwrap();
        assert_eq!(cfg.journal_mode, JournalMode::Delete);
        assert_eq!(cfg.busy_timeout_ms, 5000);
    }

    #[test]
    fn round_trip_custom_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let cfg = StoreConfig {
            synchronous: SynchronousMode::Normal,
            verify_external_entries: true,
            ..StoreConfig::default()
        };
        cfg.write_to_file(&path).unwrap();
        assert_eq!(StoreConfig::from_file(&path).unwrap(), cfg);
    }

    #[test]
    fn invalid_mode_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "journal_mode = \"memory\"\n").unwrap();
        assert!(matches!(
            StoreConfig::from_file(&path),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn zero_cache_size_is_rejected() {
        let cfg = StoreConfig {
            smart_sql_cache_size: 0,
            ..StoreConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
