//! Soup-level attributes

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where the document body of each entry lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Document stored in the soup table's `soup` column
    #[default]
    Internal,
    /// Document stored in a per-entry file keyed by entry id
    External,
}

impl StorageMode {
    /// Stable name used in the metadata tables
    pub const fn as_str(self) -> &'static str {
        match self {
            StorageMode::Internal => "internal",
            StorageMode::External => "external",
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "internal" => Ok(StorageMode::Internal),
            "external" => Ok(StorageMode::External),
            other => Err(format!("unknown storage mode '{}'", other)),
        }
    }
}

/// Name and storage mode of a soup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoupSpec {
    /// Soup name, unique within a store
    pub name: String,
    /// Storage mode for entry documents
    #[serde(default)]
    pub storage: StorageMode,
}

impl SoupSpec {
    /// Internally stored soup
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage: StorageMode::Internal,
        }
    }

    /// Externally stored soup
    pub fn external(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage: StorageMode::External,
        }
    }

    /// Whether entry documents live in per-entry files
    pub fn is_external(&self) -> bool {
        self.storage == StorageMode::External
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_mode_parses() {
        assert_eq!("external".parse::<StorageMode>().unwrap(), StorageMode::External);
        assert_eq!(StorageMode::default(), StorageMode::Internal);
        assert!("disk".parse::<StorageMode>().is_err());
    }

    #[test]
    fn spec_constructors() {
        assert!(!SoupSpec::new("a").is_external());
        assert!(SoupSpec::external("a").is_external());
    }
}
