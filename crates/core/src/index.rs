//! Soup index specifications
//!
//! A [`SoupIndex`] names a field path inside the documents of a soup and the
//! type its values are indexed as. Every index type except `Json1` is
//! materialized as a physical column filled at write time; `Json1` indexes
//! are evaluated from the stored document instead.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Value type of a soup index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexType {
    /// Text column, compared lexically
    String,
    /// 64-bit integer column
    Integer,
    /// Double precision column
    Floating,
    /// Text column mirrored into the full-text table
    FullText,
    /// No column; evaluated with `json_extract` over the stored document
    Json1,
}

impl IndexType {
    /// All index types, in declaration order
    pub const ALL: [IndexType; 5] = [
        IndexType::String,
        IndexType::Integer,
        IndexType::Floating,
        IndexType::FullText,
        IndexType::Json1,
    ];

    /// Stable name used in the metadata tables
    pub const fn as_str(self) -> &'static str {
        match self {
            IndexType::String => "string",
            IndexType::Integer => "integer",
            IndexType::Floating => "floating",
            IndexType::FullText => "full_text",
            IndexType::Json1 => "json1",
        }
    }

    /// SQL column type, or `None` when the index has no column
    pub const fn column_type(self) -> Option<&'static str> {
        match self {
            IndexType::String | IndexType::FullText => Some("TEXT"),
            IndexType::Integer => Some("INTEGER"),
            IndexType::Floating => Some("REAL"),
            IndexType::Json1 => None,
        }
    }

    /// Whether values are written into a physical column
    pub const fn has_column(self) -> bool {
        !matches!(self, IndexType::Json1)
    }

    /// Whether values are mirrored into the full-text table
    pub const fn is_full_text(self) -> bool {
        matches!(self, IndexType::FullText)
    }
}

impl fmt::Display for IndexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IndexType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown index type '{}'", s))
    }
}

/// An index over one document path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SoupIndex {
    /// Dotted field path, e.g. `"address.city"`
    pub path: String,
    /// How values at the path are indexed
    #[serde(rename = "type")]
    pub index_type: IndexType,
}

impl SoupIndex {
    /// Create an index spec
    pub fn new(path: impl Into<String>, index_type: IndexType) -> Self {
        Self {
            path: path.into(),
            index_type,
        }
    }

    /// String index on `path`
    pub fn string(path: impl Into<String>) -> Self {
        Self::new(path, IndexType::String)
    }

    /// Integer index on `path`
    pub fn integer(path: impl Into<String>) -> Self {
        Self::new(path, IndexType::Integer)
    }

    /// Floating-point index on `path`
    pub fn floating(path: impl Into<String>) -> Self {
        Self::new(path, IndexType::Floating)
    }

    /// Full-text index on `path`
    pub fn full_text(path: impl Into<String>) -> Self {
        Self::new(path, IndexType::FullText)
    }

    /// JSON-path index on `path`
    pub fn json1(path: impl Into<String>) -> Self {
        Self::new(path, IndexType::Json1)
    }
}

impl fmt::Display for SoupIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path, self.index_type)
    }
}

/// Whether two index lists describe the same set of indexes
///
/// Order and duplicates are ignored.
pub fn same_index_set(a: &[SoupIndex], b: &[SoupIndex]) -> bool {
    let mut a: Vec<&SoupIndex> = a.iter().collect();
    let mut b: Vec<&SoupIndex> = b.iter().collect();
    a.sort();
    a.dedup();
    b.sort();
    b.dedup();
    a == b
}
