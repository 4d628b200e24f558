//! Declarative query specifications
//!
//! A [`QuerySpec`] describes what to read from one soup; it never mutates
//! state. Each kind derives its predicate from a single indexed path, except
//! [`QueryKind::Smart`], which carries caller-written SQL with `{soup}` and
//! `{soup:path}` references and is the only kind that accepts bind arguments.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default number of results per page
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Smallest first
    #[default]
    Ascending,
    /// Largest first
    Descending,
}

impl SortOrder {
    /// SQL keyword
    pub const fn as_sql(self) -> &'static str {
        match self {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        }
    }
}

/// What a query selects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryKind {
    /// Every entry
    All,
    /// Entries whose value at `path` equals `key`
    Exact {
        /// Indexed path
        path: String,
        /// Value to match
        key: Value,
    },
    /// Entries whose value at `path` lies within the bounds (inclusive)
    Range {
        /// Indexed path
        path: String,
        /// Lower bound, open when `None`
        begin: Option<Value>,
        /// Upper bound, open when `None`
        end: Option<Value>,
    },
    /// Entries whose value at `path` matches a SQL `LIKE` pattern
    Like {
        /// Indexed path
        path: String,
        /// Pattern, used as given (`%` and `_` are wildcards)
        pattern: String,
    },
    /// Full-text match
    Match {
        /// Full-text indexed path; `None` searches every full-text column
        path: Option<String>,
        /// FTS5 query text
        key: String,
    },
    /// Caller-written SQL with logical soup and path references
    Smart {
        /// SQL text, e.g. `SELECT {c:name} FROM {c} WHERE {c:age} > ?`
        sql: String,
    },
}

impl QueryKind {
    /// Path the predicate is built on, if any
    pub fn path(&self) -> Option<&str> {
        match self {
            QueryKind::Exact { path, .. }
            | QueryKind::Range { path, .. }
            | QueryKind::Like { path, .. } => Some(path),
            QueryKind::Match { path, .. } => path.as_deref(),
            QueryKind::All | QueryKind::Smart { .. } => None,
        }
    }

    /// Short kind name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            QueryKind::All => "all",
            QueryKind::Exact { .. } => "exact",
            QueryKind::Range { .. } => "range",
            QueryKind::Like { .. } => "like",
            QueryKind::Match { .. } => "match",
            QueryKind::Smart { .. } => "smart",
        }
    }
}

/// A declarative query against one soup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    /// Target soup; `None` only for smart queries
    pub soup_name: Option<String>,
    /// Predicate
    pub kind: QueryKind,
    /// Ordering path; entry id when `None`
    pub order_path: Option<String>,
    /// Ordering direction
    #[serde(default)]
    pub order: SortOrder,
    /// Results per page, must be positive
    pub page_size: usize,
    /// Paths to project instead of returning whole documents
    #[serde(default)]
    pub select_paths: Vec<String>,
}

impl QuerySpec {
    fn for_soup(soup: impl Into<String>, kind: QueryKind, page_size: usize) -> Self {
        Self {
            soup_name: Some(soup.into()),
            kind,
            order_path: None,
            order: SortOrder::Ascending,
            page_size,
            select_paths: Vec::new(),
        }
    }

    /// All entries of `soup`
    pub fn all(soup: impl Into<String>, page_size: usize) -> Self {
        Self::for_soup(soup, QueryKind::All, page_size)
    }

    /// Entries whose `path` equals `key`
    pub fn exact(
        soup: impl Into<String>,
        path: impl Into<String>,
        key: impl Into<Value>,
        page_size: usize,
    ) -> Self {
        let path = path.into();
        let mut spec = Self::for_soup(
            soup,
            QueryKind::Exact {
                path: path.clone(),
                key: key.into(),
            },
            page_size,
        );
        spec.order_path = Some(path);
        spec
    }

    /// Entries whose `path` is within `[begin, end]`
    pub fn range(
        soup: impl Into<String>,
        path: impl Into<String>,
        begin: Option<Value>,
        end: Option<Value>,
        page_size: usize,
    ) -> Self {
        let path = path.into();
        let mut spec = Self::for_soup(
            soup,
            QueryKind::Range {
                path: path.clone(),
                begin,
                end,
            },
            page_size,
        );
        spec.order_path = Some(path);
        spec
    }

    /// Entries whose `path` matches the `LIKE` pattern
    pub fn like(
        soup: impl Into<String>,
        path: impl Into<String>,
        pattern: impl Into<String>,
        page_size: usize,
    ) -> Self {
        let path = path.into();
        let mut spec = Self::for_soup(
            soup,
            QueryKind::Like {
                path: path.clone(),
                pattern: pattern.into(),
            },
            page_size,
        );
        spec.order_path = Some(path);
        spec
    }

    /// Full-text match on `path`, or on every full-text column when `None`
    pub fn full_text(
        soup: impl Into<String>,
        path: Option<String>,
        key: impl Into<String>,
        page_size: usize,
    ) -> Self {
        Self::for_soup(
            soup,
            QueryKind::Match {
                path,
                key: key.into(),
            },
            page_size,
        )
    }

    /// Smart SQL query
    pub fn smart(sql: impl Into<String>, page_size: usize) -> Self {
        Self {
            soup_name: None,
            kind: QueryKind::Smart { sql: sql.into() },
            order_path: None,
            order: SortOrder::Ascending,
            page_size,
            select_paths: Vec::new(),
        }
    }

    /// Order by `path` in `order`
    pub fn order_by(mut self, path: impl Into<String>, order: SortOrder) -> Self {
        self.order_path = Some(path.into());
        self.order = order;
        self
    }

    /// Project `paths` out of each result
    pub fn select<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Whether this is a smart query
    pub fn is_smart(&self) -> bool {
        matches!(self.kind, QueryKind::Smart { .. })
    }

    /// Check shape constraints that do not depend on a soup's layout
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::invalid_argument("page size must be positive"));
        }
        if self.is_smart() {
            if !self.select_paths.is_empty() {
                return Err(Error::unsupported(
                    "select paths are not supported on smart queries",
                ));
            }
        } else if self.soup_name.as_deref().map_or(true, str::is_empty) {
            return Err(Error::invalid_argument(format!(
                "{} query requires a soup name",
                self.kind.name()
            )));
        }
        Ok(())
    }

    /// Row offset of `page_index`
    pub fn offset(&self, page_index: usize) -> usize {
        page_index.saturating_mul(self.page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exact_orders_by_its_path() {
        let spec = QuerySpec::exact("contacts", "name", "Ann", 10);
        assert_eq!(spec.order_path.as_deref(), Some("name"));
        assert_eq!(spec.kind.path(), Some("name"));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let spec = QuerySpec::all("contacts", 0);
        assert!(matches!(spec.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn non_smart_needs_soup() {
        let mut spec = QuerySpec::all("contacts", 5);
        spec.soup_name = None;
        assert!(spec.validate().is_err());
        assert!(QuerySpec::smart("SELECT 1", 5).validate().is_ok());
    }

    #[test]
    fn builders_compose() {
        let spec = QuerySpec::range("c", "age", Some(json!(18)), None, 20)
            .order_by("name", SortOrder::Descending)
            .select(["name", "age"]);
        assert_eq!(spec.order, SortOrder::Descending);
        assert_eq!(spec.select_paths, vec!["name", "age"]);
        assert_eq!(spec.offset(3), 60);
    }

    #[test]
    fn kind_serializes_tagged() {
        let kind = QueryKind::Like {
            path: "name".into(),
            pattern: "An%".into(),
        };
        let v = serde_json::to_value(&kind).unwrap();
        assert_eq!(v["kind"], "like");
    }
}
