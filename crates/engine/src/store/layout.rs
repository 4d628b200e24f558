//! Physical layout of a soup
//!
//! A registered soup owns table `TABLE_<id>` with system columns `id`,
//! `soup`, `created`, `lastModified` and one column `TABLE_<id>_<ordinal>` per
//! index that has a column. Full-text indexes are mirrored into the FTS5
//! table `TABLE_<id>_fts` whose rowid is the entry id. Json-path indexes have
//! no column and are evaluated with `json_extract` over `soup`.

use rusqlite::types::Value as SqlValue;
use serde_json::Value;
use soupstore_core::path::{project, to_json_path};
use soupstore_core::{Error, IndexType, Result, SoupIndex, StorageMode, SystemPath};

/// One index and the column backing it
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct IndexColumn {
    pub index: SoupIndex,
    /// `None` for json-path indexes
    pub column: Option<String>,
}

/// Registered soup and its physical names
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SoupLayout {
    pub(crate) name: String,
    pub(crate) soup_id: i64,
    pub(crate) table: String,
    pub(crate) storage: StorageMode,
    pub(crate) columns: Vec<IndexColumn>,
}

/// A path resolved to a SQL expression
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResolvedPath {
    pub expr: String,
    /// Type used to bind comparison values
    pub bind_as: IndexType,
}

impl SoupLayout {
    /// Layout for a new registration with row id `soup_id`
    pub(crate) fn new(
        name: &str,
        soup_id: i64,
        storage: StorageMode,
        indexes: &[SoupIndex],
    ) -> Self {
        let table = Self::table_name(soup_id);
        let columns = indexes
            .iter()
            .enumerate()
            .map(|(ordinal, index)| IndexColumn {
                column: index
                    .index_type
                    .has_column()
                    .then(|| format!("{}_{}", table, ordinal)),
                index: index.clone(),
            })
            .collect();
        Self {
            name: name.to_string(),
            soup_id,
            table,
            storage,
            columns,
        }
    }

    /// Physical table of soup row `soup_id`
    pub(crate) fn table_name(soup_id: i64) -> String {
        format!("TABLE_{}", soup_id)
    }

    /// Soup name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Physical table name
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Storage mode
    pub fn storage(&self) -> StorageMode {
        self.storage
    }

    /// Index specs in declaration order
    pub fn indexes(&self) -> Vec<SoupIndex> {
        self.columns.iter().map(|c| c.index.clone()).collect()
    }

    pub(crate) fn fts_table(&self) -> String {
        format!("{}_fts", self.table)
    }

    pub(crate) fn is_external(&self) -> bool {
        self.storage == StorageMode::External
    }

    pub(crate) fn has_full_text(&self) -> bool {
        self.columns.iter().any(|c| c.index.index_type.is_full_text())
    }

    /// Full-text columns, in declaration order
    pub(crate) fn full_text_columns(&self) -> impl Iterator<Item = (&IndexColumn, &str)> {
        self.value_columns()
            .filter(|(c, _)| c.index.index_type.is_full_text())
    }

    /// Indexes that are backed by a physical column
    pub(crate) fn value_columns(&self) -> impl Iterator<Item = (&IndexColumn, &str)> {
        self.columns
            .iter()
            .filter_map(|c| c.column.as_deref().map(|name| (c, name)))
    }

    /// Index on `path` used for comparisons
    ///
    /// When a path carries several indexes, a non-full-text one wins.
    pub(crate) fn lookup(&self, path: &str) -> Option<&IndexColumn> {
        let mut candidates = self.columns.iter().filter(|c| c.index.path == path);
        let first = candidates.next()?;
        if !first.index.index_type.is_full_text() {
            return Some(first);
        }
        candidates
            .find(|c| !c.index.index_type.is_full_text())
            .or(Some(first))
    }

    /// Full-text index on `path`
    pub(crate) fn full_text_lookup(&self, path: &str) -> Option<&IndexColumn> {
        self.columns
            .iter()
            .find(|c| c.index.path == path && c.index.index_type.is_full_text())
    }

    /// Whether `path` carries any index
    pub(crate) fn is_indexed(&self, path: &str) -> bool {
        self.columns.iter().any(|c| c.index.path == path)
    }

    /// Resolve `path` to an orderable, comparable SQL expression
    ///
    /// `qualify` prefixes column references with the table name. The whole
    /// document (`_soup`) is not comparable and resolves to `PathNotIndexed`.
    pub(crate) fn resolve(&self, path: &str, qualify: bool) -> Result<ResolvedPath> {
        let prefix = if qualify {
            format!("{}.", self.table)
        } else {
            String::new()
        };
        if let Some(system) = SystemPath::parse(path) {
            if !system.is_orderable() {
                return Err(Error::path_not_indexed(&self.name, path));
            }
            return Ok(ResolvedPath {
                expr: format!("{}{}", prefix, system.column()),
                bind_as: IndexType::Integer,
            });
        }
        let index = self
            .lookup(path)
            .ok_or_else(|| Error::path_not_indexed(&self.name, path))?;
        let expr = match &index.column {
            Some(column) => format!("{}{}", prefix, column),
            None => json_extract_sql(&prefix, path),
        };
        Ok(ResolvedPath {
            expr,
            bind_as: index.index.index_type,
        })
    }
}

/// `json_extract` over the document column
pub(crate) fn json_extract_sql(prefix: &str, path: &str) -> String {
    format!("json_extract({}soup, '{}')", prefix, to_json_path(path))
}

/// Value written into the column of `index` for `doc`
pub(crate) fn column_value(index: &SoupIndex, doc: &Value) -> SqlValue {
    match project(doc, &index.path) {
        Some(v) => to_sql_value(index.index_type, &v),
        None => SqlValue::Null,
    }
}

/// Convert a JSON value for storage in, or comparison against, a column
pub(crate) fn to_sql_value(index_type: IndexType, value: &Value) -> SqlValue {
    match index_type {
        IndexType::String | IndexType::FullText => match value {
            Value::Null => SqlValue::Null,
            Value::String(s) => SqlValue::Text(s.clone()),
            Value::Bool(b) => SqlValue::Text(b.to_string()),
            Value::Number(n) => SqlValue::Text(n.to_string()),
            other => SqlValue::Text(other.to_string()),
        },
        IndexType::Integer => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map_or(SqlValue::Null, SqlValue::Integer),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
                    .map_or(SqlValue::Null, SqlValue::Integer)
            }
            Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
            _ => SqlValue::Null,
        },
        IndexType::Floating => match value {
            Value::Number(n) => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map_or(SqlValue::Null, SqlValue::Real),
            Value::Bool(b) => SqlValue::Real(if *b { 1.0 } else { 0.0 }),
            _ => SqlValue::Null,
        },
        // Mirrors what json_extract returns for each JSON type
        IndexType::Json1 => match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Integer(i),
                None => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
            },
            Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        },
    }
}

/// Convert a SQL value read from a result row into JSON
pub(crate) fn sql_to_json(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::from(i),
        SqlValue::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(b) => Value::String(String::from_utf8_lossy(&b).into_owned()),
    }
}
