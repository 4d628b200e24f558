//! Entry system fields
//!
//! Every stored document carries its identity and timestamps as ordinary
//! fields so callers see them on retrieve without a side channel.
//! Timestamps are milliseconds since the Unix epoch.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

/// Entry id field
pub const SOUP_ENTRY_ID: &str = "_soupEntryId";
/// Creation timestamp field
pub const SOUP_CREATED_DATE: &str = "_soupCreatedDate";
/// Last-modification timestamp field
pub const SOUP_LAST_MODIFIED_DATE: &str = "_soupLastModifiedDate";
/// Smart-SQL reference to the whole stored document
pub const SOUP_PATH: &str = "_soup";
/// Dirty flag written by the sync layer
pub const LOCAL_FLAG: &str = "__local__";

/// Paths that refer to system columns rather than index columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemPath {
    /// `_soupEntryId`, the `id` column
    EntryId,
    /// `_soupCreatedDate`, the `created` column
    Created,
    /// `_soupLastModifiedDate`, the `lastModified` column
    LastModified,
    /// `_soup`, the document column
    Soup,
}

impl SystemPath {
    /// Resolve a path to a system path, if it is one
    pub fn parse(path: &str) -> Option<Self> {
        match path {
            SOUP_ENTRY_ID => Some(SystemPath::EntryId),
            SOUP_CREATED_DATE => Some(SystemPath::Created),
            SOUP_LAST_MODIFIED_DATE => Some(SystemPath::LastModified),
            SOUP_PATH => Some(SystemPath::Soup),
            _ => None,
        }
    }

    /// Physical column name in a soup table
    pub const fn column(self) -> &'static str {
        match self {
            SystemPath::EntryId => "id",
            SystemPath::Created => "created",
            SystemPath::LastModified => "lastModified",
            SystemPath::Soup => "soup",
        }
    }

    /// Whether the column is usable for ordering and comparisons
    pub const fn is_orderable(self) -> bool {
        !matches!(self, SystemPath::Soup)
    }
}

/// Entry id of a document, if it carries one
pub fn entry_id(doc: &Value) -> Option<i64> {
    doc.get(SOUP_ENTRY_ID).and_then(as_i64_lenient)
}

/// Created timestamp of a document, if it carries one
pub fn created(doc: &Value) -> Option<i64> {
    doc.get(SOUP_CREATED_DATE).and_then(as_i64_lenient)
}

/// Last-modified timestamp of a document, if it carries one
pub fn last_modified(doc: &Value) -> Option<i64> {
    doc.get(SOUP_LAST_MODIFIED_DATE).and_then(as_i64_lenient)
}

/// Stamp id and timestamps onto a document
pub fn stamp(doc: &mut Map<String, Value>, id: i64, created: i64, last_modified: i64) {
    doc.insert(SOUP_ENTRY_ID.to_string(), Value::from(id));
    doc.insert(SOUP_CREATED_DATE.to_string(), Value::from(created));
    doc.insert(SOUP_LAST_MODIFIED_DATE.to_string(), Value::from(last_modified));
}

/// Whether the document is flagged dirty by the sync layer
pub fn is_locally_modified(doc: &Value) -> bool {
    matches!(doc.get(LOCAL_FLAG), Some(Value::Bool(true)))
}

/// Convert a stored timestamp into a UTC date
///
/// Returns `None` for values outside chrono's representable range.
pub fn date_from_last_modified_value(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

fn as_i64_lenient(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
