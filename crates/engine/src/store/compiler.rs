//! Query compiler
//!
//! Turns a [`QuerySpec`] into parameterized SQL against a soup's current
//! layout. Non-smart kinds build a predicate from one indexed path; smart
//! queries have their `{soup}` / `{soup:path}` references rewritten into
//! physical names and are otherwise passed through untouched.
//!
//! Paging is applied by the caller with `LIMIT ? OFFSET ?` on top of the
//! compiled statement.

use super::layout::{to_sql_value, SoupLayout};
use rusqlite::types::Value as SqlValue;
use soupstore_core::{Error, QueryKind, QuerySpec, Result, SystemPath};
use std::collections::HashMap;
use std::sync::Arc;

/// A compiled non-smart query
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CompiledQuery {
    pub table: String,
    /// Predicate without the `WHERE` keyword; empty for all-entries
    pub predicate: String,
    /// Ordering without the `ORDER BY` keywords
    pub order_by: String,
    pub args: Vec<SqlValue>,
}

impl CompiledQuery {
    fn where_clause(&self) -> String {
        if self.predicate.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.predicate)
        }
    }

    /// `id, soup` of one page; binds `args` then limit and offset
    pub(crate) fn select_sql(&self) -> String {
        format!(
            "SELECT id, soup FROM {}{} ORDER BY {} LIMIT ? OFFSET ?",
            self.table,
            self.where_clause(),
            self.order_by
        )
    }

    /// Ids of one page; binds `args` then limit and offset
    pub(crate) fn ids_sql(&self) -> String {
        format!(
            "SELECT id FROM {}{} ORDER BY {} LIMIT ? OFFSET ?",
            self.table,
            self.where_clause(),
            self.order_by
        )
    }

    /// Number of matching rows; binds `args`
    pub(crate) fn count_sql(&self) -> String {
        format!("SELECT count(*) FROM {}{}", self.table, self.where_clause())
    }
}

/// Compile a non-smart query against `layout`
pub(crate) fn compile(layout: &SoupLayout, spec: &QuerySpec) -> Result<CompiledQuery> {
    let mut args = Vec::new();
    let predicate = match &spec.kind {
        QueryKind::All => String::new(),
        QueryKind::Exact { path, key } => {
            let resolved = layout.resolve(path, false)?;
            args.push(to_sql_value(resolved.bind_as, key));
            format!("{} = ?", resolved.expr)
        }
        QueryKind::Range { path, begin, end } => {
            let resolved = layout.resolve(path, false)?;
            let mut bounds = Vec::new();
            if let Some(begin) = begin {
                bounds.push(format!("{} >= ?", resolved.expr));
                args.push(to_sql_value(resolved.bind_as, begin));
            }
            if let Some(end) = end {
                bounds.push(format!("{} <= ?", resolved.expr));
                args.push(to_sql_value(resolved.bind_as, end));
            }
            bounds.join(" AND ")
        }
        QueryKind::Like { path, pattern } => {
            let resolved = layout.resolve(path, false)?;
            args.push(SqlValue::Text(pattern.clone()));
            format!("{} LIKE ?", resolved.expr)
        }
        QueryKind::Match { path, key } => {
            let fts = layout.fts_table();
            let target = match path {
                Some(path) => layout
                    .full_text_lookup(path)
                    .and_then(|c| c.column.clone())
                    .ok_or_else(|| Error::path_not_indexed(&layout.name, path))?,
                None if layout.has_full_text() => fts.clone(),
                None => return Err(Error::path_not_indexed(&layout.name, "*")),
            };
            args.push(SqlValue::Text(key.clone()));
            format!("id IN (SELECT rowid FROM {} WHERE {} MATCH ?)", fts, target)
        }
        QueryKind::Smart { .. } => {
            return Err(Error::unsupported(
                "smart queries are converted, not compiled",
            ))
        }
    };

    let order_by = match &spec.order_path {
        Some(path) => {
            let resolved = layout.resolve(path, false)?;
            if resolved.expr == "id" {
                format!("id {}", spec.order.as_sql())
            } else {
                format!("{} {}, id ASC", resolved.expr, spec.order.as_sql())
            }
        }
        None => format!("id {}", spec.order.as_sql()),
    };

    Ok(CompiledQuery {
        table: layout.table.clone(),
        predicate,
        order_by,
        args,
    })
}

// =============================================================================
// Smart SQL
// =============================================================================

/// Rewrite the logical references of a smart statement
///
/// `resolve` maps a soup name to its layout. Braces inside single-quoted
/// literals are left alone.
pub(crate) fn convert_smart_sql<F>(sql: &str, mut resolve: F) -> Result<String>
where
    F: FnMut(&str) -> Result<Arc<SoupLayout>>,
{
    let trimmed = sql.trim_start();
    let is_select = trimmed
        .get(..6)
        .map_or(false, |head| head.eq_ignore_ascii_case("select"));
    if !is_select {
        return Err(Error::unsupported(
            "smart queries must be SELECT statements",
        ));
    }

    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices();
    let mut in_literal = false;

    while let Some((i, c)) = chars.next() {
        match c {
            '\'' => {
                in_literal = !in_literal;
                out.push(c);
            }
            '{' if !in_literal => {
                let rest = &sql[i + 1..];
                let close = rest.find('}').ok_or_else(|| {
                    Error::invalid_argument(format!("unterminated reference at offset {}", i))
                })?;
                let reference = &rest[..close];
                out.push_str(&resolve_reference(reference, &mut resolve)?);
                // Skip the reference and its closing brace
                for _ in 0..reference.chars().count() + 1 {
                    chars.next();
                }
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}

fn resolve_reference<F>(reference: &str, resolve: &mut F) -> Result<String>
where
    F: FnMut(&str) -> Result<Arc<SoupLayout>>,
{
    let (soup, path) = match reference.split_once(':') {
        Some((soup, path)) => (soup.trim(), Some(path.trim())),
        None => (reference.trim(), None),
    };
    let layout = resolve(soup)?;
    let Some(path) = path else {
        return Ok(layout.table.clone());
    };
    if SystemPath::parse(path) == Some(SystemPath::Soup) {
        if layout.is_external() {
            return Err(Error::unsupported(format!(
                "{{{}:_soup}} is not available for externally stored soup '{}'",
                soup, soup
            )));
        }
        return Ok(format!("{}.soup", layout.table));
    }
    Ok(layout.resolve(path, true)?.expr)
}

/// Converted smart statements, cleared on every schema change
pub(crate) struct SmartSqlCache {
    entries: HashMap<String, String>,
    capacity: usize,
}

impl SmartSqlCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn get(&self, sql: &str) -> Option<&String> {
        self.entries.get(sql)
    }

    pub(crate) fn insert(&mut self, sql: String, converted: String) {
        if self.entries.len() >= self.capacity {
            self.entries.clear();
        }
        self.entries.insert(sql, converted);
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use soupstore_core::{SortOrder, SoupIndex, StorageMode};

    fn contacts() -> SoupLayout {
        SoupLayout::new(
            "contacts",
            1,
            StorageMode::Internal,
            &[
                SoupIndex::string("name"),
                SoupIndex::integer("age"),
                SoupIndex::json1("address.city"),
                SoupIndex::full_text("bio"),
            ],
        )
    }

    fn resolver(name: &str) -> Result<Arc<SoupLayout>> {
        match name {
            "contacts" => Ok(Arc::new(contacts())),
            "files" => Ok(Arc::new(SoupLayout::new(
                "files",
                2,
                StorageMode::External,
                &[SoupIndex::string("path")],
            ))),
            other => Err(Error::soup_not_found(other)),
        }
    }

    #[test]
    fn all_orders_by_id() {
        let q = compile(&contacts(), &QuerySpec::all("contacts", 10)).unwrap();
        assert_eq!(
            q.select_sql(),
            "SELECT id, soup FROM TABLE_1 ORDER BY id ASC LIMIT ? OFFSET ?"
        );
        assert!(q.args.is_empty());
    }

    #[test]
    fn exact_binds_by_index_type() {
        let q = compile(&contacts(), &QuerySpec::exact("contacts", "age", "42", 10)).unwrap();
        assert_eq!(q.predicate, "TABLE_1_1 = ?");
        assert_eq!(q.args, vec![SqlValue::Integer(42)]);
        assert_eq!(q.order_by, "TABLE_1_1 ASC, id ASC");
    }

    #[test]
    fn open_range_binds_one_bound() {
        let spec = QuerySpec::range("contacts", "age", None, Some(json!(30)), 10);
        let q = compile(&contacts(), &spec).unwrap();
        assert_eq!(q.predicate, "TABLE_1_1 <= ?");
        assert_eq!(q.args, vec![SqlValue::Integer(30)]);
    }

    #[test]
    fn json1_paths_use_json_extract() {
        let spec = QuerySpec::like("contacts", "address.city", "Par%", 10);
        let q = compile(&contacts(), &spec).unwrap();
        assert_eq!(
            q.predicate,
            "json_extract(soup, '$.\"address\".\"city\"') LIKE ?"
        );
    }

    #[test]
    fn match_uses_fts_table() {
        let spec = QuerySpec::full_text("contacts", Some("bio".into()), "rust", 10);
        let q = compile(&contacts(), &spec).unwrap();
        assert_eq!(
            q.predicate,
            "id IN (SELECT rowid FROM TABLE_1_fts WHERE TABLE_1_3 MATCH ?)"
        );
        let any = QuerySpec::full_text("contacts", None, "rust", 10);
        assert!(compile(&contacts(), &any)
            .unwrap()
            .predicate
            .contains("TABLE_1_fts MATCH ?"));
    }

    #[test]
    fn unindexed_paths_are_rejected() {
        let layout = contacts();
        for spec in [
            QuerySpec::exact("contacts", "email", "x", 10),
            QuerySpec::range("contacts", "email", None, None, 10),
            QuerySpec::like("contacts", "email", "x%", 10),
            QuerySpec::all("contacts", 10).order_by("email", SortOrder::Descending),
            QuerySpec::full_text("contacts", Some("name".into()), "x", 10),
        ] {
            assert!(
                matches!(compile(&layout, &spec), Err(Error::PathNotIndexed { .. })),
                "{:?} compiled",
                spec.kind
            );
        }
    }

    #[test]
    fn descending_order_on_system_path() {
        let spec = QuerySpec::all("contacts", 10)
            .order_by("_soupLastModifiedDate", SortOrder::Descending);
        let q = compile(&contacts(), &spec).unwrap();
        assert_eq!(q.order_by, "lastModified DESC, id ASC");
    }

    #[test]
    fn smart_sql_resolves_references() {
        let sql = "select {contacts:name}, {contacts:_soup} from {contacts} \
                   where {contacts:age} > ? and {contacts:address.city} = 'x{y}'";
        let converted = convert_smart_sql(sql, resolver).unwrap();
        assert_eq!(
            converted,
            "select TABLE_1.TABLE_1_0, TABLE_1.soup from TABLE_1 \
             where TABLE_1.TABLE_1_1 > ? and json_extract(TABLE_1.soup, '$.\"address\".\"city\"') = 'x{y}'"
        );
    }

    #[test]
    fn smart_sql_errors() {
        assert!(matches!(
            convert_smart_sql("DELETE FROM {contacts}", resolver),
            Err(Error::UnsupportedOperation(_))
        ));
        assert!(matches!(
            convert_smart_sql("SELECT {contacts:email} FROM {contacts}", resolver),
            Err(Error::PathNotIndexed { .. })
        ));
        assert!(matches!(
            convert_smart_sql("SELECT * FROM {nope}", resolver),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            convert_smart_sql("SELECT {files:_soup} FROM {files}", resolver),
            Err(Error::UnsupportedOperation(_))
        ));
        assert!(matches!(
            convert_smart_sql("SELECT {contacts FROM x", resolver),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn cache_is_bounded() {
        let mut cache = SmartSqlCache::new(2);
        cache.insert("a".into(), "A".into());
        cache.insert("b".into(), "B".into());
        cache.insert("c".into(), "C".into());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("c").map(String::as_str), Some("C"));
    }
}
