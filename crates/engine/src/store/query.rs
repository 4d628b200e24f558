//! Query execution
//!
//! Non-smart queries return whole documents (or the selected paths of each);
//! smart queries return one JSON array per result row.

use super::compiler::{compile, convert_smart_sql};
use super::crud::read_document;
use super::layout::{sql_to_json, to_sql_value};
use super::StoreInner;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Row};
use serde_json::{json, Value};
use soupstore_core::path::project_all;
use soupstore_core::{Error, IndexType, QueryKind, QuerySpec, Result};
use tracing::debug;

/// Columns of a smart result holding a whole document
const DOCUMENT_COLUMNS: [&str; 2] = ["soup", "_soup"];

fn bind_args(args: &[Value]) -> Vec<SqlValue> {
    args.iter()
        .map(|v| to_sql_value(IndexType::Json1, v))
        .collect()
}

/// Statement body without trailing terminators, for use as a subquery
fn as_subquery(sql: &str) -> &str {
    sql.trim_end().trim_end_matches(';').trim_end()
}

/// Row count as a SQLite integer, saturating at `i64::MAX`
///
/// SQLite reads a negative LIMIT as unbounded and a negative OFFSET as zero.
pub(crate) fn sql_count(n: usize) -> SqlValue {
    SqlValue::Integer(i64::try_from(n).unwrap_or(i64::MAX))
}

fn page_bounds(spec: &QuerySpec, page_index: usize) -> [SqlValue; 2] {
    [sql_count(spec.page_size), sql_count(spec.offset(page_index))]
}

fn smart_row(names: &[String], row: &Row<'_>) -> rusqlite::Result<Value> {
    let mut cells = Vec::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        let value = sql_to_json(row.get::<_, SqlValue>(i)?);
        let value = match value {
            Value::String(text) if DOCUMENT_COLUMNS.contains(&name.as_str()) => {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            }
            other => other,
        };
        cells.push(value);
    }
    Ok(Value::Array(cells))
}

impl StoreInner {
    /// Rewritten smart SQL, cached until the next schema change
    fn converted_smart_sql(&mut self, sql: &str) -> Result<String> {
        if let Some(converted) = self.smart_sql.get(sql) {
            return Ok(converted.clone());
        }
        let converted = convert_smart_sql(sql, |soup| self.user_layout(soup))?;
        debug!(target: "soupstore::query", sql, converted = %converted, "Converted smart sql");
        self.smart_sql.insert(sql.to_string(), converted.clone());
        Ok(converted)
    }

    /// Run `EXPLAIN QUERY PLAN` for `sql` when capture is on
    fn capture_plan(&mut self, sql: &str, values: &[SqlValue]) -> Result<()> {
        if !self.explain.capture {
            return Ok(());
        }
        let mut stmt = self
            .conn
            .prepare(&format!("EXPLAIN QUERY PLAN {}", sql))
            .map_err(Error::storage)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok(json!({
                    "id": row.get::<_, i64>(0)?,
                    "parent": row.get::<_, i64>(1)?,
                    "detail": row.get::<_, String>(3)?,
                }))
            })
            .map_err(Error::storage)?;
        let plan = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::storage)?;
        self.explain.last = Some(json!({ "sql": sql, "plan": plan }));
        Ok(())
    }

    fn check_args(spec: &QuerySpec, args: &[Value]) -> Result<()> {
        if !args.is_empty() && !spec.is_smart() {
            return Err(Error::unsupported(format!(
                "bind arguments are only accepted by smart queries, not {} queries",
                spec.kind.name()
            )));
        }
        Ok(())
    }

    /// One page of results
    pub(crate) fn query(
        &mut self,
        spec: &QuerySpec,
        page_index: usize,
        args: &[Value],
    ) -> Result<Vec<Value>> {
        spec.validate()?;
        Self::check_args(spec, args)?;
        if spec.is_smart() {
            return self.smart_query(spec, page_index, args);
        }

        let rows = self.page_rows(spec, page_index)?;
        let layout = self.user_layout(spec.soup_name.as_deref().unwrap_or_default())?;
        let docs = rows
            .into_iter()
            .map(|(id, soup)| read_document(&self.external, &layout, id, soup))
            .collect::<Result<Vec<_>>>()?;
        if spec.select_paths.is_empty() {
            return Ok(docs);
        }
        Ok(docs
            .iter()
            .map(|doc| Value::Array(project_all(doc, &spec.select_paths)))
            .collect())
    }

    /// `(id, soup)` rows of one page of a non-smart query
    fn page_rows(
        &mut self,
        spec: &QuerySpec,
        page_index: usize,
    ) -> Result<Vec<(i64, Option<String>)>> {
        let layout = self.user_layout(spec.soup_name.as_deref().unwrap_or_default())?;
        let compiled = compile(&layout, spec)?;
        let sql = compiled.select_sql();
        let mut values = compiled.args;
        values.extend(page_bounds(spec, page_index));
        self.capture_plan(&sql, &values)?;
        debug!(target: "soupstore::query", soup = %layout.name, kind = spec.kind.name(), page_index, sql = %sql, "Running query");

        let mut stmt = self.conn.prepare_cached(&sql).map_err(Error::storage)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
            })
            .map_err(Error::storage)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::storage)
    }

    fn smart_query(
        &mut self,
        spec: &QuerySpec,
        page_index: usize,
        args: &[Value],
    ) -> Result<Vec<Value>> {
        let QueryKind::Smart { sql } = &spec.kind else {
            return Err(Error::invalid_argument("not a smart query"));
        };
        let converted = self.converted_smart_sql(sql)?;
        let paged = format!(
            "SELECT * FROM ({}) LIMIT ? OFFSET ?",
            as_subquery(&converted)
        );
        let mut values = bind_args(args);
        values.extend(page_bounds(spec, page_index));
        self.capture_plan(&paged, &values)?;
        debug!(target: "soupstore::query", page_index, sql = %paged, "Running smart query");

        let mut stmt = self.conn.prepare(&paged).map_err(Error::storage)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt
            .query(params_from_iter(values.iter()))
            .map_err(Error::storage)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(Error::storage)? {
            out.push(smart_row(&names, row).map_err(Error::storage)?);
        }
        Ok(out)
    }

    /// Total number of results, ignoring paging
    pub(crate) fn count(&mut self, spec: &QuerySpec, args: &[Value]) -> Result<usize> {
        spec.validate()?;
        Self::check_args(spec, args)?;
        let (sql, values) = match &spec.kind {
            QueryKind::Smart { sql } => (
                format!(
                    "SELECT count(*) FROM ({})",
                    as_subquery(&self.converted_smart_sql(sql)?)
                ),
                bind_args(args),
            ),
            _ => {
                let layout = self.user_layout(spec.soup_name.as_deref().unwrap_or_default())?;
                let compiled = compile(&layout, spec)?;
                (compiled.count_sql(), compiled.args)
            }
        };
        let count: i64 = self
            .conn
            .query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))
            .map_err(Error::storage)?;
        Ok(count.max(0) as usize)
    }

    /// One page of results as a JSON array string
    ///
    /// Whole-document pages of internal soups are assembled from the stored
    /// text without re-parsing each document.
    pub(crate) fn query_as_string(
        &mut self,
        spec: &QuerySpec,
        page_index: usize,
        args: &[Value],
    ) -> Result<String> {
        spec.validate()?;
        Self::check_args(spec, args)?;
        if spec.is_smart() || !spec.select_paths.is_empty() {
            let results = self.query(spec, page_index, args)?;
            return Ok(serde_json::to_string(&results)?);
        }

        let layout = self.user_layout(spec.soup_name.as_deref().unwrap_or_default())?;
        let rows = self.page_rows(spec, page_index)?;
        let mut out = String::from("[");
        for (i, (id, soup)) in rows.into_iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let text = match soup {
                Some(text) if !layout.is_external() => text,
                _ => self.external.read_string(&layout.table, id)?,
            };
            out.push_str(&text);
        }
        out.push(']');
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_bind_like_json_extract() {
        let values = bind_args(&[json!("a"), json!(3), json!(true), json!(null)]);
        assert_eq!(
            values,
            vec![
                SqlValue::Text("a".into()),
                SqlValue::Integer(3),
                SqlValue::Integer(1),
                SqlValue::Null
            ]
        );
    }

    #[test]
    fn trailing_semicolons_are_dropped() {
        assert_eq!(as_subquery("SELECT 1 ;  "), "SELECT 1");
        assert_eq!(as_subquery("SELECT 1"), "SELECT 1");
    }

    #[test]
    fn page_bounds_follow_page_size() {
        let spec = QuerySpec::all("contacts", 25);
        assert_eq!(
            page_bounds(&spec, 2),
            [SqlValue::Integer(25), SqlValue::Integer(50)]
        );
    }

    #[test]
    fn page_bounds_saturate_instead_of_wrapping() {
        let spec = QuerySpec::all("contacts", 10);
        assert_eq!(
            page_bounds(&spec, usize::MAX / 5),
            [SqlValue::Integer(10), SqlValue::Integer(i64::MAX)]
        );
        let huge = QuerySpec::all("contacts", usize::MAX);
        assert_eq!(
            page_bounds(&huge, 0),
            [SqlValue::Integer(i64::MAX), SqlValue::Integer(0)]
        );
    }
}
