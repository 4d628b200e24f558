//! Entry CRUD engine
//!
//! Every mutation runs in one SQLite transaction. Upsert batches are all or
//! nothing: the first failing entry rolls back the transaction and restores
//! any external files the batch had already rewritten.

use super::compiler::compile;
use super::external::{ExternalStorage, WriteJournal};
use super::layout::{column_value, to_sql_value, ResolvedPath, SoupLayout};
use super::long_ops;
use super::query::sql_count;
use super::StoreInner;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use soupstore_core::entry::{self, LOCAL_FLAG, SOUP_ENTRY_ID};
use soupstore_core::path::project;
use soupstore_core::{Error, QuerySpec, Result};
use tracing::debug;

/// Ids per `IN (...)` list
pub(crate) const ID_CHUNK: usize = 500;

/// System columns of one row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RowStamp {
    pub id: i64,
    pub created: i64,
    pub last_modified: i64,
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Write document, index columns and full-text row of an existing row
///
/// External documents are written to their file; when a journal is given the
/// file's previous contents are recorded first.
pub(crate) fn write_row(
    conn: &Connection,
    external: &ExternalStorage,
    layout: &SoupLayout,
    stamp: RowStamp,
    doc: &Value,
    journal: Option<&mut WriteJournal>,
) -> Result<()> {
    let soup_value = if layout.is_external() {
        if let Some(journal) = journal {
            journal.record(external.entry_path(&layout.table, stamp.id))?;
        }
        external.write(&layout.table, stamp.id, doc)?;
        SqlValue::Null
    } else {
        SqlValue::Text(serde_json::to_string(doc)?)
    };

    let mut sql = format!(
        "UPDATE {} SET soup = ?, created = ?, lastModified = ?",
        layout.table
    );
    let mut values = vec![
        soup_value,
        SqlValue::Integer(stamp.created),
        SqlValue::Integer(stamp.last_modified),
    ];
    for (index, column) in layout.value_columns() {
        sql.push_str(&format!(", {} = ?", column));
        values.push(column_value(&index.index, doc));
    }
    sql.push_str(" WHERE id = ?");
    values.push(SqlValue::Integer(stamp.id));

    conn.prepare_cached(&sql)
        .and_then(|mut stmt| stmt.execute(params_from_iter(values.iter())))
        .map_err(Error::storage)?;

    if layout.has_full_text() {
        write_fts_row(conn, layout, stamp.id, doc)?;
    }
    Ok(())
}

/// Replace the full-text row of entry `id`
pub(crate) fn write_fts_row(
    conn: &Connection,
    layout: &SoupLayout,
    id: i64,
    doc: &Value,
) -> Result<()> {
    let fts = layout.fts_table();
    conn.prepare_cached(&format!("DELETE FROM {} WHERE rowid = ?", fts))
        .and_then(|mut stmt| stmt.execute(params![id]))
        .map_err(Error::storage)?;

    let columns: Vec<_> = layout.full_text_columns().collect();
    let names: Vec<&str> = columns.iter().map(|(_, c)| *c).collect();
    let mut values = vec![SqlValue::Integer(id)];
    values.extend(columns.iter().map(|(index, _)| column_value(&index.index, doc)));
    let sql = format!(
        "INSERT INTO {} (rowid, {}) VALUES (?, {})",
        fts,
        names.join(", "),
        placeholders(names.len())
    );
    conn.prepare_cached(&sql)
        .and_then(|mut stmt| stmt.execute(params_from_iter(values.iter())))
        .map_err(Error::storage)?;
    Ok(())
}

/// Insert a row with explicit system columns, returning its id
pub(crate) fn insert_row(
    conn: &Connection,
    layout: &SoupLayout,
    id: Option<i64>,
    created: i64,
    last_modified: i64,
) -> Result<i64> {
    let sql = format!(
        "INSERT INTO {} (id, created, lastModified) VALUES (?, ?, ?)",
        layout.table
    );
    conn.prepare_cached(&sql)
        .and_then(|mut stmt| stmt.execute(params![id, created, last_modified]))
        .map_err(Error::storage)?;
    Ok(conn.last_insert_rowid())
}

/// Decode the stored document of a row
pub(crate) fn read_document(
    external: &ExternalStorage,
    layout: &SoupLayout,
    id: i64,
    soup: Option<String>,
) -> Result<Value> {
    if layout.is_external() {
        return external.read(&layout.table, id);
    }
    let text = soup.ok_or_else(|| {
        Error::storage(format!("entry {} of soup '{}' has no document", id, layout.name))
    })?;
    Ok(serde_json::from_str(&text)?)
}

/// Every id of a soup, ascending
pub(crate) fn all_ids(conn: &Connection, layout: &SoupLayout) -> Result<Vec<i64>> {
    let mut stmt = conn
        .prepare(&format!("SELECT id FROM {} ORDER BY id", layout.table))
        .map_err(Error::storage)?;
    let rows = stmt
        .query_map([], |row| row.get::<_, i64>(0))
        .map_err(Error::storage)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(Error::storage)
}

/// Rows `(id, soup, created, lastModified)` for `ids`; missing ids are skipped
pub(crate) fn fetch_rows(
    conn: &Connection,
    layout: &SoupLayout,
    ids: &[i64],
) -> Result<Vec<(RowStamp, Option<String>)>> {
    let mut out = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(ID_CHUNK) {
        let sql = format!(
            "SELECT id, soup, created, lastModified FROM {} WHERE id IN ({}) ORDER BY id",
            layout.table,
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql).map_err(Error::storage)?;
        let rows = stmt
            .query_map(params_from_iter(chunk.iter()), |row| {
                Ok((
                    RowStamp {
                        id: row.get(0)?,
                        created: row.get(2)?,
                        last_modified: row.get(3)?,
                    },
                    row.get::<_, Option<String>>(1)?,
                ))
            })
            .map_err(Error::storage)?;
        for row in rows {
            out.push(row.map_err(Error::storage)?);
        }
    }
    Ok(out)
}

/// Visit every stored document of a soup in id order
pub(crate) fn for_each_document<F>(
    conn: &Connection,
    external: &ExternalStorage,
    layout: &SoupLayout,
    mut visit: F,
) -> Result<()>
where
    F: FnMut(RowStamp, Value) -> Result<()>,
{
    let ids = all_ids(conn, layout)?;
    for chunk in ids.chunks(ID_CHUNK) {
        for (stamp, soup) in fetch_rows(conn, layout, chunk)? {
            let doc = read_document(external, layout, stamp.id, soup)?;
            visit(stamp, doc)?;
        }
    }
    Ok(())
}

/// Delete rows and full-text rows; absent ids are ignored
pub(crate) fn delete_rows(conn: &Connection, layout: &SoupLayout, ids: &[i64]) -> Result<usize> {
    let mut deleted = 0;
    for chunk in ids.chunks(ID_CHUNK) {
        let list = placeholders(chunk.len());
        deleted += conn
            .execute(
                &format!("DELETE FROM {} WHERE id IN ({})", layout.table, list),
                params_from_iter(chunk.iter()),
            )
            .map_err(Error::storage)?;
        if layout.has_full_text() {
            conn.execute(
                &format!("DELETE FROM {} WHERE rowid IN ({})", layout.fts_table(), list),
                params_from_iter(chunk.iter()),
            )
            .map_err(Error::storage)?;
        }
    }
    Ok(deleted)
}

/// Ids whose value at a resolved path equals `value`, ascending
fn ids_matching(
    conn: &Connection,
    layout: &SoupLayout,
    resolved: &ResolvedPath,
    value: &Value,
) -> Result<Vec<i64>> {
    let sql = format!(
        "SELECT id FROM {} WHERE {} = ? ORDER BY id",
        layout.table, resolved.expr
    );
    let mut stmt = conn.prepare_cached(&sql).map_err(Error::storage)?;
    let rows = stmt
        .query_map(params![to_sql_value(resolved.bind_as, value)], |row| {
            row.get::<_, i64>(0)
        })
        .map_err(Error::storage)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(Error::storage)
}

fn existing_stamp(conn: &Connection, layout: &SoupLayout, id: i64) -> Result<Option<RowStamp>> {
    conn.prepare_cached(&format!(
        "SELECT created, lastModified FROM {} WHERE id = ?",
        layout.table
    ))
    .and_then(|mut stmt| {
        stmt.query_row(params![id], |row| {
            Ok(RowStamp {
                id,
                created: row.get(0)?,
                last_modified: row.get(1)?,
            })
        })
        .optional()
    })
    .map_err(Error::storage)
}

struct UpsertBatch<'a> {
    conn: &'a Connection,
    external: &'a ExternalStorage,
    layout: &'a SoupLayout,
    external_id: Option<(&'a str, ResolvedPath)>,
    now: i64,
}

impl UpsertBatch<'_> {
    fn apply(&self, entries: Vec<Value>, journal: &mut WriteJournal) -> Result<Vec<Value>> {
        let mut stored = Vec::with_capacity(entries.len());
        for (position, entry) in entries.into_iter().enumerate() {
            let Value::Object(_) = entry else {
                return Err(Error::InvalidEntry {
                    soup: self.layout.name.clone(),
                    position,
                    reason: format!("expected a JSON object, got {}", json_type(&entry)),
                });
            };
            stored.push(self.upsert_one(entry, journal)?);
        }
        Ok(stored)
    }

    fn upsert_one(&self, mut entry: Value, journal: &mut WriteJournal) -> Result<Value> {
        let stamp = match self.target_of(&entry)? {
            Some(previous) => RowStamp {
                id: previous.id,
                created: previous.created,
                last_modified: self.now.max(previous.last_modified + 1),
            },
            None => {
                let id = insert_row(self.conn, self.layout, None, self.now, self.now)?;
                RowStamp {
                    id,
                    created: self.now,
                    last_modified: self.now,
                }
            }
        };
        if let Some(map) = entry.as_object_mut() {
            entry::stamp(map, stamp.id, stamp.created, stamp.last_modified);
        }
        write_row(
            self.conn,
            self.external,
            self.layout,
            stamp,
            &entry,
            Some(journal),
        )?;
        Ok(entry)
    }

    /// Existing row this entry updates, if any
    fn target_of(&self, entry: &Value) -> Result<Option<RowStamp>> {
        if let Some(id) = entry::entry_id(entry) {
            if let Some(found) = existing_stamp(self.conn, self.layout, id)? {
                return Ok(Some(found));
            }
        }
        let Some((path, resolved)) = &self.external_id else {
            return Ok(None);
        };
        let Some(value) = project(entry, path) else {
            return Ok(None);
        };
        let ids = ids_matching(self.conn, self.layout, resolved, &value)?;
        match ids.as_slice() {
            [] => Ok(None),
            [id] => existing_stamp(self.conn, self.layout, *id),
            _ => Err(Error::AmbiguousExternalId {
                soup: self.layout.name.clone(),
                path: path.to_string(),
                value: value.to_string(),
                ids,
            }),
        }
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl StoreInner {
    /// Fail with `AlterPending` while an alteration of `soup` is unfinished
    pub(crate) fn ensure_no_pending_alter(&self, soup: &str) -> Result<()> {
        if long_ops::pending_alter(&self.conn, soup)?.is_some() {
            return Err(Error::AlterPending {
                soup: soup.to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn upsert_entries(
        &mut self,
        soup: &str,
        entries: Vec<Value>,
        external_id_path: Option<&str>,
    ) -> Result<Vec<Value>> {
        let layout = self.user_layout(soup)?;
        self.ensure_no_pending_alter(soup)?;
        let external_id = match external_id_path {
            Some(path) if path != SOUP_ENTRY_ID => Some((path, layout.resolve(path, false)?)),
            _ => None,
        };
        let count = entries.len();
        let now = self.clock.tick();

        let batch = UpsertBatch {
            conn: &self.conn,
            external: &self.external,
            layout: &layout,
            external_id,
            now,
        };
        let mut journal = WriteJournal::new();
        let result = self
            .conn
            .unchecked_transaction()
            .map_err(Error::storage)
            .and_then(|tx| {
                let stored = batch.apply(entries, &mut journal)?;
                tx.commit().map_err(Error::storage)?;
                Ok(stored)
            });

        match result {
            Ok(stored) => {
                debug!(target: "soupstore::store", soup, count, "Upserted entries");
                Ok(stored)
            }
            Err(e) => {
                journal.rollback();
                Err(e)
            }
        }
    }

    /// Entries with the given ids; missing ids are omitted
    pub(crate) fn retrieve_entries(&mut self, soup: &str, ids: &[i64]) -> Result<Vec<Value>> {
        let layout = self.user_layout(soup)?;
        fetch_rows(&self.conn, &layout, ids)?
            .into_iter()
            .map(|(stamp, text)| read_document(&self.external, &layout, stamp.id, text))
            .collect()
    }

    pub(crate) fn remove_entries(&mut self, soup: &str, ids: &[i64]) -> Result<()> {
        let layout = self.user_layout(soup)?;
        self.ensure_no_pending_alter(soup)?;
        let tx = self.conn.unchecked_transaction().map_err(Error::storage)?;
        let deleted = delete_rows(&tx, &layout, ids)?;
        tx.commit().map_err(Error::storage)?;
        if layout.is_external() {
            self.external.remove_after_commit(&layout.table, ids);
        }
        debug!(target: "soupstore::store", soup, deleted, "Removed entries");
        Ok(())
    }

    /// Remove the first page of entries `spec` selects
    pub(crate) fn remove_entries_by_query(&mut self, soup: &str, spec: &QuerySpec) -> Result<()> {
        spec.validate()?;
        if spec.is_smart() {
            return Err(Error::unsupported(
                "remove by query does not accept smart queries",
            ));
        }
        if spec.soup_name.as_deref() != Some(soup) {
            return Err(Error::invalid_argument(format!(
                "query targets soup {:?}, not '{}'",
                spec.soup_name, soup
            )));
        }
        let layout = self.user_layout(soup)?;
        self.ensure_no_pending_alter(soup)?;
        let compiled = compile(&layout, spec)?;

        let tx = self.conn.unchecked_transaction().map_err(Error::storage)?;
        let ids: Vec<i64> = {
            let mut values = compiled.args.clone();
            values.push(sql_count(spec.page_size));
            values.push(SqlValue::Integer(0));
            let mut stmt = tx.prepare(&compiled.ids_sql()).map_err(Error::storage)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), |row| row.get::<_, i64>(0))
                .map_err(Error::storage)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(Error::storage)?
        };
        delete_rows(&tx, &layout, &ids)?;
        tx.commit().map_err(Error::storage)?;
        if layout.is_external() {
            self.external.remove_after_commit(&layout.table, &ids);
        }
        debug!(target: "soupstore::store", soup, deleted = ids.len(), "Removed entries by query");
        Ok(())
    }

    /// Delete every entry, keeping the soup registered
    pub(crate) fn clear_soup(&mut self, soup: &str) -> Result<()> {
        let layout = self.user_layout(soup)?;
        self.ensure_no_pending_alter(soup)?;
        let tx = self.conn.unchecked_transaction().map_err(Error::storage)?;
        tx.execute(&format!("DELETE FROM {}", layout.table), [])
            .map_err(Error::storage)?;
        if layout.has_full_text() {
            tx.execute(&format!("DELETE FROM {}", layout.fts_table()), [])
                .map_err(Error::storage)?;
        }
        tx.commit().map_err(Error::storage)?;
        if layout.is_external() {
            self.external.remove_soup_dir_after_commit(&layout.table);
        }
        debug!(target: "soupstore::store", soup, "Cleared soup");
        Ok(())
    }

    /// The unique entry whose `path` equals `value`
    pub(crate) fn lookup_soup_entry_id(
        &mut self,
        soup: &str,
        path: &str,
        value: &Value,
    ) -> Result<i64> {
        let layout = self.user_layout(soup)?;
        let resolved = layout.resolve(path, false)?;
        let ids = ids_matching(&self.conn, &layout, &resolved, value)?;
        match ids.as_slice() {
            [] => Err(Error::NotFound {
                soup: soup.to_string(),
                detail: format!("no entry with {} = {}", path, value),
            }),
            [id] => Ok(*id),
            _ => Err(Error::AmbiguousMatch {
                soup: soup.to_string(),
                path: path.to_string(),
                value: value.to_string(),
                ids,
            }),
        }
    }

    /// Ids of entries flagged dirty by the sync layer
    pub(crate) fn dirty_entry_ids(&mut self, soup: &str) -> Result<Vec<i64>> {
        let layout = self.user_layout(soup)?;
        let resolved = layout.resolve(LOCAL_FLAG, false)?;
        ids_matching(&self.conn, &layout, &resolved, &Value::Bool(true))
    }

    /// Recompute the columns of the given indexed paths for every entry
    pub(crate) fn re_index_soup(&mut self, soup: &str, paths: &[String]) -> Result<()> {
        let layout = self.user_layout(soup)?;
        self.ensure_no_pending_alter(soup)?;
        for path in paths {
            if !layout.is_indexed(path) {
                return Err(Error::path_not_indexed(soup, path.as_str()));
            }
        }
        let targets: Vec<_> = layout
            .value_columns()
            .filter(|(index, _)| paths.contains(&index.index.path))
            .collect();
        if targets.is_empty() {
            return Ok(());
        }
        let touches_fts = targets
            .iter()
            .any(|(index, _)| index.index.index_type.is_full_text());
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?",
            layout.table,
            targets
                .iter()
                .map(|(_, column)| format!("{} = ?", column))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let tx = self.conn.unchecked_transaction().map_err(Error::storage)?;
        let mut updated = 0usize;
        for_each_document(&tx, &self.external, &layout, |stamp, doc| {
            let mut values: Vec<SqlValue> = targets
                .iter()
                .map(|(index, _)| column_value(&index.index, &doc))
                .collect();
            values.push(SqlValue::Integer(stamp.id));
            tx.prepare_cached(&sql)
                .and_then(|mut stmt| stmt.execute(params_from_iter(values.iter())))
                .map_err(Error::storage)?;
            if touches_fts {
                write_fts_row(&tx, &layout, stamp.id, &doc)?;
            }
            updated += 1;
            Ok(())
        })?;
        tx.commit().map_err(Error::storage)?;
        debug!(target: "soupstore::store", soup, updated, "Re-indexed soup");
        Ok(())
    }
}
