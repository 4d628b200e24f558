//! Soup registry
//!
//! Registration metadata lives in `soup_names` and `soup_index_map`; the
//! physical table, its SQL indexes and the optional FTS5 table are created
//! in the same transaction that records them. Layouts are cached per store
//! by soup name. The cache is only touched while the store's queue is held,
//! and is dropped with every schema change, so a reader never sees a layout
//! that disagrees with the tables.

use super::layout::{json_extract_sql, SoupLayout};
use super::long_ops;
use super::StoreInner;
use rusqlite::{params, Connection, OptionalExtension};
use soupstore_core::limits::shadow_soup_name;
use soupstore_core::{
    validate_index_path, validate_soup_name, Error, IndexType, Result, SoupIndex, SoupSpec,
    StorageMode, RESERVED_SHADOW_PREFIX,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Check an index list before it is registered
pub(crate) fn validate_indexes(
    soup: &str,
    storage: StorageMode,
    indexes: &[SoupIndex],
) -> Result<()> {
    if indexes.is_empty() {
        return Err(Error::invalid_argument(format!(
            "soup '{}' needs at least one index",
            soup
        )));
    }
    let mut seen = HashSet::new();
    for index in indexes {
        validate_index_path(&index.path)?;
        if !seen.insert(index) {
            return Err(Error::invalid_argument(format!(
                "index {} is declared twice for soup '{}'",
                index, soup
            )));
        }
        if storage == StorageMode::External && index.index_type == IndexType::Json1 {
            return Err(Error::unsupported(format!(
                "json1 index on '{}' is not available for externally stored soup '{}'",
                index.path, soup
            )));
        }
    }
    Ok(())
}

/// Load the layout registered under `name`
pub(crate) fn load_layout(conn: &Connection, name: &str) -> Result<Option<SoupLayout>> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT id, storage FROM soup_names WHERE soupName = ?1",
            params![name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(Error::storage)?;
    let Some((soup_id, storage)) = row else {
        return Ok(None);
    };
    let storage: StorageMode = storage.parse().map_err(Error::storage)?;

    let mut stmt = conn
        .prepare(
            "SELECT path, columnType FROM soup_index_map WHERE soupName = ?1 ORDER BY ordinal",
        )
        .map_err(Error::storage)?;
    let rows = stmt
        .query_map(params![name], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(Error::storage)?;
    let mut indexes = Vec::new();
    for row in rows {
        let (path, column_type) = row.map_err(Error::storage)?;
        let index_type: IndexType = column_type.parse().map_err(Error::storage)?;
        indexes.push(SoupIndex::new(path, index_type));
    }

    Ok(Some(SoupLayout::new(name, soup_id, storage, &indexes)))
}

/// Create the physical storage and metadata of a soup
///
/// Runs on the caller's transaction.
pub(crate) fn create_soup(
    conn: &Connection,
    name: &str,
    storage: StorageMode,
    indexes: &[SoupIndex],
) -> Result<SoupLayout> {
    conn.execute(
        "INSERT INTO soup_names (soupName, storage) VALUES (?1, ?2)",
        params![name, storage.as_str()],
    )
    .map_err(Error::storage)?;
    let layout = SoupLayout::new(name, conn.last_insert_rowid(), storage, indexes);
    let table = &layout.table;

    let mut ddl = format!(
        "CREATE TABLE {table} (id INTEGER PRIMARY KEY AUTOINCREMENT, soup TEXT, created INTEGER, lastModified INTEGER"
    );
    for (index, column) in layout.value_columns() {
        let column_type = index.index.index_type.column_type().unwrap_or("TEXT");
        ddl.push_str(&format!(", {} {}", column, column_type));
    }
    ddl.push_str(");\n");

    for (ordinal, index) in layout.columns.iter().enumerate() {
        let target = match &index.column {
            Some(column) => column.clone(),
            None => json_extract_sql("", &index.index.path),
        };
        ddl.push_str(&format!(
            "CREATE INDEX {table}_{ordinal}_idx ON {table} ({target});\n"
        ));
    }
    ddl.push_str(&format!(
        "CREATE INDEX {table}_created_idx ON {table} (created);\n\
         CREATE INDEX {table}_lastModified_idx ON {table} (lastModified);\n"
    ));

    let fts_columns: Vec<&str> = layout.full_text_columns().map(|(_, c)| c).collect();
    if !fts_columns.is_empty() {
        ddl.push_str(&format!(
            "CREATE VIRTUAL TABLE {} USING fts5({});\n",
            layout.fts_table(),
            fts_columns.join(", ")
        ));
    }

    debug!(target: "soupstore::registry", soup = name, table = %table, sql = %ddl, "Creating soup table");
    conn.execute_batch(&ddl).map_err(Error::storage)?;

    let mut stmt = conn
        .prepare(
            "INSERT INTO soup_index_map (soupName, ordinal, path, columnName, columnType) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .map_err(Error::storage)?;
    for (ordinal, index) in layout.columns.iter().enumerate() {
        stmt.execute(params![
            name,
            ordinal as i64,
            index.index.path,
            index.column,
            index.index.index_type.as_str()
        ])
        .map_err(Error::storage)?;
    }

    Ok(layout)
}

/// Drop the physical storage and metadata of a soup
///
/// Runs on the caller's transaction; external files are the caller's job.
pub(crate) fn drop_soup(conn: &Connection, layout: &SoupLayout) -> Result<()> {
    conn.execute_batch(&format!(
        "DROP TABLE IF EXISTS {}; DROP TABLE IF EXISTS {};",
        layout.fts_table(),
        layout.table
    ))
    .map_err(Error::storage)?;
    conn.execute(
        "DELETE FROM soup_index_map WHERE soupName = ?1",
        params![layout.name],
    )
    .map_err(Error::storage)?;
    conn.execute(
        "DELETE FROM soup_names WHERE soupName = ?1",
        params![layout.name],
    )
    .map_err(Error::storage)?;
    Ok(())
}

impl StoreInner {
    /// Layout of `soup`, from the cache or the metadata tables
    pub(crate) fn layout(&mut self, soup: &str) -> Result<Arc<SoupLayout>> {
        if let Some(layout) = self.layouts.get(soup) {
            return Ok(Arc::clone(layout));
        }
        let layout = load_layout(&self.conn, soup)?
            .map(Arc::new)
            .ok_or_else(|| Error::soup_not_found(soup))?;
        self.layouts.insert(soup.to_string(), Arc::clone(&layout));
        Ok(layout)
    }

    /// Layout of a caller-visible soup; shadow soups are not visible
    pub(crate) fn user_layout(&mut self, soup: &str) -> Result<Arc<SoupLayout>> {
        if soup.starts_with(RESERVED_SHADOW_PREFIX) {
            return Err(Error::soup_not_found(soup));
        }
        self.layout(soup)
    }

    /// Forget every cached layout and converted statement
    pub(crate) fn invalidate_schema_caches(&mut self) {
        self.layouts.clear();
        self.smart_sql.clear();
    }

    pub(crate) fn soup_exists(&mut self, soup: &str) -> Result<bool> {
        match self.user_layout(soup) {
            Ok(_) => Ok(true),
            Err(Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn register_soup(&mut self, spec: &SoupSpec, indexes: &[SoupIndex]) -> Result<()> {
        validate_soup_name(&spec.name)?;
        validate_indexes(&spec.name, spec.storage, indexes)?;

        if let Some(existing) = load_layout(&self.conn, &spec.name)? {
            let existing_indexes = existing.indexes();
            if existing.storage == spec.storage
                && soupstore_core::same_index_set(&existing_indexes, indexes)
            {
                debug!(target: "soupstore::registry", soup = %spec.name, "Soup already registered");
                return Ok(());
            }
            return Err(Error::SchemaConflict {
                soup: spec.name.clone(),
                existing: existing_indexes,
                requested: indexes.to_vec(),
            });
        }

        let tx = self.conn.unchecked_transaction().map_err(Error::storage)?;
        let layout = create_soup(&tx, &spec.name, spec.storage, indexes)?;
        tx.commit().map_err(Error::storage)?;

        self.invalidate_schema_caches();
        info!(
            target: "soupstore::registry",
            soup = %spec.name,
            table = %layout.table,
            storage = %spec.storage,
            indexes = indexes.len(),
            "Registered soup"
        );
        self.layouts.insert(spec.name.clone(), Arc::new(layout));
        Ok(())
    }

    pub(crate) fn indices_for_soup(&mut self, soup: &str) -> Result<Vec<SoupIndex>> {
        Ok(self.user_layout(soup)?.indexes())
    }

    pub(crate) fn soup_spec(&mut self, soup: &str) -> Result<SoupSpec> {
        let layout = self.user_layout(soup)?;
        Ok(SoupSpec {
            name: layout.name.clone(),
            storage: layout.storage,
        })
    }

    pub(crate) fn all_soup_names(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT soupName FROM soup_names ORDER BY soupName")
            .map_err(Error::storage)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(Error::storage)?;
        let mut names = Vec::new();
        for row in rows {
            let name = row.map_err(Error::storage)?;
            if !name.starts_with(RESERVED_SHADOW_PREFIX) {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Drop a soup together with any unfinished alteration of it
    ///
    /// Removing an absent soup is a no-op.
    pub(crate) fn remove_soup(&mut self, soup: &str) -> Result<()> {
        if soup.starts_with(RESERVED_SHADOW_PREFIX) {
            return Ok(());
        }
        let shadow = shadow_soup_name(soup);
        let tx = self.conn.unchecked_transaction().map_err(Error::storage)?;
        let mut dropped = Vec::new();
        for name in [soup, shadow.as_str()] {
            if let Some(layout) = load_layout(&tx, name)? {
                drop_soup(&tx, &layout)?;
                dropped.push(layout);
            }
        }
        let discarded = long_ops::delete_alters_for(&tx, soup)?;
        tx.commit().map_err(Error::storage)?;
        self.invalidate_schema_caches();

        for layout in &dropped {
            self.external.remove_soup_dir_after_commit(&layout.table);
        }
        // An interrupted alteration may still own the previous table's files
        for old_table in discarded {
            self.external.remove_soup_dir_after_commit(&old_table);
        }
        if !dropped.is_empty() {
            info!(target: "soupstore::registry", soup, "Removed soup");
        }
        Ok(())
    }

    pub(crate) fn remove_all_soups(&mut self) -> Result<()> {
        for name in self.all_soup_names()? {
            self.remove_soup(&name)?;
        }
        Ok(())
    }
}
