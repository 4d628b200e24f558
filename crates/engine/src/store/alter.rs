//! Alter-soup state machine
//!
//! An alteration builds the new layout under a shadow soup, copies every
//! entry across, swaps the shadow in under the soup's name and finally
//! removes what is left of the old layout. Each phase commits together with
//! the status update that records it, so after a crash the persisted status
//! names the last phase that fully happened.
//!
//! Every phase can be re-run from its start:
//!
//! - `SchemaBuilt` drops any shadow left by an earlier attempt first
//! - `DataReindexed` empties the shadow (rows and files) before copying
//! - `OldDropped` is a single transaction
//! - `Completed` removes the old file directory, which tolerates absence,
//!   then deletes the record

use super::crud::{for_each_document, insert_row, write_fts_row, write_row, RowStamp};
use super::layout::{column_value, SoupLayout};
use super::long_ops::{self, AlterSoupDetails, AlterStatus, LongOperation};
use super::registry::{create_soup, drop_soup, load_layout, validate_indexes};
use super::StoreInner;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use soupstore_core::limits::shadow_soup_name;
use soupstore_core::{Error, Result, SoupIndex, SoupSpec, StorageMode};
use tracing::{debug, info, warn};

fn require_layout(conn: &Connection, name: &str, soup: &str) -> Result<SoupLayout> {
    load_layout(conn, name)?.ok_or_else(|| {
        Error::storage(format!(
            "alteration of soup '{}' lost its layout '{}'",
            soup, name
        ))
    })
}

/// Copy rows with SQL, carrying over columns whose index is unchanged
///
/// Only internal-to-internal copies qualify. Columns of newly added indexes
/// and full-text rows are then computed from the documents.
fn copy_rows_in_place(
    conn: &Connection,
    old: &SoupLayout,
    shadow: &SoupLayout,
) -> Result<usize> {
    let mut target = vec!["id", "soup", "created", "lastModified"];
    let mut source = target.clone();
    let mut added = Vec::new();
    for (index, column) in shadow.value_columns() {
        let carried = old
            .value_columns()
            .find(|(previous, _)| previous.index == index.index);
        match carried {
            Some((_, previous)) => {
                target.push(column);
                source.push(previous);
            }
            None => added.push((index, column)),
        }
    }
    let copied = conn
        .execute(
            &format!(
                "INSERT INTO {} ({}) SELECT {} FROM {}",
                shadow.table,
                target.join(", "),
                source.join(", "),
                old.table
            ),
            [],
        )
        .map_err(Error::storage)?;

    if added.is_empty() && !shadow.has_full_text() {
        return Ok(copied);
    }
    let update = (!added.is_empty()).then(|| {
        format!(
            "UPDATE {} SET {} WHERE id = ?",
            shadow.table,
            added
                .iter()
                .map(|(_, column)| format!("{} = ?", column))
                .collect::<Vec<_>>()
                .join(", ")
        )
    });
    let mut stmt = conn
        .prepare(&format!("SELECT id, soup FROM {} ORDER BY id", shadow.table))
        .map_err(Error::storage)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
        .map_err(Error::storage)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(Error::storage)?;
    for (id, text) in rows {
        let doc: serde_json::Value = serde_json::from_str(&text)?;
        if let Some(sql) = &update {
            let mut values: Vec<SqlValue> = added
                .iter()
                .map(|(index, _)| column_value(&index.index, &doc))
                .collect();
            values.push(SqlValue::Integer(id));
            conn.prepare_cached(sql)
                .and_then(|mut stmt| stmt.execute(params_from_iter(values.iter())))
                .map_err(Error::storage)?;
        }
        if shadow.has_full_text() {
            write_fts_row(conn, shadow, id, &doc)?;
        }
    }
    Ok(copied)
}

/// Start the shadow's id sequence where the old table's left off
///
/// The copy only advances the shadow's sequence to the largest surviving
/// id, which may be below ids already handed out and since deleted.
fn carry_id_sequence(conn: &Connection, old: &SoupLayout, shadow: &SoupLayout) -> Result<()> {
    let high_water: Option<i64> = conn
        .query_row(
            "SELECT max(seq) FROM sqlite_sequence WHERE name IN (?1, ?2)",
            params![old.table, shadow.table],
            |row| row.get(0),
        )
        .map_err(Error::storage)?;
    conn.execute(
        "DELETE FROM sqlite_sequence WHERE name = ?1",
        params![shadow.table],
    )
    .map_err(Error::storage)?;
    if let Some(seq) = high_water {
        conn.execute(
            "INSERT INTO sqlite_sequence (name, seq) VALUES (?1, ?2)",
            params![shadow.table, seq],
        )
        .map_err(Error::storage)?;
    }
    Ok(())
}

impl StoreInner {
    /// Alter indexes and storage mode of `soup`, running every phase
    pub(crate) fn alter_soup(
        &mut self,
        soup: &str,
        spec: &SoupSpec,
        indexes: &[SoupIndex],
        reindex_data: bool,
    ) -> Result<()> {
        self.alter_soup_until(soup, spec, indexes, reindex_data, None)
            .map(|_| ())
    }

    /// Start an alteration and run it up to and including `stop_after`
    ///
    /// Returns the last phase that committed. A stopped alteration stays
    /// pending until [`StoreInner::resume_long_operations`] finishes it.
    pub(crate) fn alter_soup_until(
        &mut self,
        soup: &str,
        spec: &SoupSpec,
        indexes: &[SoupIndex],
        reindex_data: bool,
        stop_after: Option<AlterStatus>,
    ) -> Result<AlterStatus> {
        if spec.name != soup {
            return Err(Error::invalid_argument(format!(
                "cannot alter soup '{}' into '{}'; renaming is not supported",
                soup, spec.name
            )));
        }
        let layout = self.user_layout(soup)?;
        self.ensure_no_pending_alter(soup)?;
        validate_indexes(soup, spec.storage, indexes)?;

        let details = AlterSoupDetails {
            soup_name: soup.to_string(),
            shadow_name: shadow_soup_name(soup),
            old_table: layout.table.clone(),
            old_storage: layout.storage,
            new_storage: spec.storage,
            old_indexes: layout.indexes(),
            new_indexes: indexes.to_vec(),
            reindex_data,
        };
        let id = long_ops::insert_alter(&self.conn, &details)?;
        info!(
            target: "soupstore::alter",
            soup,
            from = %layout.storage,
            to = %spec.storage,
            indexes = indexes.len(),
            reindex_data,
            "Starting soup alteration"
        );
        self.run_alter(id, &details, AlterStatus::NotStarted, stop_after)
    }

    /// Advance a recorded alteration from `status`
    fn run_alter(
        &mut self,
        id: i64,
        details: &AlterSoupDetails,
        mut status: AlterStatus,
        stop_after: Option<AlterStatus>,
    ) -> Result<AlterStatus> {
        while let Some(next) = status.next() {
            if stop_after.is_some_and(|stop| status >= stop) {
                break;
            }
            match next {
                AlterStatus::SchemaBuilt => self.build_shadow(id, details)?,
                AlterStatus::DataReindexed => self.copy_entries(id, details)?,
                AlterStatus::OldDropped => self.swap_shadow(id, details)?,
                AlterStatus::Completed => self.finish_alter(id, details)?,
                AlterStatus::NotStarted => {}
            }
            status = next;
            info!(target: "soupstore::alter", soup = %details.soup_name, phase = %status, "Alteration phase committed");
        }
        Ok(status)
    }

    fn build_shadow(&mut self, id: i64, details: &AlterSoupDetails) -> Result<()> {
        let tx = self.conn.unchecked_transaction().map_err(Error::storage)?;
        let stale = load_layout(&tx, &details.shadow_name)?;
        if let Some(stale) = &stale {
            drop_soup(&tx, stale)?;
        }
        let shadow = create_soup(
            &tx,
            &details.shadow_name,
            details.new_storage,
            &details.new_indexes,
        )?;
        long_ops::update_status(&tx, id, AlterStatus::SchemaBuilt)?;
        tx.commit().map_err(Error::storage)?;
        self.invalidate_schema_caches();

        if let Some(stale) = stale {
            self.external.remove_soup_dir(&stale.table)?;
        }
        debug!(target: "soupstore::alter", soup = %details.soup_name, shadow = %shadow.table, "Built shadow soup");
        Ok(())
    }

    fn copy_entries(&mut self, id: i64, details: &AlterSoupDetails) -> Result<()> {
        let old = require_layout(&self.conn, &details.soup_name, &details.soup_name)?;
        let shadow = require_layout(&self.conn, &details.shadow_name, &details.soup_name)?;
        // Files of an interrupted earlier copy
        self.external.remove_soup_dir(&shadow.table)?;

        let tx = self.conn.unchecked_transaction().map_err(Error::storage)?;
        tx.execute(&format!("DELETE FROM {}", shadow.table), [])
            .map_err(Error::storage)?;
        if shadow.has_full_text() {
            tx.execute(&format!("DELETE FROM {}", shadow.fts_table()), [])
                .map_err(Error::storage)?;
        }

        let in_place = !details.reindex_data
            && old.storage == StorageMode::Internal
            && shadow.storage == StorageMode::Internal;
        let copied = if in_place {
            copy_rows_in_place(&tx, &old, &shadow)?
        } else {
            let mut copied = 0usize;
            for_each_document(&tx, &self.external, &old, |stamp, doc| {
                insert_row(&tx, &shadow, Some(stamp.id), stamp.created, stamp.last_modified)?;
                write_row(&tx, &self.external, &shadow, stamp, &doc, None)?;
                copied += 1;
                Ok(())
            })?;
            copied
        };
        carry_id_sequence(&tx, &old, &shadow)?;
        long_ops::update_status(&tx, id, AlterStatus::DataReindexed)?;
        tx.commit().map_err(Error::storage)?;
        debug!(target: "soupstore::alter", soup = %details.soup_name, copied, in_place, "Copied entries into shadow soup");
        Ok(())
    }

    fn swap_shadow(&mut self, id: i64, details: &AlterSoupDetails) -> Result<()> {
        let tx = self.conn.unchecked_transaction().map_err(Error::storage)?;
        let old = require_layout(&tx, &details.soup_name, &details.soup_name)?;
        drop_soup(&tx, &old)?;
        for table in ["soup_names", "soup_index_map"] {
            tx.execute(
                &format!("UPDATE {} SET soupName = ?1 WHERE soupName = ?2", table),
                params![details.soup_name, details.shadow_name],
            )
            .map_err(Error::storage)?;
        }
        long_ops::update_status(&tx, id, AlterStatus::OldDropped)?;
        tx.commit().map_err(Error::storage)?;
        self.invalidate_schema_caches();
        Ok(())
    }

    fn finish_alter(&mut self, id: i64, details: &AlterSoupDetails) -> Result<()> {
        if details.old_storage == StorageMode::External {
            self.external.remove_soup_dir(&details.old_table)?;
        }
        long_ops::delete(&self.conn, id)
    }

    /// Finish every unfinished long operation from its recorded phase
    ///
    /// Operations are attempted independently; the first failure is returned
    /// after all have been tried and its record stays for the next call.
    pub(crate) fn resume_long_operations(&mut self) -> Result<usize> {
        let mut completed = 0;
        let mut first_error = None;
        for op in long_ops::list(&self.conn)? {
            let LongOperation {
                id,
                details,
                status,
                ..
            } = op;
            info!(target: "soupstore::alter", soup = %details.soup_name, phase = %status, "Resuming soup alteration");
            match self.run_alter(id, &details, status, None) {
                Ok(_) => completed += 1,
                Err(e) => {
                    warn!(target: "soupstore::alter", soup = %details.soup_name, error = %e, "Soup alteration failed to resume");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(completed),
        }
    }

    pub(crate) fn long_operations(&self) -> Result<Vec<LongOperation>> {
        long_ops::list(&self.conn)
    }
}
