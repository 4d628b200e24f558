//! Metadata region
//!
//! Store-wide tables created on first open:
//!
//! - `store_meta(key, value)`: schema version
//! - `soup_names(id, soupName, storage)`: soup registrations; `id` allocates
//!   the physical table `TABLE_<id>`
//! - `soup_index_map(soupName, ordinal, path, columnName, columnType)`: index
//!   specs in declaration order; `columnName` is NULL for json-path indexes
//! - `long_operations_status(id, type, details, status, created,
//!   lastModified)`: unfinished long operations

use rusqlite::{params, Connection, OptionalExtension};
use soupstore_core::{Error, Result};
use tracing::info;

/// Current on-disk schema version
pub const SCHEMA_VERSION: i64 = 1;

const CREATE_METADATA: &str = "
CREATE TABLE IF NOT EXISTS store_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS soup_names (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    soupName TEXT NOT NULL UNIQUE,
    storage TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS soup_index_map (
    soupName TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    path TEXT NOT NULL,
    columnName TEXT,
    columnType TEXT NOT NULL,
    PRIMARY KEY (soupName, ordinal)
);
CREATE TABLE IF NOT EXISTS long_operations_status (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type TEXT NOT NULL,
    details TEXT NOT NULL,
    status TEXT NOT NULL,
    created INTEGER NOT NULL,
    lastModified INTEGER NOT NULL
);
";

/// Create the metadata tables and check the schema version
pub(crate) fn initialize(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction().map_err(Error::storage)?;
    tx.execute_batch(CREATE_METADATA).map_err(Error::storage)?;

    let stored: Option<String> = tx
        .query_row(
            "SELECT value FROM store_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(Error::storage)?;

    match stored {
        None => {
            tx.execute(
                "INSERT INTO store_meta (key, value) VALUES ('schema_version', ?1)",
                params![SCHEMA_VERSION.to_string()],
            )
            .map_err(Error::storage)?;
            info!(target: "soupstore::store", version = SCHEMA_VERSION, "Initialized metadata");
        }
        Some(v) => {
            let version: i64 = v
                .parse()
                .map_err(|_| Error::storage(format!("corrupt schema version '{}'", v)))?;
            if version > SCHEMA_VERSION {
                return Err(Error::unsupported(format!(
                    "store schema version {} is newer than supported version {}",
                    version, SCHEMA_VERSION
                )));
            }
        }
    }

    tx.commit().map_err(Error::storage)
}

/// Stored schema version
pub(crate) fn schema_version(conn: &Connection) -> Result<i64> {
    let v: String = conn
        .query_row(
            "SELECT value FROM store_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .map_err(Error::storage)?;
    v.parse()
        .map_err(|_| Error::storage(format!("corrupt schema version '{}'", v)))
}
