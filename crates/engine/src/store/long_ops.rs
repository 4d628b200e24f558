//! Persisted long operations
//!
//! A long operation is a multi-phase procedure whose progress survives a
//! crash. Each one is a row of `long_operations_status` holding its kind, a
//! JSON details payload written once at start, and the last completed phase.
//! The row is deleted when the operation completes; rows still present at
//! open are resumed from their recorded phase.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use soupstore_core::{Error, Result, SoupIndex, StorageMode};
use std::fmt;
use std::str::FromStr;

/// Kinds of long operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LongOperationKind {
    /// Index or storage change of one soup
    AlterSoup,
}

impl LongOperationKind {
    /// Stable name stored in the `type` column
    pub const fn as_str(self) -> &'static str {
        match self {
            LongOperationKind::AlterSoup => "alter_soup",
        }
    }
}

impl FromStr for LongOperationKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "alter_soup" => Ok(LongOperationKind::AlterSoup),
            other => Err(format!("unknown long operation type '{}'", other)),
        }
    }
}

/// Phases of a soup alteration
///
/// The recorded status is the last phase that committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlterStatus {
    /// Record written, nothing built yet
    NotStarted,
    /// Shadow soup registered with the new indexes
    SchemaBuilt,
    /// Every entry copied into the shadow soup
    DataReindexed,
    /// Shadow swapped in under the soup's name, old table dropped
    OldDropped,
    /// Old files removed and record deleted
    Completed,
}

impl AlterStatus {
    /// Stable name stored in the `status` column
    pub const fn as_str(self) -> &'static str {
        match self {
            AlterStatus::NotStarted => "not_started",
            AlterStatus::SchemaBuilt => "schema_built",
            AlterStatus::DataReindexed => "data_reindexed",
            AlterStatus::OldDropped => "old_dropped",
            AlterStatus::Completed => "completed",
        }
    }

    /// Phase that follows this one
    pub const fn next(self) -> Option<AlterStatus> {
        match self {
            AlterStatus::NotStarted => Some(AlterStatus::SchemaBuilt),
            AlterStatus::SchemaBuilt => Some(AlterStatus::DataReindexed),
            AlterStatus::DataReindexed => Some(AlterStatus::OldDropped),
            AlterStatus::OldDropped => Some(AlterStatus::Completed),
            AlterStatus::Completed => None,
        }
    }
}

impl fmt::Display for AlterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlterStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        [
            AlterStatus::NotStarted,
            AlterStatus::SchemaBuilt,
            AlterStatus::DataReindexed,
            AlterStatus::OldDropped,
            AlterStatus::Completed,
        ]
        .into_iter()
        .find(|status| status.as_str() == s)
        .ok_or_else(|| format!("unknown alter status '{}'", s))
    }
}

/// Everything needed to resume an alteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlterSoupDetails {
    /// Soup being altered
    pub soup_name: String,
    /// Name the new layout is built under until the swap
    pub shadow_name: String,
    /// Physical table of the soup when the alteration began
    pub old_table: String,
    /// Storage mode before
    pub old_storage: StorageMode,
    /// Storage mode after
    pub new_storage: StorageMode,
    /// Index specs before
    pub old_indexes: Vec<SoupIndex>,
    /// Index specs after
    pub new_indexes: Vec<SoupIndex>,
    /// Whether every row is re-read and re-projected during the copy
    pub reindex_data: bool,
}

/// One unfinished long operation
#[derive(Debug, Clone, PartialEq)]
pub struct LongOperation {
    /// Row id
    pub id: i64,
    /// Kind of operation
    pub kind: LongOperationKind,
    /// Details written at start
    pub details: AlterSoupDetails,
    /// Last completed phase
    pub status: AlterStatus,
    /// When the operation started (ms since epoch)
    pub created: i64,
    /// When the status last changed (ms since epoch)
    pub last_modified: i64,
}

/// Record the start of an alteration
pub(crate) fn insert_alter(conn: &Connection, details: &AlterSoupDetails) -> Result<i64> {
    let now = Utc::now().timestamp_millis();
    conn.execute(
        "INSERT INTO long_operations_status (type, details, status, created, lastModified) \
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![
            LongOperationKind::AlterSoup.as_str(),
            serde_json::to_string(details)?,
            AlterStatus::NotStarted.as_str(),
            now
        ],
    )
    .map_err(Error::storage)?;
    Ok(conn.last_insert_rowid())
}

/// Record that `status` committed
pub(crate) fn update_status(conn: &Connection, id: i64, status: AlterStatus) -> Result<()> {
    conn.execute(
        "UPDATE long_operations_status SET status = ?1, lastModified = ?2 WHERE id = ?3",
        params![status.as_str(), Utc::now().timestamp_millis(), id],
    )
    .map_err(Error::storage)?;
    Ok(())
}

pub(crate) fn delete(conn: &Connection, id: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM long_operations_status WHERE id = ?1",
        params![id],
    )
    .map_err(Error::storage)?;
    Ok(())
}

/// Every unfinished operation, oldest first
pub(crate) fn list(conn: &Connection) -> Result<Vec<LongOperation>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, type, details, status, created, lastModified \
             FROM long_operations_status ORDER BY id",
        )
        .map_err(Error::storage)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })
        .map_err(Error::storage)?;

    let mut ops = Vec::new();
    for row in rows {
        let (id, kind, details, status, created, last_modified) = row.map_err(Error::storage)?;
        ops.push(LongOperation {
            id,
            kind: kind.parse().map_err(Error::storage)?,
            details: serde_json::from_str(&details)?,
            status: status.parse().map_err(Error::storage)?,
            created,
            last_modified,
        });
    }
    Ok(ops)
}

/// Unfinished alteration of `soup`, if any
pub(crate) fn pending_alter(conn: &Connection, soup: &str) -> Result<Option<LongOperation>> {
    Ok(list(conn)?
        .into_iter()
        .find(|op| op.kind == LongOperationKind::AlterSoup && op.details.soup_name == soup))
}

/// Delete every alteration record of `soup`, returning their old tables
pub(crate) fn delete_alters_for(conn: &Connection, soup: &str) -> Result<Vec<String>> {
    let mut old_tables = Vec::new();
    for op in list(conn)? {
        if op.kind == LongOperationKind::AlterSoup && op.details.soup_name == soup {
            delete(conn, op.id)?;
            old_tables.push(op.details.old_table);
        }
    }
    Ok(old_tables)
}
