//! Soup store: one open container and its serialized operation queue
//!
//! A [`SoupStore`] owns the SQLite connection of one container together with
//! the per-store caches. Every operation, read or write, is funneled through
//! a fair mutex so operations run one at a time in arrival order and no read
//! ever observes a half-applied batch.
//!
//! ## Opening
//!
//! 1. Take the advisory lock file beside the container
//! 2. Discard the leftovers of an interrupted re-encryption
//! 3. Key the connection and verify the key; on failure try the legacy
//!    passphrase and, if it works, migrate the container to the current key
//! 4. Apply connection pragmas, create or check the metadata tables
//! 5. Install re-sealed external files staged by a completed rotation
//! 6. Resume unfinished long operations

mod alter;
mod compiler;
mod crud;
mod external;
mod layout;
mod long_ops;
mod query;
mod registry;
mod schema;

pub use long_ops::{AlterSoupDetails, AlterStatus, LongOperation, LongOperationKind};
pub use schema::SCHEMA_VERSION;

use crate::crypto::{self, Keying, LegacyKeyProvider};
use crate::manager::config::StoreConfig;
use crate::manager::paths::{StorePaths, StoreScope};
use chrono::Utc;
use compiler::SmartSqlCache;
use external::ExternalStorage;
use layout::SoupLayout;
use parking_lot::FairMutex;
use rusqlite::Connection;
use serde_json::Value;
use soupstore_core::{Error, QuerySpec, Result, SoupIndex, SoupSpec, StorageMode};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

// ============================================================================
// Store internals
// ============================================================================

/// Millisecond clock that never repeats a value within one store
#[derive(Debug, Default)]
pub(crate) struct Clock {
    last: i64,
}

impl Clock {
    pub(crate) fn tick(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis();
        self.last = now.max(self.last + 1);
        self.last
    }
}

/// Explain-plan capture toggle and the last captured plan
#[derive(Debug, Default)]
pub(crate) struct ExplainCapture {
    pub capture: bool,
    pub last: Option<Value>,
}

/// State owned by the serialized queue of one open store
pub(crate) struct StoreInner {
    pub(crate) conn: Connection,
    pub(crate) layouts: HashMap<String, Arc<SoupLayout>>,
    pub(crate) smart_sql: SmartSqlCache,
    pub(crate) clock: Clock,
    pub(crate) external: ExternalStorage,
    pub(crate) explain: ExplainCapture,
    keying: Keying,
    config: StoreConfig,
    /// Advisory lock held for as long as the container is open
    lock: File,
}

fn open_connection(path: &Path, keying: &Keying, config: &StoreConfig) -> Result<Connection> {
    let conn = Connection::open(path).map_err(Error::storage)?;
    crypto::apply_key(&conn, keying)?;
    crypto::verify_key(&conn)?;
    conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
        .map_err(Error::storage)?;
    conn.pragma_update(None, "journal_mode", config.journal_mode.as_str())
        .map_err(Error::storage)?;
    conn.pragma_update(None, "synchronous", config.synchronous.as_str())
        .map_err(Error::storage)?;
    Ok(conn)
}

fn acquire_lock(paths: &StorePaths) -> Result<File> {
    let lock_path = paths.lock_file();
    let lock = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&lock_path)
        .map_err(|e| Error::storage(format!("failed to open lock file: {}", e)))?;
    fs2::FileExt::try_lock_exclusive(&lock).map_err(|_| {
        Error::storage(format!(
            "store '{}' is already in use by another process",
            paths.database().display()
        ))
    })?;
    Ok(lock)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::storage(format!(
            "failed to remove '{}': {}",
            path.display(),
            e
        ))),
    }
}

/// Re-encrypt the container behind `conn` from `from` to `to`
///
/// The container is exported into a sibling file and external entries are
/// re-sealed into staged siblings. Only then is the connection closed and
/// the export renamed over the original; staged entries are installed last.
/// A crash before the rename leaves the original intact and the staged
/// files are discarded at the next open; a crash after it is finished at the
/// next open.
fn migrate_container(conn: Connection, paths: &StorePaths, from: &Keying, to: &Keying) -> Result<()> {
    let target = paths.rekey_database();
    remove_if_exists(&target)?;

    let staging = ExternalStorage::new(paths.external_dir(), from.entry_codec(), false);
    let next_codec = to.entry_codec();
    let staged = crypto::export_rekeyed(&conn, &target, to)
        .and_then(|_| staging.stage_reseal(next_codec.as_ref()));
    let staged = match staged {
        Ok(staged) => staged,
        Err(e) => {
            staging.discard_reseal();
            let _ = remove_if_exists(&target);
            return Err(e);
        }
    };

    conn.close().map_err(|(_, e)| Error::storage(e))?;
    for sidecar in paths.database_files().iter().skip(1) {
        remove_if_exists(sidecar)?;
    }
    fs::rename(&target, paths.database()).map_err(|e| {
        Error::storage(format!("failed to install re-encrypted container: {}", e))
    })?;
    let installed = ExternalStorage::new(paths.external_dir(), next_codec, false).finish_reseal()?;
    info!(target: "soupstore::crypto", store = paths.name(), staged, installed, "Re-encrypted container");
    Ok(())
}

impl StoreInner {
    fn open(paths: &StorePaths, lock: File, keying: Keying, config: StoreConfig) -> Result<Self> {
        let conn = open_connection(&paths.database(), &keying, &config)?;
        schema::initialize(&conn)?;

        let external = ExternalStorage::new(
            paths.external_dir(),
            keying.entry_codec(),
            config.verify_external_entries,
        );
        let installed = external.finish_reseal()?;
        if installed > 0 {
            info!(target: "soupstore::crypto", store = paths.name(), installed, "Installed re-sealed external entries");
        }

        Ok(Self {
            conn,
            layouts: HashMap::new(),
            smart_sql: SmartSqlCache::new(config.smart_sql_cache_size),
            clock: Clock::default(),
            external,
            explain: ExplainCapture {
                capture: config.capture_explain_query_plan,
                last: None,
            },
            keying,
            config,
            lock,
        })
    }

    /// Ids currently stored in an external soup, with its table
    fn live_external_ids(&mut self, soup: &str) -> Result<Option<(String, HashSet<i64>)>> {
        let layout = self.user_layout(soup)?;
        if layout.storage != StorageMode::External {
            return Ok(None);
        }
        let ids = crud::all_ids(&self.conn, &layout)?.into_iter().collect();
        Ok(Some((layout.table.clone(), ids)))
    }

    fn external_usage(&mut self, soup: &str) -> Result<(usize, u64)> {
        match self.live_external_ids(soup)? {
            Some((table, live)) => self.external.usage(&table, &live),
            None => Ok((0, 0)),
        }
    }

    fn purge_orphaned_external_files(&mut self, soup: &str) -> Result<usize> {
        let Some((table, live)) = self.live_external_ids(soup)? else {
            return Ok(0);
        };
        let purged = self.external.purge_orphans(&table, &live)?;
        if purged > 0 {
            warn!(target: "soupstore::store", soup, purged, "Purged orphaned external entries");
        }
        Ok(purged)
    }

    fn database_size(&self) -> Result<u64> {
        let pages: i64 = self
            .conn
            .query_row("PRAGMA page_count", [], |row| row.get(0))
            .map_err(Error::storage)?;
        let page_size: i64 = self
            .conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))
            .map_err(Error::storage)?;
        Ok((pages.max(0) as u64) * (page_size.max(0) as u64))
    }
}

// ============================================================================
// SoupStore
// ============================================================================

/// What the manager resolved for one open
pub(crate) struct OpenRequest {
    pub paths: StorePaths,
    pub scope: StoreScope,
    pub keying: Keying,
    pub legacy: Option<LegacyKeyProvider>,
    pub config: StoreConfig,
    pub registry_key: PathBuf,
}

/// One open store
///
/// Obtained from [`crate::StoreManager`]; every handle to the same name and
/// scope within a process is the same `Arc<SoupStore>`.
pub struct SoupStore {
    paths: StorePaths,
    scope: StoreScope,
    registry_key: PathBuf,
    inner: FairMutex<Option<StoreInner>>,
    data_protection_available: AtomicBool,
}

impl std::fmt::Debug for SoupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoupStore")
            .field("name", &self.paths.name())
            .field("scope", &self.scope)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SoupStore {
    /// Open the container described by `request`
    pub(crate) fn open(request: OpenRequest) -> Result<Self> {
        let OpenRequest {
            paths,
            scope,
            keying,
            legacy,
            config,
            registry_key,
        } = request;
        paths.create_directories()?;
        let lock = acquire_lock(&paths)?;

        let rekey_path = paths.rekey_database();
        if rekey_path.exists() {
            warn!(target: "soupstore::crypto", store = paths.name(), "Discarding interrupted re-encryption");
            remove_if_exists(&rekey_path)?;
        }

        let existed = paths.exists();
        let mut inner = match StoreInner::open(&paths, lock.try_clone()?, keying.clone(), config.clone()) {
            Ok(inner) => inner,
            Err(Error::Encryption(reason)) if existed && keying.is_encrypted() => {
                let Some(passphrase) = legacy.as_ref().and_then(|provider| provider()) else {
                    return Err(Error::Encryption(reason));
                };
                let legacy_keying = Keying::Passphrase(passphrase);
                let conn = open_connection(&paths.database(), &legacy_keying, &config)
                    .map_err(|_| Error::Encryption(reason))?;
                info!(target: "soupstore::crypto", store = paths.name(), "Migrating container from legacy key");
                migrate_container(conn, &paths, &legacy_keying, &keying)?;
                StoreInner::open(&paths, lock.try_clone()?, keying, config)?
            }
            Err(e) => return Err(e),
        };
        drop(lock);

        if let Err(e) = inner.resume_long_operations() {
            warn!(target: "soupstore::store", store = paths.name(), error = %e, "Long operations left unfinished at open");
        }
        info!(
            target: "soupstore::store",
            store = paths.name(),
            scope = %scope,
            encrypted = inner.keying.is_encrypted(),
            "Opened store"
        );

        Ok(Self {
            paths,
            scope,
            registry_key,
            inner: FairMutex::new(Some(inner)),
            data_protection_available: AtomicBool::new(false),
        })
    }

    /// Run `f` on the queue
    fn with_inner<T>(&self, f: impl FnOnce(&mut StoreInner) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.lock();
        let inner = guard
            .as_mut()
            .ok_or_else(|| Error::Closed(self.paths.name().to_string()))?;
        f(inner)
    }

    /// Store name
    pub fn name(&self) -> &str {
        self.paths.name()
    }

    /// Scope the store belongs to
    pub fn scope(&self) -> &StoreScope {
        &self.scope
    }

    /// Path of the container file
    pub fn database_path(&self) -> PathBuf {
        self.paths.database()
    }

    // ------------------------------------------------------------------
    // Soup registry
    // ------------------------------------------------------------------

    /// Whether `soup` is registered
    pub fn soup_exists(&self, soup: &str) -> Result<bool> {
        self.with_inner(|inner| inner.soup_exists(soup))
    }

    /// Register an internally stored soup
    ///
    /// Re-registering with the same set of indexes is a no-op; any other
    /// index set fails with `SchemaConflict`.
    pub fn register_soup(&self, soup: &str, indexes: &[SoupIndex]) -> Result<()> {
        self.register_soup_with_spec(&SoupSpec::new(soup), indexes)
    }

    /// Register a soup with an explicit storage mode
    pub fn register_soup_with_spec(&self, spec: &SoupSpec, indexes: &[SoupIndex]) -> Result<()> {
        self.with_inner(|inner| inner.register_soup(spec, indexes))
    }

    /// Name and storage mode of `soup`
    pub fn soup_spec(&self, soup: &str) -> Result<SoupSpec> {
        self.with_inner(|inner| inner.soup_spec(soup))
    }

    /// Index specs of `soup` in declaration order
    pub fn indices_for_soup(&self, soup: &str) -> Result<Vec<SoupIndex>> {
        self.with_inner(|inner| inner.indices_for_soup(soup))
    }

    /// Drop `soup` and its entries; absent soups are ignored
    pub fn remove_soup(&self, soup: &str) -> Result<()> {
        self.with_inner(|inner| inner.remove_soup(soup))
    }

    /// Drop every soup
    pub fn remove_all_soups(&self) -> Result<()> {
        self.with_inner(|inner| inner.remove_all_soups())
    }

    /// Names of all registered soups, sorted
    pub fn all_soup_names(&self) -> Result<Vec<String>> {
        self.with_inner(|inner| inner.all_soup_names())
    }

    // ------------------------------------------------------------------
    // Entries
    // ------------------------------------------------------------------

    /// Insert or update a batch of entries atomically
    ///
    /// An entry whose `_soupEntryId` names an existing entry updates it; any
    /// other entry is inserted. Returns the entries as stored.
    pub fn upsert_entries(&self, soup: &str, entries: Vec<Value>) -> Result<Vec<Value>> {
        self.with_inner(|inner| inner.upsert_entries(soup, entries, None))
    }

    /// Insert or update a batch, matching existing entries on an indexed path
    pub fn upsert_entries_with_external_id(
        &self,
        soup: &str,
        entries: Vec<Value>,
        external_id_path: &str,
    ) -> Result<Vec<Value>> {
        self.with_inner(|inner| inner.upsert_entries(soup, entries, Some(external_id_path)))
    }

    /// Entries with the given ids; missing ids are omitted
    pub fn retrieve_entries(&self, soup: &str, ids: &[i64]) -> Result<Vec<Value>> {
        self.with_inner(|inner| inner.retrieve_entries(soup, ids))
    }

    /// Delete entries by id; missing ids are ignored
    pub fn remove_entries(&self, soup: &str, ids: &[i64]) -> Result<()> {
        self.with_inner(|inner| inner.remove_entries(soup, ids))
    }

    /// Delete the entries on the first page of `spec`
    pub fn remove_entries_by_query(&self, soup: &str, spec: &QuerySpec) -> Result<()> {
        self.with_inner(|inner| inner.remove_entries_by_query(soup, spec))
    }

    /// Delete every entry of `soup`, keeping it registered
    pub fn clear_soup(&self, soup: &str) -> Result<()> {
        self.with_inner(|inner| inner.clear_soup(soup))
    }

    /// Id of the single entry whose indexed `path` equals `value`
    pub fn lookup_soup_entry_id(&self, soup: &str, path: &str, value: &Value) -> Result<i64> {
        self.with_inner(|inner| inner.lookup_soup_entry_id(soup, path, value))
    }

    /// Ids of entries whose `__local__` flag is set
    pub fn dirty_entry_ids(&self, soup: &str) -> Result<Vec<i64>> {
        self.with_inner(|inner| inner.dirty_entry_ids(soup))
    }

    /// Recompute the index columns of `paths` for every entry
    pub fn re_index_soup(&self, soup: &str, paths: &[String]) -> Result<()> {
        self.with_inner(|inner| inner.re_index_soup(soup, paths))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Page `page_index` of `spec`
    pub fn query(&self, spec: &QuerySpec, page_index: usize) -> Result<Vec<Value>> {
        self.with_inner(|inner| inner.query(spec, page_index, &[]))
    }

    /// Page `page_index` of a smart query with positional bind arguments
    pub fn query_with_args(
        &self,
        spec: &QuerySpec,
        page_index: usize,
        args: &[Value],
    ) -> Result<Vec<Value>> {
        self.with_inner(|inner| inner.query(spec, page_index, args))
    }

    /// Number of results of `spec`
    pub fn count(&self, spec: &QuerySpec) -> Result<usize> {
        self.with_inner(|inner| inner.count(spec, &[]))
    }

    /// Number of results of a smart query with bind arguments
    pub fn count_with_args(&self, spec: &QuerySpec, args: &[Value]) -> Result<usize> {
        self.with_inner(|inner| inner.count(spec, args))
    }

    /// Page `page_index` of `spec` as JSON text
    pub fn query_as_string(&self, spec: &QuerySpec, page_index: usize) -> Result<String> {
        self.with_inner(|inner| inner.query_as_string(spec, page_index, &[]))
    }

    // ------------------------------------------------------------------
    // Alteration
    // ------------------------------------------------------------------

    /// Replace the indexes of `soup`, keeping its storage mode
    pub fn alter_soup(&self, soup: &str, indexes: &[SoupIndex], reindex_data: bool) -> Result<()> {
        self.with_inner(|inner| {
            let spec = inner.soup_spec(soup)?;
            inner.alter_soup(soup, &spec, indexes, reindex_data)
        })
    }

    /// Replace the indexes and storage mode of `soup`
    pub fn alter_soup_with_spec(
        &self,
        soup: &str,
        spec: &SoupSpec,
        indexes: &[SoupIndex],
        reindex_data: bool,
    ) -> Result<()> {
        self.with_inner(|inner| inner.alter_soup(soup, spec, indexes, reindex_data))
    }

    /// Start an alteration and stop once `stop_after` has committed
    ///
    /// `None` runs to completion. Returns the last committed phase; the
    /// remaining phases run on the next [`SoupStore::resume_long_operations`].
    pub fn alter_soup_until(
        &self,
        soup: &str,
        spec: &SoupSpec,
        indexes: &[SoupIndex],
        reindex_data: bool,
        stop_after: Option<AlterStatus>,
    ) -> Result<AlterStatus> {
        self.with_inner(|inner| {
            inner.alter_soup_until(soup, spec, indexes, reindex_data, stop_after)
        })
    }

    /// Finish every unfinished long operation, returning how many completed
    pub fn resume_long_operations(&self) -> Result<usize> {
        self.with_inner(|inner| inner.resume_long_operations())
    }

    /// Unfinished long operations
    pub fn long_operations(&self) -> Result<Vec<LongOperation>> {
        self.with_inner(|inner| inner.long_operations())
    }

    // ------------------------------------------------------------------
    // External storage accounting
    // ------------------------------------------------------------------

    /// Number of external entry files backing live entries of `soup`
    pub fn external_file_count(&self, soup: &str) -> Result<usize> {
        self.with_inner(|inner| inner.external_usage(soup).map(|(count, _)| count))
    }

    /// Total size in bytes of the external entry files of `soup`
    pub fn external_file_size(&self, soup: &str) -> Result<u64> {
        self.with_inner(|inner| inner.external_usage(soup).map(|(_, size)| size))
    }

    /// Delete external files no entry refers to
    pub fn purge_orphaned_external_files(&self, soup: &str) -> Result<usize> {
        self.with_inner(|inner| inner.purge_orphaned_external_files(soup))
    }

    /// Size of the container file in bytes
    pub fn database_size(&self) -> Result<u64> {
        self.with_inner(|inner| inner.database_size())
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Capture the plan of every following query
    pub fn set_capture_explain_query_plan(&self, capture: bool) -> Result<()> {
        self.with_inner(|inner| {
            inner.explain.capture = capture;
            if !capture {
                inner.explain.last = None;
            }
            Ok(())
        })
    }

    /// Plan of the last query run while capture was on
    pub fn last_explain_query_plan(&self) -> Result<Option<Value>> {
        self.with_inner(|inner| Ok(inner.explain.last.clone()))
    }

    /// SQLCipher version, `None` when built against plain SQLite
    pub fn sqlcipher_version(&self) -> Result<Option<String>> {
        self.with_inner(|inner| crypto::cipher_version(&inner.conn))
    }

    /// Compile-time options of the linked SQLite
    pub fn compile_options(&self) -> Result<Vec<String>> {
        self.with_inner(|inner| crypto::pragma_rows(&inner.conn, "compile_options"))
    }

    /// Cipher settings of the open connection; empty on plain SQLite
    pub fn runtime_settings(&self) -> Result<Vec<String>> {
        self.with_inner(|inner| crypto::pragma_rows(&inner.conn, "cipher_settings"))
    }

    /// Record whether the platform's file data protection is available
    pub fn set_file_data_protection_available(&self, available: bool) {
        self.data_protection_available
            .store(available, Ordering::SeqCst);
    }

    /// Last value given to [`SoupStore::set_file_data_protection_available`]
    pub fn is_file_data_protection_active(&self) -> bool {
        self.data_protection_available.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Re-encrypt the container and its external entries under `new_key`
    ///
    /// The key provider must return `new_key` from now on.
    pub fn rekey(&self, new_key: &[u8]) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = guard
            .take()
            .ok_or_else(|| Error::Closed(self.paths.name().to_string()))?;
        let next = match inner.keying.with_key(new_key) {
            Ok(next) => next,
            Err(e) => {
                *guard = Some(inner);
                return Err(e);
            }
        };

        let StoreInner {
            conn,
            keying,
            config,
            lock,
            ..
        } = inner;
        if let Err(e) = migrate_container(conn, &self.paths, &keying, &next) {
            match StoreInner::open(&self.paths, lock, keying, config) {
                Ok(reopened) => *guard = Some(reopened),
                Err(reopen) => {
                    warn!(target: "soupstore::store", store = self.paths.name(), error = %reopen, "Store left closed after failed rekey");
                }
            }
            return Err(e);
        }
        *guard = Some(StoreInner::open(&self.paths, lock, next, config)?);
        info!(target: "soupstore::store", store = self.paths.name(), "Rekeyed store");
        Ok(())
    }

    /// Close the connection and release the lock file
    ///
    /// Later operations fail with `Closed`. Closing twice is a no-op.
    pub fn close(&self) {
        if self.inner.lock().take().is_some() {
            info!(target: "soupstore::store", store = self.paths.name(), "Closed store");
        }
    }

    /// Whether [`SoupStore::close`] has run
    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }
}

impl Drop for SoupStore {
    fn drop(&mut self) {
        crate::manager::registry::forget(&self.registry_key);
    }
}
