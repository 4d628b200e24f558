//! External entry storage
//!
//! Externally stored soups keep each document in its own file,
//! `<store>_external/TABLE_<n>/<id>.entry`, sealed with the store's entry
//! codec. Files are written before the owning transaction commits; a
//! [`WriteJournal`] remembers what each write replaced so a failed batch can
//! put the previous bytes back. Deletes happen after commit, so a crash can
//! leave orphan files behind. Accounting only counts files whose id is still
//! present in the soup table.

use crate::crypto::EntryCodec;
use serde_json::Value;
use soupstore_core::{Error, Result};
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const ENTRY_EXTENSION: &str = "entry";
const REKEY_EXTENSION: &str = "rekey";
const TMP_EXTENSION: &str = "tmp";

/// File-backed document storage for one store
pub(crate) struct ExternalStorage {
    root: PathBuf,
    codec: Arc<dyn EntryCodec>,
    verify_writes: bool,
}

impl ExternalStorage {
    pub(crate) fn new(root: PathBuf, codec: Arc<dyn EntryCodec>, verify_writes: bool) -> Self {
        Self {
            root,
            codec,
            verify_writes,
        }
    }

    pub(crate) fn soup_dir(&self, table: &str) -> PathBuf {
        self.root.join(table)
    }

    pub(crate) fn entry_path(&self, table: &str, id: i64) -> PathBuf {
        self.soup_dir(table)
            .join(format!("{}.{}", id, ENTRY_EXTENSION))
    }

    /// Seal and write `doc` as entry `id`
    pub(crate) fn write(&self, table: &str, id: i64, doc: &Value) -> Result<()> {
        let path = self.entry_path(table, id);
        let raw = serde_json::to_vec(doc)?;
        let sealed = self
            .codec
            .encode(&raw)
            .map_err(|e| Error::encryption(format!("failed to seal entry {}: {}", id, e)))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| io_error("create external directory", parent, e))?;
        }
        write_atomically(&path, &sealed)?;
        if self.verify_writes {
            let back = self.read_raw(table, id)?;
            if back != raw {
                return Err(Error::storage(format!(
                    "external entry {} did not read back as written",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    /// Read and decode entry `id`
    pub(crate) fn read(&self, table: &str, id: i64) -> Result<Value> {
        let raw = self.read_raw(table, id)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Decoded JSON text of entry `id`
    pub(crate) fn read_string(&self, table: &str, id: i64) -> Result<String> {
        let raw = self.read_raw(table, id)?;
        String::from_utf8(raw).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn read_raw(&self, table: &str, id: i64) -> Result<Vec<u8>> {
        let path = self.entry_path(table, id);
        let sealed = fs::read(&path).map_err(|e| io_error("read external entry", &path, e))?;
        self.codec
            .decode(&sealed)
            .map_err(|e| Error::encryption(format!("failed to open {}: {}", path.display(), e)))
    }

    /// Delete entry `id`; a missing file is not an error
    pub(crate) fn remove(&self, table: &str, id: i64) -> Result<()> {
        let path = self.entry_path(table, id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("remove external entry", &path, e)),
        }
    }

    /// Delete entries after a committed removal, logging failures
    ///
    /// The rows are already gone, so a file left behind is only an orphan.
    pub(crate) fn remove_after_commit(&self, table: &str, ids: &[i64]) {
        for id in ids {
            if let Err(e) = self.remove(table, *id) {
                warn!(target: "soupstore::store", table, id, error = %e, "Leaving orphaned external entry");
            }
        }
    }

    /// Delete every file of a soup after a committed removal, logging failures
    pub(crate) fn remove_soup_dir_after_commit(&self, table: &str) {
        if let Err(e) = self.remove_soup_dir(table) {
            warn!(target: "soupstore::store", table, error = %e, "Leaving orphaned external directory");
        }
    }

    /// Delete every file of a soup
    pub(crate) fn remove_soup_dir(&self, table: &str) -> Result<()> {
        let dir = self.soup_dir(table);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("remove external directory", &dir, e)),
        }
    }

    /// Entry files of a soup as `(id, size in bytes)`
    pub(crate) fn list(&self, table: &str) -> Result<Vec<(i64, u64)>> {
        let dir = self.soup_dir(table);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("list external directory", &dir, e)),
        };
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_error("list external directory", &dir, e))?;
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != ENTRY_EXTENSION) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<i64>().ok())
            else {
                continue;
            };
            let size = entry
                .metadata()
                .map_err(|e| io_error("stat external entry", &path, e))?
                .len();
            files.push((id, size));
        }
        files.sort_unstable();
        Ok(files)
    }

    /// Count and total size of the files whose id is in `live`
    pub(crate) fn usage(&self, table: &str, live: &HashSet<i64>) -> Result<(usize, u64)> {
        Ok(self
            .list(table)?
            .into_iter()
            .filter(|(id, _)| live.contains(id))
            .fold((0, 0), |(count, bytes), (_, size)| (count + 1, bytes + size)))
    }

    /// Delete files whose id is not in `live`, returning how many went
    pub(crate) fn purge_orphans(&self, table: &str, live: &HashSet<i64>) -> Result<usize> {
        let mut purged = 0;
        for (id, _) in self.list(table)? {
            if !live.contains(&id) {
                self.remove(table, id)?;
                purged += 1;
            }
        }
        debug!(target: "soupstore::store", table, purged, "Purged orphaned external entries");
        Ok(purged)
    }

    // =========================================================================
    // Re-sealing during key rotation
    // =========================================================================

    /// Re-seal every entry under `next`, staging the results beside the originals
    pub(crate) fn stage_reseal(&self, next: &dyn EntryCodec) -> Result<usize> {
        let mut staged = 0;
        for dir in self.soup_dirs()? {
            let table = dir_name(&dir);
            for (id, _) in self.list(&table)? {
                let raw = self.read_raw(&table, id)?;
                let sealed = next
                    .encode(&raw)
                    .map_err(|e| Error::encryption(format!("failed to re-seal entry {}: {}", id, e)))?;
                let staged_path = self.entry_path(&table, id).with_extension(REKEY_EXTENSION);
                write_atomically(&staged_path, &sealed)?;
                staged += 1;
            }
        }
        Ok(staged)
    }

    /// Move staged re-sealed files over the originals
    ///
    /// Only files that open under this storage's codec are moved; anything
    /// else is a stale staging file and is deleted.
    pub(crate) fn finish_reseal(&self) -> Result<usize> {
        let mut moved = 0;
        for dir in self.soup_dirs()? {
            let entries = fs::read_dir(&dir).map_err(|e| io_error("list external directory", &dir, e))?;
            for entry in entries {
                let path = entry
                    .map_err(|e| io_error("list external directory", &dir, e))?
                    .path();
                if path.extension().map_or(true, |ext| ext != REKEY_EXTENSION) {
                    continue;
                }
                let bytes = fs::read(&path).map_err(|e| io_error("read staged entry", &path, e))?;
                if self.codec.decode(&bytes).is_ok() {
                    let target = path.with_extension(ENTRY_EXTENSION);
                    fs::rename(&path, &target)
                        .map_err(|e| io_error("install staged entry", &target, e))?;
                    moved += 1;
                } else {
                    fs::remove_file(&path)
                        .map_err(|e| io_error("remove staged entry", &path, e))?;
                }
            }
        }
        Ok(moved)
    }

    /// Drop staged files after a failed rotation
    pub(crate) fn discard_reseal(&self) {
        let Ok(dirs) = self.soup_dirs() else {
            return;
        };
        for dir in dirs {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for path in entries.flatten().map(|e| e.path()) {
                if path.extension().map_or(false, |ext| ext == REKEY_EXTENSION) {
                    let _ = fs::remove_file(&path);
                }
            }
        }
    }

    fn soup_dirs(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("list external root", &self.root, e)),
        };
        let mut dirs = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| io_error("list external root", &self.root, e))?
                .path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
        Ok(dirs)
    }
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension(TMP_EXTENSION);
    fs::write(&tmp, bytes).map_err(|e| io_error("write external entry", &tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| io_error("install external entry", path, e))
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> Error {
    Error::storage(format!("failed to {} '{}': {}", action, path.display(), e))
}

// =============================================================================
// Write journal
// =============================================================================

/// Previous contents of every file a batch overwrote
///
/// Rolling back restores each file to what it held before the batch, in
/// reverse order, deleting files the batch created.
#[derive(Default)]
pub(crate) struct WriteJournal {
    entries: Vec<(PathBuf, Option<Vec<u8>>)>,
}

impl WriteJournal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Remember the current contents of `path` before it is overwritten
    pub(crate) fn record(&mut self, path: PathBuf) -> Result<()> {
        if self.entries.iter().any(|(p, _)| *p == path) {
            return Ok(());
        }
        let previous = match fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(io_error("snapshot external entry", &path, e)),
        };
        self.entries.push((path, previous));
        Ok(())
    }

    /// Restore every recorded file
    pub(crate) fn rollback(self) {
        for (path, previous) in self.entries.into_iter().rev() {
            let restored = match previous {
                Some(bytes) => fs::write(&path, bytes),
                None => match fs::remove_file(&path) {
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                    other => other,
                },
            };
            if let Err(e) = restored {
                warn!(target: "soupstore::store", path = %path.display(), error = %e, "Failed to roll back external entry");
            }
        }
    }
}
