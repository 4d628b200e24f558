//! Process-wide registry of open stores
//!
//! Opening the same store twice returns the same [`SoupStore`]. Entries are
//! weak so a store closes once its last handle is dropped; the store removes
//! its own entry on drop.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use soupstore_core::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Weak;

use super::paths::StorePaths;
use crate::store::SoupStore;

// =============================================================================
// Global Store Registry
// =============================================================================
//
// Keyed by the canonical container path so different spellings of the same
// root resolve to one entry. parking_lot::Mutex avoids poisoning.
//
// Never drop a `SoupStore` handle while holding this lock: the store's Drop
// takes it again.

/// Open stores (canonical container path -> weak handle)
pub(crate) static OPEN_STORES: Lazy<Mutex<HashMap<PathBuf, Weak<SoupStore>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Registry key of a store; its directory must exist
pub(crate) fn key_for(paths: &StorePaths) -> Result<PathBuf> {
    let dir = paths.dir().canonicalize()?;
    let file = paths.database();
    let file_name = file
        .file_name()
        .ok_or_else(|| Error::invalid_argument(format!("store '{}' has no file name", paths.name())))?;
    Ok(dir.join(file_name))
}

/// Remove the entry for `key` unless it belongs to a live store
pub(crate) fn forget(key: &Path) {
    let mut registry = OPEN_STORES.lock();
    if registry
        .get(key)
        .map_or(false, |weak| weak.strong_count() == 0)
    {
        registry.remove(key);
    }
}
