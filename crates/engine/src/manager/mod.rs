//! Store manager
//!
//! Owns the root directory, the key material providers and the
//! configuration, and hands out shared [`SoupStore`] instances. Stores live
//! under `<root>/global/` or `<root>/users/<org>/<user>[/<community>]/`.

mod builder;
pub mod config;
pub mod paths;
pub(crate) mod registry;

pub use builder::StoreManagerBuilder;
pub use config::{JournalMode, StoreConfig, SynchronousMode, CONFIG_FILE_NAME};
pub use paths::{StorePaths, StoreScope, UserAccount};

use crate::crypto::{KeyProvider, Keying, LegacyKeyProvider, SaltProvider};
use crate::store::{OpenRequest, SoupStore};
use registry::OPEN_STORES;
use soupstore_core::{Error, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Entry point for opening and removing stores
pub struct StoreManager {
    root: PathBuf,
    key_provider: Option<KeyProvider>,
    salt_provider: Option<SaltProvider>,
    legacy_key_provider: Option<LegacyKeyProvider>,
    config: StoreConfig,
    unencrypted: bool,
}

impl std::fmt::Debug for StoreManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreManager")
            .field("root", &self.root)
            .field("config", &self.config)
            .field("unencrypted", &self.unencrypted)
            .finish_non_exhaustive()
    }
}

impl StoreManager {
    /// Start configuring a manager
    pub fn builder() -> StoreManagerBuilder {
        StoreManagerBuilder::new()
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Configuration applied to every store opened by this manager
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn resolve_keying(&self) -> Result<Keying> {
        if self.unencrypted {
            return Ok(Keying::Unencrypted);
        }
        let provider = self
            .key_provider
            .as_ref()
            .ok_or_else(|| Error::encryption("no key provider configured"))?;
        let key = provider()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| Error::encryption("key provider returned no key"))?;
        let salt = self.salt_provider.as_ref().and_then(|provider| provider());
        Ok(Keying::from_material(&key, salt.as_deref()))
    }

    /// The open store `name` of `scope`, opening it if needed
    ///
    /// Every call for the same name and scope returns the same instance
    /// while any handle to it is alive. Unfinished long operations are
    /// resumed when the store is first opened.
    pub fn shared_store(&self, name: &str, scope: &StoreScope) -> Result<Arc<SoupStore>> {
        let paths = StorePaths::new(&self.root, scope, name)?;
        paths.create_directories()?;
        let key = registry::key_for(&paths)?;

        // Declared before the guard so a closed handle drops after it
        let mut _closed: Option<Arc<SoupStore>> = None;
        // Held across the open so two threads cannot both open the container
        let mut open = OPEN_STORES.lock();
        if let Some(store) = open.get(&key).and_then(|weak| weak.upgrade()) {
            if !store.is_closed() {
                return Ok(store);
            }
            _closed = Some(store);
        }

        let store = Arc::new(SoupStore::open(OpenRequest {
            paths,
            scope: scope.clone(),
            keying: self.resolve_keying()?,
            legacy: self.legacy_key_provider.clone(),
            config: self.config.clone(),
            registry_key: key.clone(),
        })?);
        open.insert(key, Arc::downgrade(&store));
        Ok(store)
    }

    /// The open global store `name`
    pub fn shared_global_store(&self, name: &str) -> Result<Arc<SoupStore>> {
        self.shared_store(name, &StoreScope::Global)
    }

    /// Whether store `name` of `scope` exists on disk
    pub fn has_store(&self, name: &str, scope: &StoreScope) -> Result<bool> {
        Ok(StorePaths::new(&self.root, scope, name)?.exists())
    }

    /// Names of the stores of `scope` on disk, sorted
    pub fn all_store_names(&self, scope: &StoreScope) -> Result<Vec<String>> {
        let dir = paths::scope_dir(&self.root, scope)?;
        Ok(paths::store_names_in(&dir)?)
    }

    /// Close store `name` of `scope` and delete its files
    ///
    /// Other handles to the store fail with `Closed` afterwards. Removing a
    /// store that does not exist is a no-op.
    pub fn remove_shared_store(&self, name: &str, scope: &StoreScope) -> Result<()> {
        let paths = StorePaths::new(&self.root, scope, name)?;
        let open = match registry::key_for(&paths) {
            Ok(key) => {
                let mut registry = OPEN_STORES.lock();
                registry.remove(&key).and_then(|weak| weak.upgrade())
            }
            Err(_) => None,
        };
        // Registry lock released before the handle can drop
        if let Some(store) = open {
            store.close();
        }

        for file in paths.database_files() {
            remove_file_if_exists(&file)?;
        }
        remove_file_if_exists(&paths.rekey_database())?;
        remove_file_if_exists(&paths.lock_file())?;
        match fs::remove_dir_all(paths.external_dir()) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(target: "soupstore::manager", store = name, scope = %scope, "Removed store");
        Ok(())
    }

    /// Remove every store of `scope`
    pub fn remove_all_stores(&self, scope: &StoreScope) -> Result<()> {
        for name in self.all_store_names(scope)? {
            self.remove_shared_store(&name, scope)?;
        }
        Ok(())
    }
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
