//! Store manager builder
//!
//! Collects the root directory, key material providers and configuration,
//! then builds a [`StoreManager`].

use std::path::PathBuf;
use std::sync::Arc;

use soupstore_core::{Error, Result};
use tracing::info;

use super::config::{StoreConfig, CONFIG_FILE_NAME};
use super::StoreManager;
use crate::crypto::{KeyProvider, LegacyKeyProvider, SaltProvider};

// ============================================================================
// StoreManager Builder Pattern
// ============================================================================

/// Builder for [`StoreManager`]
///
/// ```ignore
/// use soupstore_engine::StoreManager;
///
/// let manager = StoreManager::builder()
///     .root("/data/stores")
///     .key_provider(|| Some(load_key_from_keychain()))
///     .build()?;
/// let store = manager.shared_global_store("smartstore")?;
/// ```
///
/// The key provider must be set before any store of the root is first
/// opened; switching providers afterwards leaves existing containers
/// unreadable.
#[derive(Default)]
pub struct StoreManagerBuilder {
    root: Option<PathBuf>,
    key_provider: Option<KeyProvider>,
    salt_provider: Option<SaltProvider>,
    legacy_key_provider: Option<LegacyKeyProvider>,
    config: Option<StoreConfig>,
    unencrypted: bool,
}

impl std::fmt::Debug for StoreManagerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreManagerBuilder")
            .field("root", &self.root)
            .field("key_provider", &self.key_provider.is_some())
            .field("salt_provider", &self.salt_provider.is_some())
            .field("legacy_key_provider", &self.legacy_key_provider.is_some())
            .field("config", &self.config)
            .field("unencrypted", &self.unencrypted)
            .finish()
    }
}

impl StoreManagerBuilder {
    /// Create a builder with nothing set
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory holding every store and `soupstore.toml` (required)
    pub fn root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Function returning the store key, called once per store open
    pub fn key_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.key_provider = Some(Arc::new(provider));
        self
    }

    /// Function returning the salt shared with cooperating processes
    pub fn salt_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        self.salt_provider = Some(Arc::new(provider));
        self
    }

    /// Function returning the passphrase of containers from older releases
    ///
    /// Consulted only when the current key fails; a container it opens is
    /// re-encrypted to the current key.
    pub fn legacy_key_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        self.legacy_key_provider = Some(Arc::new(provider));
        self
    }

    /// Use this configuration and persist it to `soupstore.toml`
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Store containers without encryption
    ///
    /// Key providers are ignored. Meant for tests and tooling.
    pub fn unencrypted(mut self) -> Self {
        self.unencrypted = true;
        self
    }

    /// Build the manager
    ///
    /// # Errors
    ///
    /// - no root was configured
    /// - encryption was requested without a key provider, or without the
    ///   `sqlcipher` feature
    /// - `soupstore.toml` cannot be read, parsed or written
    pub fn build(self) -> Result<StoreManager> {
        let root = self
            .root
            .ok_or_else(|| Error::invalid_argument("store manager requires a root directory"))?;
        if !self.unencrypted {
            if !cfg!(feature = "sqlcipher") {
                return Err(Error::encryption(
                    "encrypted stores require the sqlcipher feature; use unencrypted() for plain SQLite",
                ));
            }
            if self.key_provider.is_none() {
                return Err(Error::encryption("no key provider configured"));
            }
        }

        std::fs::create_dir_all(&root)?;
        let config_path = root.join(CONFIG_FILE_NAME);
        let config = match self.config {
            Some(config) => {
                config.validate()?;
                config.write_to_file(&config_path)?;
                config
            }
            None => {
                StoreConfig::write_default_if_missing(&config_path)?;
                StoreConfig::from_file(&config_path)?
            }
        };
        info!(
            target: "soupstore::manager",
            root = %root.display(),
            encrypted = !self.unencrypted,
            journal_mode = ?config.journal_mode,
            "Store manager ready"
        );

        Ok(StoreManager {
            root,
            key_provider: self.key_provider,
            salt_provider: self.salt_provider,
            legacy_key_provider: self.legacy_key_provider,
            config,
            unencrypted: self.unencrypted,
        })
    }
}
