//! Encryption adapter
//!
//! The whole container is encrypted by SQLCipher with a single key obtained
//! from the injected key provider at open time. This module turns provider
//! output into SQLCipher keying pragmas, verifies a key against an existing
//! file, and performs the atomic full-container re-encryption used for key
//! rotation and legacy-key migration.
//!
//! ## Keying
//!
//! - 32-byte provider output is used as the raw key; anything else is reduced
//!   with SHA-256.
//! - With a salt provider, the salt string is reduced to 16 bytes and passed
//!   explicitly, and the first 32 bytes of the file stay plaintext so another
//!   cooperating process can open it.

pub mod codec;

pub use codec::{CodecError, EntryCodec, IdentityCodec, SealedCodec};

use rusqlite::Connection;
use sha2::{Digest, Sha256};
use soupstore_core::{Error, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Supplies the store key, invoked once per open
pub type KeyProvider = Arc<dyn Fn() -> Option<Vec<u8>> + Send + Sync>;

/// Supplies the shared-container salt
pub type SaltProvider = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Supplies the passphrase of containers created by older releases
pub type LegacyKeyProvider = Arc<dyn Fn() -> Option<String> + Send + Sync>;

const PLAINTEXT_HEADER_BYTES: u32 = 32;

/// Resolved keying material for one container
#[derive(Clone)]
pub(crate) enum Keying {
    /// No encryption
    Unencrypted,
    /// Raw 32-byte key with optional explicit salt
    Raw {
        key: [u8; 32],
        salt: Option<[u8; 16]>,
    },
    /// Passphrase run through SQLCipher's own key derivation
    Passphrase(String),
}

impl std::fmt::Debug for Keying {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Keying::Unencrypted => f.write_str("Unencrypted"),
            Keying::Raw { salt, .. } => f
                .debug_struct("Raw")
                .field("salted", &salt.is_some())
                .finish_non_exhaustive(),
            Keying::Passphrase(_) => f.write_str("Passphrase(..)"),
        }
    }
}

impl Keying {
    /// Build raw keying from provider output and an optional salt string
    pub(crate) fn from_material(key: &[u8], salt: Option<&str>) -> Self {
        let key: [u8; 32] = match <[u8; 32]>::try_from(key) {
            Ok(raw) => raw,
            Err(_) => Sha256::digest(key).into(),
        };
        let salt = salt.map(|s| {
            let digest = Sha256::digest(s.as_bytes());
            let mut out = [0u8; 16];
            out.copy_from_slice(&digest[..16]);
            out
        });
        Keying::Raw { key, salt }
    }

    /// Keying with a new key and the same salt
    pub(crate) fn with_key(&self, key: &[u8]) -> Result<Self> {
        match self {
            Keying::Unencrypted => Err(Error::unsupported(
                "an unencrypted store cannot be rekeyed",
            )),
            Keying::Raw { salt, .. } => match Keying::from_material(key, None) {
                Keying::Raw { key, .. } => Ok(Keying::Raw { key, salt: *salt }),
                other => Ok(other),
            },
            Keying::Passphrase(_) => Ok(Keying::from_material(key, None)),
        }
    }

    pub(crate) fn is_encrypted(&self) -> bool {
        !matches!(self, Keying::Unencrypted)
    }

    /// Value for `PRAGMA key` / `ATTACH ... KEY`, quoted for inline SQL
    fn key_literal(&self) -> Option<String> {
        match self {
            Keying::Unencrypted => None,
            Keying::Raw { key, salt } => {
                let mut hex = to_hex(key);
                if let Some(salt) = salt {
                    hex.push_str(&to_hex(salt));
                }
                Some(format!("\"x'{}'\"", hex))
            }
            Keying::Passphrase(p) => Some(format!("'{}'", p.replace('\'', "''"))),
        }
    }

    fn plaintext_header(&self) -> bool {
        matches!(self, Keying::Raw { salt: Some(_), .. })
    }

    /// Codec for external entry files of a container keyed this way
    pub(crate) fn entry_codec(&self) -> Arc<dyn EntryCodec> {
        match self {
            Keying::Unencrypted => Arc::new(IdentityCodec),
            Keying::Raw { key, .. } => Arc::new(SealedCodec::from_store_key(key)),
            Keying::Passphrase(p) => {
                Arc::new(SealedCodec::from_store_key(&Sha256::digest(p.as_bytes()).into()))
            }
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{:02x}", b);
        s
    })
}

/// Key a freshly opened connection; must run before any other statement
pub(crate) fn apply_key(conn: &Connection, keying: &Keying) -> Result<()> {
    let Some(literal) = keying.key_literal() else {
        return Ok(());
    };
    conn.execute_batch(&format!("PRAGMA key = {};", literal))
        .map_err(|e| Error::encryption(format!("failed to apply key: {}", e)))?;
    if keying.plaintext_header() {
        conn.execute_batch(&format!(
            "PRAGMA cipher_plaintext_header_size = {};",
            PLAINTEXT_HEADER_BYTES
        ))
        .map_err(|e| Error::encryption(format!("failed to set plaintext header: {}", e)))?;
    }
    Ok(())
}

/// Check that the applied key decrypts the container
///
/// A wrong key surfaces on the first read of the schema catalogue.
pub(crate) fn verify_key(conn: &Connection) -> Result<()> {
    conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    })
    .map(|_| ())
    .map_err(|e| Error::encryption(format!("key does not open the store: {}", e)))
}

/// Copy the open container into `target`, encrypted with `keying`
///
/// `target` must not exist. The caller swaps it over the original once the
/// source connection is closed.
#[cfg(feature = "sqlcipher")]
pub(crate) fn export_rekeyed(conn: &Connection, target: &Path, keying: &Keying) -> Result<()> {
    let path = target
        .to_str()
        .ok_or_else(|| Error::storage(format!("non UTF-8 path '{}'", target.display())))?
        .replace('\'', "''");
    let key = keying.key_literal().unwrap_or_else(|| "''".to_string());
    debug!(target: "soupstore::crypto", path = %target.display(), "Exporting container");

    conn.execute_batch(&format!(
        "ATTACH DATABASE '{}' AS rekeyed KEY {};",
        path, key
    ))
    .map_err(|e| Error::encryption(format!("failed to attach rekey target: {}", e)))?;

    let result = (|| -> rusqlite::Result<()> {
        if keying.plaintext_header() {
            conn.execute_batch(&format!(
                "PRAGMA rekeyed.cipher_plaintext_header_size = {};",
                PLAINTEXT_HEADER_BYTES
            ))?;
        }
        conn.query_row("SELECT sqlcipher_export('rekeyed')", [], |_| Ok(()))?;
        Ok(())
    })();
    let detach = conn.execute_batch("DETACH DATABASE rekeyed;");

    result.map_err(|e| Error::encryption(format!("failed to export container: {}", e)))?;
    detach.map_err(Error::storage)
}

/// Without SQLCipher the container cannot be re-encrypted
#[cfg(not(feature = "sqlcipher"))]
pub(crate) fn export_rekeyed(_conn: &Connection, target: &Path, _keying: &Keying) -> Result<()> {
    debug!(target: "soupstore::crypto", path = %target.display(), "Rekey requested without SQLCipher");
    Err(Error::unsupported(
        "re-encryption requires the sqlcipher feature",
    ))
}

/// SQLCipher version string, `None` on plain SQLite
pub(crate) fn cipher_version(conn: &Connection) -> Result<Option<String>> {
    let mut stmt = conn.prepare("PRAGMA cipher_version").map_err(Error::storage)?;
    let mut rows = stmt.query([]).map_err(Error::storage)?;
    match rows.next().map_err(Error::storage)? {
        Some(row) => Ok(row.get::<_, Option<String>>(0).map_err(Error::storage)?),
        None => Ok(None),
    }
}

/// Run a pragma that returns one text value per row
pub(crate) fn pragma_rows(conn: &Connection, pragma: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA {}", pragma))
        .map_err(Error::storage)?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(Error::storage)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(Error::storage)
}
