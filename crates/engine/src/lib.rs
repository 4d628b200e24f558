//! Soup store engine
//!
//! This crate owns everything that touches disk:
//! - StoreManager: shared store instances, scopes, `soupstore.toml`
//! - SoupStore: soup registry, CRUD, queries, alteration
//! - crypto: container keying, re-encryption, external entry sealing
//!
//! Each store is one SQLite container (SQLCipher with the default
//! `sqlcipher` feature) plus an optional directory of external entry files.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod crypto;
pub mod manager;
pub mod store;

pub use crypto::{CodecError, EntryCodec, IdentityCodec, SealedCodec};
pub use manager::{
    JournalMode, StoreConfig, StoreManager, StoreManagerBuilder, StorePaths, StoreScope,
    SynchronousMode, UserAccount, CONFIG_FILE_NAME,
};
pub use store::{
    AlterSoupDetails, AlterStatus, LongOperation, LongOperationKind, SoupStore, SCHEMA_VERSION,
};
