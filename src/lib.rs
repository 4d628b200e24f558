//! Soupstore - encrypted, indexed on-device storage for JSON documents
//!
//! Documents live in named *soups*. Each soup declares the paths it indexes;
//! only indexed paths can be queried, ordered on, or used as external ids.
//!
//! # Quick Start
//!
//! ```ignore
//! use soupstore::{QuerySpec, SoupIndex, StoreManager};
//! use serde_json::json;
//!
//! let manager = StoreManager::builder()
//!     .root("/data/stores")
//!     .key_provider(|| Some(load_key_from_keychain()))
//!     .build()?;
//! let store = manager.shared_global_store("smartstore")?;
//!
//! store.register_soup("contacts", &[SoupIndex::string("name")])?;
//! store.upsert_entries("contacts", vec![json!({ "name": "Ann" })])?;
//! let found = store.query(&QuerySpec::exact("contacts", "name", "Ann", 10), 0)?;
//! ```
//!
//! # Architecture
//!
//! - `soupstore-core`: errors, index and query specifications, path projection
//! - `soupstore-engine`: the store manager, containers, CRUD, queries and
//!   soup alteration
//!
//! This crate re-exports both.

pub use soupstore_core::*;
pub use soupstore_engine::{
    AlterSoupDetails, AlterStatus, CodecError, EntryCodec, IdentityCodec, JournalMode,
    LongOperation, LongOperationKind, SealedCodec, SoupStore, StoreConfig, StoreManager,
    StoreManagerBuilder, StorePaths, StoreScope, SynchronousMode, UserAccount, CONFIG_FILE_NAME,
    SCHEMA_VERSION,
};
