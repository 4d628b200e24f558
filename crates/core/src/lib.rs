//! Core types for soupstore
//!
//! This crate defines the I/O-free vocabulary shared by the engine and its
//! callers:
//! - Error: the domain error taxonomy and stable error codes
//! - SoupIndex / IndexType: index specifications
//! - SoupSpec / StorageMode: soup-level attributes
//! - QuerySpec / QueryKind: declarative queries
//! - path: dotted-path projection over JSON documents
//! - entry: system fields carried by every stored document
//! - limits: name and path validation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod entry;
pub mod error;
pub mod index;
pub mod limits;
pub mod path;
pub mod query;
pub mod soup;

pub use entry::{date_from_last_modified_value, SystemPath};
pub use error::{Error, ErrorCode, Result};
pub use index::{same_index_set, IndexType, SoupIndex};
pub use limits::{
    validate_index_path, validate_soup_name, validate_store_name, NameError, MAX_NAME_BYTES,
    RESERVED_SHADOW_PREFIX,
};
pub use query::{QueryKind, QuerySpec, SortOrder, DEFAULT_PAGE_SIZE};
pub use soup::{SoupSpec, StorageMode};
