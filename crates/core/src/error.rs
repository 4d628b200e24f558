//! Error types for soupstore
//!
//! Every fallible store operation returns [`Error`]. Variants carry the soup
//! name, path, or ids involved so callers can act on the failure without
//! parsing messages. We use `thiserror` for `Display` and `Error`.

use crate::index::SoupIndex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for soupstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the soup store
#[derive(Debug, Error)]
pub enum Error {
    /// Soup, entry, or store absent
    #[error("not found in soup '{soup}': {detail}")]
    NotFound {
        /// Soup the lookup ran against
        soup: String,
        /// What was missing
        detail: String,
    },

    /// Soup re-registered with index specs that differ from the stored ones
    #[error("soup '{soup}' is already registered with different indexes")]
    SchemaConflict {
        /// Soup name
        soup: String,
        /// Index specs currently registered
        existing: Vec<SoupIndex>,
        /// Index specs that were requested
        requested: Vec<SoupIndex>,
    },

    /// Query, ordering, or lookup against a path without a suitable index
    #[error("path '{path}' is not indexed in soup '{soup}'")]
    PathNotIndexed {
        /// Soup name
        soup: String,
        /// Offending path
        path: String,
    },

    /// External-id upsert resolved to more than one entry
    #[error("external id {path} = {value} matches {} entries in soup '{soup}'", ids.len())]
    AmbiguousExternalId {
        /// Soup name
        soup: String,
        /// External id path
        path: String,
        /// Value that was looked up
        value: String,
        /// Matching entry ids
        ids: Vec<i64>,
    },

    /// Entry id lookup resolved to more than one entry
    #[error("lookup {path} = {value} matches {} entries in soup '{soup}'", ids.len())]
    AmbiguousMatch {
        /// Soup name
        soup: String,
        /// Looked-up path
        path: String,
        /// Value that was looked up
        value: String,
        /// Matching entry ids
        ids: Vec<i64>,
    },

    /// Operation not permitted for the given input
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Input failed validation
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An element of an upsert batch is not a JSON object
    #[error("invalid entry at position {position} for soup '{soup}': {reason}")]
    InvalidEntry {
        /// Soup name
        soup: String,
        /// Position of the entry within the batch
        position: usize,
        /// Why the entry was rejected
        reason: String,
    },

    /// Mutation against a soup whose alteration has not finished
    #[error("soup '{soup}' has an unfinished alteration; resume long operations first")]
    AlterPending {
        /// Soup name
        soup: String,
    },

    /// Physical read/write failure (database or external entry files)
    #[error("storage I/O error: {0}")]
    StorageIo(String),

    /// Key unavailable, wrong key, or a sealed payload failed to open
    #[error("encryption error: {0}")]
    Encryption(String),

    /// JSON encode/decode failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The store was closed or removed
    #[error("store '{0}' is closed")]
    Closed(String),
}

/// Stable, serializable error codes
///
/// One code per error category, suitable for bridging to callers that only
/// see a code and a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// See [`Error::NotFound`]
    NotFound,
    /// See [`Error::SchemaConflict`]
    SchemaConflict,
    /// See [`Error::PathNotIndexed`]
    PathNotIndexed,
    /// See [`Error::AmbiguousExternalId`]
    AmbiguousExternalId,
    /// See [`Error::AmbiguousMatch`]
    AmbiguousMatch,
    /// See [`Error::UnsupportedOperation`]
    UnsupportedOperation,
    /// See [`Error::InvalidArgument`] and [`Error::InvalidEntry`]
    InvalidArgument,
    /// See [`Error::AlterPending`]
    AlterPending,
    /// See [`Error::StorageIo`]
    StorageIo,
    /// See [`Error::Encryption`]
    Encryption,
    /// See [`Error::Serialization`]
    Serialization,
    /// See [`Error::Closed`]
    Closed,
}

impl ErrorCode {
    /// Code as a static string
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::SchemaConflict => "schema_conflict",
            ErrorCode::PathNotIndexed => "path_not_indexed",
            ErrorCode::AmbiguousExternalId => "ambiguous_external_id",
            ErrorCode::AmbiguousMatch => "ambiguous_match",
            ErrorCode::UnsupportedOperation => "unsupported_operation",
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::AlterPending => "alter_pending",
            ErrorCode::StorageIo => "storage_io",
            ErrorCode::Encryption => "encryption",
            ErrorCode::Serialization => "serialization",
            ErrorCode::Closed => "closed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Domain code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NotFound { .. } => ErrorCode::NotFound,
            Error::SchemaConflict { .. } => ErrorCode::SchemaConflict,
            Error::PathNotIndexed { .. } => ErrorCode::PathNotIndexed,
            Error::AmbiguousExternalId { .. } => ErrorCode::AmbiguousExternalId,
            Error::AmbiguousMatch { .. } => ErrorCode::AmbiguousMatch,
            Error::UnsupportedOperation(_) => ErrorCode::UnsupportedOperation,
            Error::InvalidArgument(_) | Error::InvalidEntry { .. } => ErrorCode::InvalidArgument,
            Error::AlterPending { .. } => ErrorCode::AlterPending,
            Error::StorageIo(_) => ErrorCode::StorageIo,
            Error::Encryption(_) => ErrorCode::Encryption,
            Error::Serialization(_) => ErrorCode::Serialization,
            Error::Closed(_) => ErrorCode::Closed,
        }
    }

    /// Soup was not registered
    pub fn soup_not_found(soup: impl Into<String>) -> Self {
        let soup = soup.into();
        Error::NotFound {
            detail: format!("soup '{}' does not exist", soup),
            soup,
        }
    }

    /// Path lacks an index usable for the requested operation
    pub fn path_not_indexed(soup: impl Into<String>, path: impl Into<String>) -> Self {
        Error::PathNotIndexed {
            soup: soup.into(),
            path: path.into(),
        }
    }

    /// Physical storage failure
    ///
    /// Takes anything printable so it can be used directly with `map_err`.
    pub fn storage<E: fmt::Display>(e: E) -> Self {
        Error::StorageIo(e.to_string())
    }

    /// Encryption failure
    pub fn encryption(reason: impl Into<String>) -> Self {
        Error::Encryption(reason.into())
    }

    /// Validation failure
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Error::InvalidArgument(reason.into())
    }

    /// Operation not permitted for the given input
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Error::UnsupportedOperation(reason.into())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::StorageIo(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
