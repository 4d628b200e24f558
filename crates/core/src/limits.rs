//! Name and path limits
//!
//! Soup names, index paths, and store names end up inside SQL text, smart-SQL
//! references (`{soup:path}`), and file names. This module defines the
//! characters and lengths they may use. Violations are reported as
//! [`NameError`] and surface to callers as `InvalidArgument`.

use thiserror::Error;

/// Maximum length of any name or path, in bytes
pub const MAX_NAME_BYTES: usize = 255;

/// Prefix reserved for the shadow soups built during alteration
pub const RESERVED_SHADOW_PREFIX: &str = "__alter__";

/// Name validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    /// Name was empty
    #[error("{kind} must not be empty")]
    Empty {
        /// What was being validated
        kind: &'static str,
    },

    /// Name exceeds [`MAX_NAME_BYTES`]
    #[error("{kind} too long: {actual} bytes exceeds maximum {max}")]
    TooLong {
        /// What was being validated
        kind: &'static str,
        /// Actual length in bytes
        actual: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Name contains a character that cannot appear in it
    #[error("{kind} '{name}' contains forbidden character {ch:?}")]
    ForbiddenChar {
        /// What was being validated
        kind: &'static str,
        /// Offending name
        name: String,
        /// Offending character
        ch: char,
    },

    /// Name starts with [`RESERVED_SHADOW_PREFIX`]
    #[error("{kind} '{name}' uses the reserved prefix '__alter__'")]
    ReservedPrefix {
        /// What was being validated
        kind: &'static str,
        /// Offending name
        name: String,
    },

    /// Path has an empty segment (`a..b`, leading or trailing dot)
    #[error("path '{0}' has an empty segment")]
    EmptySegment(String),
}

impl From<NameError> for crate::Error {
    fn from(e: NameError) -> Self {
        crate::Error::InvalidArgument(e.to_string())
    }
}

fn check_common(kind: &'static str, name: &str, extra: &[char]) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty { kind });
    }
    if name.len() > MAX_NAME_BYTES {
        return Err(NameError::TooLong {
            kind,
            actual: name.len(),
            max: MAX_NAME_BYTES,
        });
    }
    let forbidden = |c: char| {
        c.is_control() || matches!(c, '{' | '}' | ':' | '\'' | '"' | '`') || extra.contains(&c)
    };
    if let Some(ch) = name.chars().find(|c| forbidden(*c)) {
        return Err(NameError::ForbiddenChar {
            kind,
            name: name.to_string(),
            ch,
        });
    }
    Ok(())
}

/// Validate a soup name supplied by a caller
pub fn validate_soup_name(name: &str) -> Result<(), NameError> {
    check_common("soup name", name, &[])?;
    if name.starts_with(RESERVED_SHADOW_PREFIX) {
        return Err(NameError::ReservedPrefix {
            kind: "soup name",
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Validate a dotted index path
pub fn validate_index_path(path: &str) -> Result<(), NameError> {
    check_common("index path", path, &[])?;
    if path.split('.').any(str::is_empty) {
        return Err(NameError::EmptySegment(path.to_string()));
    }
    Ok(())
}

/// Validate a store name
///
/// Store names become file names, so path separators are also refused.
pub fn validate_store_name(name: &str) -> Result<(), NameError> {
    check_common("store name", name, &['/', '\\'])?;
    if name == "." || name == ".." {
        return Err(NameError::ForbiddenChar {
            kind: "store name",
            name: name.to_string(),
            ch: '.',
        });
    }
    Ok(())
}

/// Name of the shadow soup used while altering `soup`
pub fn shadow_soup_name(soup: &str) -> String {
    format!("{}{}", RESERVED_SHADOW_PREFIX, soup)
}
