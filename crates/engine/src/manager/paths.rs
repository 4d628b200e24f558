//! Store file layout
//!
//! Every store is one container file plus sidecars, placed under the
//! manager's root according to its scope:
//!
//! ```text
//! <root>/
//! ├── soupstore.toml
//! ├── global/
//! │   ├── <name>.db            # container
//! │   ├── <name>.db.lock       # advisory process lock
//! │   └── <name>_external/     # external entry files
//! │       └── TABLE_<n>/<id>.entry
//! └── users/<org>/<user>[/<community>]/
//!     └── ... same as global/
//! ```

use serde::{Deserialize, Serialize};
use soupstore_core::{validate_store_name, Result};
use std::fmt;
use std::path::{Path, PathBuf};

const DB_EXTENSION: &str = "db";

/// Identity of the user a store belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserAccount {
    /// Organization id
    pub org_id: String,
    /// User id
    pub user_id: String,
    /// Community id, if the user is logged into a community
    pub community_id: Option<String>,
}

impl UserAccount {
    /// Account without a community
    pub fn new(org_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            user_id: user_id.into(),
            community_id: None,
        }
    }

    /// Same account within `community_id`
    pub fn with_community(mut self, community_id: impl Into<String>) -> Self {
        self.community_id = Some(community_id.into());
        self
    }
}

/// Which stores a name refers to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreScope {
    /// Shared by every user of the process
    Global,
    /// Private to one user
    User(UserAccount),
}

impl fmt::Display for StoreScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreScope::Global => f.write_str("global"),
            StoreScope::User(u) => match &u.community_id {
                Some(c) => write!(f, "user {}/{}/{}", u.org_id, u.user_id, c),
                None => write!(f, "user {}/{}", u.org_id, u.user_id),
            },
        }
    }
}

/// Directory holding every store of `scope`
pub fn scope_dir(root: &Path, scope: &StoreScope) -> Result<PathBuf> {
    match scope {
        StoreScope::Global => Ok(root.join("global")),
        StoreScope::User(u) => {
            validate_store_name(&u.org_id)?;
            validate_store_name(&u.user_id)?;
            let mut dir = root.join("users").join(&u.org_id).join(&u.user_id);
            if let Some(c) = &u.community_id {
                validate_store_name(c)?;
                dir = dir.join(c);
            }
            Ok(dir)
        }
    }
}

/// Paths of one store
#[derive(Debug, Clone)]
pub struct StorePaths {
    dir: PathBuf,
    name: String,
}

impl StorePaths {
    /// Paths for store `name` of `scope` under `root`
    pub fn new(root: &Path, scope: &StoreScope, name: &str) -> Result<Self> {
        validate_store_name(name)?;
        Ok(Self {
            dir: scope_dir(root, scope)?,
            name: name.to_string(),
        })
    }

    /// Paths for store `name` inside an explicit directory
    pub fn in_dir(dir: impl Into<PathBuf>, name: &str) -> Result<Self> {
        validate_store_name(name)?;
        Ok(Self {
            dir: dir.into(),
            name: name.to_string(),
        })
    }

    /// Store name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding the container
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Container file
    pub fn database(&self) -> PathBuf {
        self.dir.join(format!("{}.{}", self.name, DB_EXTENSION))
    }

    /// Temporary container used during re-encryption
    pub fn rekey_database(&self) -> PathBuf {
        self.dir.join(format!("{}.{}.rekey", self.name, DB_EXTENSION))
    }

    /// Advisory lock file
    pub fn lock_file(&self) -> PathBuf {
        self.dir.join(format!("{}.{}.lock", self.name, DB_EXTENSION))
    }

    /// Root of the external entry files
    pub fn external_dir(&self) -> PathBuf {
        self.dir.join(format!("{}_external", self.name))
    }

    /// Container plus SQLite sidecar files
    pub fn database_files(&self) -> Vec<PathBuf> {
        let db = self.database();
        let mut files = vec![db.clone()];
        for suffix in ["-wal", "-shm", "-journal"] {
            let mut s = db.clone().into_os_string();
            s.push(suffix);
            files.push(PathBuf::from(s));
        }
        files
    }

    /// Whether the container file exists
    pub fn exists(&self) -> bool {
        self.database().exists()
    }

    /// Create the store directory
    pub fn create_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)
    }
}

/// Names of the stores present in `dir`
pub fn store_names_in(dir: &Path) -> std::io::Result<Vec<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut names = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().map_or(false, |ext| ext == DB_EXTENSION) {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}
