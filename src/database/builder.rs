//! # Database Builder
//!
//! Fluent configuration for opening a [`Database`]. Every setting has a
//! working default; only the data directory is required.
//!
//! ```ignore
//! let db = Database::builder()
//!     .data_dir("./node-state")
//!     .folder("accounts")
//!     .max_file_size(1 << 30)
//!     .open()?;
//! ```
//!
//! `max_file_size` is fixed per database: once files exist, reopening with a
//! different value changes where *new* allocations roll over but never moves
//! existing data. Keep it stable for a given folder.

use std::path::{Path, PathBuf};

use eyre::{eyre, Result};

use crate::config::{DEFAULT_INDEX_CACHE_LIMIT, DEFAULT_MAX_FILE_SIZE};

use super::{Database, DatabaseOptions};

/// Builder for configuring and opening a [`Database`].
pub struct DatabaseBuilder {
    data_dir: Option<PathBuf>,
    folder: String,
    max_file_size: u32,
    index_cache_limit: u32,
}

impl Default for DatabaseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseBuilder {
    pub fn new() -> Self {
        Self {
            data_dir: None,
            folder: "store".to_string(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            index_cache_limit: DEFAULT_INDEX_CACHE_LIMIT,
        }
    }

    /// Directory that will contain the database folder. Created if absent.
    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.data_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Folder name under the data directory, to keep several databases
    /// apart. Defaults to `store`.
    pub fn folder(mut self, folder: &str) -> Self {
        self.folder = folder.to_string();
        self
    }

    /// Upper bound on a single data or index file.
    pub fn max_file_size(mut self, bytes: u32) -> Self {
        self.max_file_size = bytes;
        self
    }

    /// Default byte budget for the cached levels of each index, used by
    /// [`Database::load_index`].
    pub fn index_cache_limit(mut self, bytes: u32) -> Self {
        self.index_cache_limit = bytes;
        self
    }

    /// Opens the database, creating the folder on first use and running the
    /// crash-consistency check.
    pub fn open(self) -> Result<Database> {
        let data_dir = self
            .data_dir
            .ok_or_else(|| eyre!("a data directory is required to open a database"))?;
        Database::open_with(DatabaseOptions {
            data_dir,
            folder: self.folder,
            max_file_size: self.max_file_size,
            index_cache_limit: self.index_cache_limit,
        })
    }
}
