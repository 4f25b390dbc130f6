//! # Storage Module
//!
//! This module provides the persistence layer of the engine: numbered files
//! beneath a per-database folder, byte-granular positioned I/O with a single
//! cached handle, the deletion index that tracks reusable extents inside data
//! files, and the write-ahead log that makes commits crash-safe.
//!
//! ## File Layout
//!
//! Every database occupies one folder:
//!
//! ```text
//! <data_dir>/<folder>/
//! ├── idx_<index_id>_<file_no>   B-tree node files, one series per index
//! ├── del                        deletion index (database header + records)
//! ├── dat_<file_no>              shared append-only data files
//! └── log                        write-ahead log
//! ```
//!
//! Index file 0 of each series starts with a 6-byte tail header
//! (`last_file`/`last_size` for that index); the `del` file starts with the
//! 10-byte database header carrying the data-file tail and the record count.
//!
//! ## Logical vs. Physical Size
//!
//! Crash recovery restores tail counters without truncating files, so a file
//! may physically extend past its logical end. All growth therefore happens
//! through positioned writes at logical offsets tracked by the database and
//! index descriptors, never by appending at the physical end of a file.
//!
//! ## The [`FileIo`] Seam
//!
//! Components that touch files are generic over [`FileIo`]. During normal
//! reads the implementation is [`FileManager`] (direct I/O). During a commit
//! it is the staging layer in `database::commit`, which captures before-images
//! for the write-ahead log and defers all writes until the log is durable.
//!
//! ## Module Organization
//!
//! - `file_manager`: folder management, handle cache, positioned read/write
//! - `deletion`: in-memory ordered free-extent index with best-fit allocation
//! - `wal`: before-image log encoding, checksummed header, truncation

mod deletion;
mod file_manager;
mod wal;

pub use deletion::{DeletedSection, DeletionIndex, SectionRecordWrite};
pub use file_manager::FileManager;
pub use wal::{LogPayload, LogRecord, TailMarker, WriteAheadLog};

use eyre::Result;

/// The kinds of numbered files a database owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    /// B-tree node files for one index.
    Index,
    /// The singleton deletion-index file, which also carries the database
    /// header.
    DeletionIndex,
    /// Shared append-only data files holding raw values.
    Data,
}

impl FileType {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            FileType::Index => 0,
            FileType::DeletionIndex => 1,
            FileType::Data => 2,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(FileType::Index),
            1 => Some(FileType::DeletionIndex),
            2 => Some(FileType::Data),
            _ => None,
        }
    }
}

/// Identifies one concrete file of a database.
///
/// `index_id` is meaningful only for [`FileType::Index`]; `file_no` is zero
/// for the deletion index, which has exactly one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileKey {
    pub file_type: FileType,
    pub index_id: u8,
    pub file_no: u16,
}

impl FileKey {
    pub fn index(index_id: u8, file_no: u16) -> Self {
        Self {
            file_type: FileType::Index,
            index_id,
            file_no,
        }
    }

    pub fn deletion_index() -> Self {
        Self {
            file_type: FileType::DeletionIndex,
            index_id: 0,
            file_no: 0,
        }
    }

    pub fn data(file_no: u16) -> Self {
        Self {
            file_type: FileType::Data,
            index_id: 0,
            file_no: 0,
        }
        .with_file_no(file_no)
    }

    fn with_file_no(mut self, file_no: u16) -> Self {
        self.file_no = file_no;
        self
    }

    /// File name within the database folder.
    pub fn file_name(&self) -> String {
        match self.file_type {
            FileType::Index => format!("idx_{}_{}", self.index_id, self.file_no),
            FileType::DeletionIndex => "del".to_string(),
            FileType::Data => format!("dat_{}", self.file_no),
        }
    }
}

/// Positioned byte I/O over a database's files.
///
/// Implemented directly by [`FileManager`], and by the commit staging layer
/// which overlays pending writes and records before-images.
pub trait FileIo {
    /// Reads exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&mut self, key: FileKey, offset: u32, buf: &mut [u8]) -> Result<()>;

    /// Writes `data` starting at `offset`, extending the file if needed.
    fn write_at(&mut self, key: FileKey, offset: u32, data: &[u8]) -> Result<()>;
}
