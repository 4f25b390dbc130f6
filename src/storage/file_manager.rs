//! # File Manager
//!
//! Opens, extends, and overwrites the numbered files beneath a database
//! folder. All I/O is positioned: callers name a [`FileKey`] and a byte
//! offset, and the manager seeks and reads or writes through a single cached
//! handle.
//!
//! ## Handle Cache
//!
//! Exactly one file handle is kept open between calls. A request for a
//! different file closes the cached handle and opens the requested one. The
//! workload is strongly clustered (a commit touches one data file and one
//! index file series at a time), so one slot captures most of the reuse
//! without any eviction machinery.
//!
//! ## Growth
//!
//! Writing past the current end of a file extends it; the intervening gap, if
//! any, reads back as zeroes. The manager never appends blindly at the
//! physical end, because recovery can leave stale bytes beyond a file's
//! logical size. Callers track logical tails themselves.
//!
//! ## Durability
//!
//! Writes are buffered by the OS. Durability is established only by
//! [`FileManager::sync`], which the commit protocol invokes at its three
//! mandatory barriers.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};

use super::{FileIo, FileKey};

#[derive(Debug)]
pub struct FileManager {
    folder_path: PathBuf,
    cached: Option<(FileKey, File)>,
}

impl FileManager {
    /// Opens the database folder, creating it (and `data_dir`) if absent.
    pub fn open(data_dir: &Path, folder: &str) -> Result<Self> {
        let folder_path = data_dir.join(folder);
        fs::create_dir_all(&folder_path).wrap_err_with(|| {
            format!(
                "failed to create database folder '{}'",
                folder_path.display()
            )
        })?;

        Ok(Self {
            folder_path,
            cached: None,
        })
    }

    pub fn folder_path(&self) -> &Path {
        &self.folder_path
    }

    pub fn path_for(&self, key: FileKey) -> PathBuf {
        self.folder_path.join(key.file_name())
    }

    pub fn exists(&self, key: FileKey) -> bool {
        self.path_for(key).exists()
    }

    /// Current physical length of the file, zero if it does not exist yet.
    pub fn len(&mut self, key: FileKey) -> Result<u32> {
        let file = self.handle(key)?;
        let meta = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", key.file_name()))?;
        Ok(meta.len() as u32)
    }

    /// Flushes the file's data and metadata to stable storage.
    pub fn sync(&mut self, key: FileKey) -> Result<()> {
        let file = self.handle(key)?;
        file.sync_all()
            .wrap_err_with(|| format!("failed to sync '{}'", key.file_name()))
    }

    /// Drops the cached handle, if any. Subsequent calls reopen on demand.
    pub fn close_cached(&mut self) {
        self.cached = None;
    }

    fn handle(&mut self, key: FileKey) -> Result<&mut File> {
        let hit = matches!(&self.cached, Some((cached_key, _)) if *cached_key == key);
        if !hit {
            let path = self.path_for(key);
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)
                .wrap_err_with(|| format!("failed to open '{}'", path.display()))?;
            self.cached = Some((key, file));
        }
        Ok(&mut self.cached.as_mut().unwrap().1)
    }
}

impl FileIo for FileManager {
    fn read_at(&mut self, key: FileKey, offset: u32, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let file = self.handle(key)?;
        file.seek(SeekFrom::Start(offset as u64))
            .wrap_err_with(|| format!("failed to seek '{}' to {}", key.file_name(), offset))?;
        file.read_exact(buf).wrap_err_with(|| {
            format!(
                "failed to read {} bytes from '{}' at {}",
                buf.len(),
                key.file_name(),
                offset
            )
        })
    }

    fn write_at(&mut self, key: FileKey, offset: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let file = self.handle(key)?;
        file.seek(SeekFrom::Start(offset as u64))
            .wrap_err_with(|| format!("failed to seek '{}' to {}", key.file_name(), offset))?;
        file.write_all(data).wrap_err_with(|| {
            format!(
                "failed to write {} bytes to '{}' at {}",
                data.len(),
                key.file_name(),
                offset
            )
        })
    }
}
