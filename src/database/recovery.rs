//! # Crash Recovery
//!
//! Runs on every open, before any index loads. A non-empty write-ahead log
//! means a commit was interrupted after its before-images became durable but
//! before its truncation point; the committed state is restored by replaying
//! those images.
//!
//! ## Replay
//!
//! Records replay in reverse order. A range the commit overwrote twice has
//! two records (the second holding the bytes the first wrote), so reverse
//! replay leaves the earliest image, the pre-commit bytes. Afterwards the
//! tail counters recorded in the log's marker are written back to the
//! database header and each touched index header, every touched file is
//! synced, and the log is truncated.
//!
//! Ranges the torn commit appended past the old tails are not rewritten;
//! restoring the tail counters strands those bytes, and later commits write
//! over them.
//!
//! ## Idempotence
//!
//! Recovery only overwrites ranges with images of their pre-commit contents.
//! Crashing in the middle of recovery and running it again replays the same
//! images onto the same ranges, which is harmless.

use eyre::{Result, WrapErr};

use crate::config::INDEX_FILE_HEADER_SIZE;
use crate::storage::{FileIo, FileKey, FileManager, FileType, WriteAheadLog};

/// Outcome of the consistency check that runs while opening a database.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Whether an interrupted commit was found and rolled back.
    pub replayed: bool,
    /// Number of before-image records applied.
    pub records_applied: usize,
}

pub(crate) fn ensure_consistent(
    files: &mut FileManager,
    wal: &mut WriteAheadLog,
) -> Result<RecoveryReport> {
    let Some(payload) = wal.read().wrap_err("failed to read write-ahead log")? else {
        return Ok(RecoveryReport::default());
    };

    let mut touched: Vec<FileKey> = Vec::new();
    let touch = |key: FileKey, touched: &mut Vec<FileKey>| {
        if !touched.contains(&key) {
            touched.push(key);
        }
    };

    for record in payload.records.iter().rev() {
        let key = match record.file_type {
            FileType::Index => FileKey::index(record.index_id, record.file_id),
            FileType::DeletionIndex => FileKey::deletion_index(),
            FileType::Data => FileKey::data(record.file_id),
        };
        files
            .write_at(key, record.offset, &record.prev)
            .wrap_err("failed to restore a before-image")?;
        touch(key, &mut touched);
    }

    let mut db_tail = [0u8; 6];
    db_tail[0..2].copy_from_slice(&payload.marker.db_last_file.to_le_bytes());
    db_tail[2..6].copy_from_slice(&payload.marker.db_last_size.to_le_bytes());
    files.write_at(FileKey::deletion_index(), 0, &db_tail)?;
    touch(FileKey::deletion_index(), &mut touched);

    for (index_id, last_file, last_size) in &payload.marker.indexes {
        let mut header = [0u8; INDEX_FILE_HEADER_SIZE as usize];
        header[0..2].copy_from_slice(&last_file.to_le_bytes());
        header[2..6].copy_from_slice(&last_size.to_le_bytes());
        files.write_at(FileKey::index(*index_id, 0), 0, &header)?;
        touch(FileKey::index(*index_id, 0), &mut touched);
    }

    for key in &touched {
        files.sync(*key)?;
    }
    wal.truncate()
        .wrap_err("failed to truncate log after recovery")?;

    Ok(RecoveryReport {
        replayed: true,
        records_applied: payload.records.len(),
    })
}
