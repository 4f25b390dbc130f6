//! # Commit Engine
//!
//! Turns a transaction buffer into durable state. The protocol is a strict
//! sequence:
//!
//! 1. Plan placement for every pending write (reuse in place, carve a free
//!    extent, or grow the data-file tail).
//! 2. Make the before-image of every overwritten range durable in the log,
//!    together with the previous tail counters.
//! 3. Write value payloads, then sub-section overwrites.
//! 4. Update the B-tree indexes (inserts, tombstones, renames).
//! 5. Activate extents freed by this commit; retire the ones it consumed.
//! 6. Write the new tail counters to the index and database headers.
//! 7. Sync the touched data and index files.
//! 8. Truncate the log and sync it.
//!
//! ## Staging
//!
//! Steps 1 and 3–6 run first against [`CommitFiles`], a staging layer that
//! queues every write in order and captures the before-image of any range
//! that lies below its file's pre-commit logical size. Reads through the
//! staging layer see earlier staged writes overlaid on the disk state, so
//! repeated writes to one range chain correctly under the log's reverse
//! replay. Only after planning completes does anything touch a file: the log
//! is written and synced (step 2), the staged writes flush in order, and the
//! protocol finishes with the sync and truncate barriers.
//!
//! A crash anywhere before step 8 rolls back on the next open; after step 8
//! the commit is complete. In-memory tail counters promote only after
//! truncation. Any error mid-commit leaves the in-memory engine state
//! unreliable, and the database must be reopened.
//!
//! ## Replay Order Within A Commit
//!
//! Buffered operations apply as renames, then full writes in key order with
//! their sub-section stacks, then deletes. The transaction buffer coalesces
//! same-key sequences so this fixed order reproduces submission semantics.

use std::collections::BTreeSet;

use eyre::{bail, Result};
use hashbrown::HashMap;

use crate::error::StorageError;
use crate::index::IndexValue;
use crate::storage::{
    DeletionIndex, FileIo, FileKey, FileManager, LogPayload, LogRecord, TailMarker,
};

use super::{db_header_image, Engine, Transaction};

struct StagedWrite {
    key: FileKey,
    offset: u32,
    data: Vec<u8>,
}

/// Staging layer for one commit: orders writes, overlays them for reads, and
/// collects before-images for the write-ahead log.
struct CommitFiles<'a> {
    base: &'a mut FileManager,
    /// Pre-commit logical sizes; ranges at or beyond these are appends and
    /// need no before-image. Files not listed fall back to physical length.
    logical: HashMap<FileKey, u32>,
    staged: Vec<StagedWrite>,
    records: Vec<LogRecord>,
}

impl<'a> CommitFiles<'a> {
    fn new(base: &'a mut FileManager, logical: HashMap<FileKey, u32>) -> Self {
        Self {
            base,
            logical,
            staged: Vec::new(),
            records: Vec::new(),
        }
    }
}

impl FileIo for CommitFiles<'_> {
    fn read_at(&mut self, key: FileKey, offset: u32, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        buf.fill(0);

        // Disk state first, clamped to what exists.
        let physical = if self.base.exists(key) {
            self.base.len(key)?
        } else {
            0
        };
        if offset < physical {
            let available = ((physical - offset) as usize).min(buf.len());
            self.base.read_at(key, offset, &mut buf[..available])?;
        }

        // Then every staged write that overlaps, in order.
        let start = offset as u64;
        let end = start + buf.len() as u64;
        for write in &self.staged {
            if write.key != key {
                continue;
            }
            let w_start = write.offset as u64;
            let w_end = w_start + write.data.len() as u64;
            let lo = start.max(w_start);
            let hi = end.min(w_end);
            if lo < hi {
                let src = &write.data[(lo - w_start) as usize..(hi - w_start) as usize];
                buf[(lo - start) as usize..(hi - start) as usize].copy_from_slice(src);
            }
        }
        Ok(())
    }

    fn write_at(&mut self, key: FileKey, offset: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let logical = match self.logical.get(&key) {
            Some(size) => *size,
            None => {
                let size = if self.base.exists(key) {
                    self.base.len(key)?
                } else {
                    0
                };
                self.logical.insert(key, size);
                size
            }
        };

        let end = offset + data.len() as u32;
        let image_end = end.min(logical);
        if offset < image_end {
            let mut prev = vec![0u8; (image_end - offset) as usize];
            self.read_at(key, offset, &mut prev)?;
            self.records.push(LogRecord {
                file_type: key.file_type,
                index_id: key.index_id,
                file_id: key.file_no,
                offset,
                prev,
            });
        }

        self.staged.push(StagedWrite {
            key,
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }
}

/// Commits `tx` against the engine. `finalize` is normally true; crash tests
/// pass false to stop after the staged writes flush, inside the window where
/// only recovery can restore consistency.
pub(crate) fn run(engine: &mut Engine, tx: Transaction, finalize: bool) -> Result<()> {
    if tx.is_empty() {
        return Ok(());
    }

    let Engine {
        files,
        wal,
        deletion,
        last_file,
        last_size,
        indexes,
        max_file_size,
    } = engine;

    let mut touched: BTreeSet<u8> = BTreeSet::new();
    for (index, _) in tx.writes.keys() {
        touched.insert(index.0);
    }
    for (index, _) in &tx.deletes {
        touched.insert(index.0);
    }
    for rename in &tx.renames {
        touched.insert(rename.index.0);
    }
    for id in &touched {
        if !indexes.contains_key(id) {
            bail!(StorageError::InvariantViolation(format!(
                "index {} is not loaded",
                id
            )));
        }
        indexes.get_mut(id).unwrap().stage_reset();
    }

    let mut logical = HashMap::new();
    logical.insert(
        FileKey::deletion_index(),
        crate::config::DB_HEADER_SIZE
            + deletion.num_records() * crate::config::DELETED_SECTION_SIZE,
    );
    logical.insert(FileKey::data(*last_file), *last_size);
    for index in indexes.values() {
        logical.insert(
            FileKey::index(index.id(), index.last_file()),
            index.last_size(),
        );
    }

    let mut cf = CommitFiles::new(files, logical);
    let mut new_db_file = *last_file;
    let mut new_db_size = *last_size;
    let mut freed: Vec<(u16, u32, u32)> = Vec::new();

    // Renames move committed entries before buffered writes land on the new
    // keys. A committed value already under the new key is displaced.
    for rename in &tx.renames {
        let index = indexes.get_mut(&rename.index.0).unwrap();
        let Some(old_value) = index.find(&mut cf, &rename.old)? else {
            continue;
        };
        if let Some(displaced) = index.find(&mut cf, &rename.new)? {
            freed.push((displaced.file_id, displaced.pos, displaced.length));
        }
        index.insert(
            &mut cf,
            IndexValue::new(
                rename.new.clone(),
                old_value.file_id,
                old_value.pos,
                old_value.length,
            ),
        )?;
        index.delete(&mut cf, &rename.old)?;
    }

    // Full writes (key order), each key's sub-section stack in submission
    // order.
    for ((index_id, key), pending) in &tx.writes {
        let index = indexes.get_mut(&index_id.0).unwrap();

        if let Some(full) = &pending.full {
            let data_len = full.len() as u32;
            match index.find(&mut cf, key)? {
                Some(old) if data_len <= old.length => {
                    // Shrink or same size: reuse the location, free the tail.
                    cf.write_at(FileKey::data(old.file_id), old.pos, full)?;
                    if data_len < old.length {
                        freed.push((old.file_id, old.pos + data_len, old.length - data_len));
                    }
                    index.insert(
                        &mut cf,
                        IndexValue::new(key.clone(), old.file_id, old.pos, data_len),
                    )?;
                }
                existing => {
                    if let Some(old) = existing {
                        freed.push((old.file_id, old.pos, old.length));
                    }
                    let (file_id, pos) = allocate(
                        &mut cf,
                        deletion,
                        &mut new_db_file,
                        &mut new_db_size,
                        *max_file_size,
                        data_len,
                    )?;
                    cf.write_at(FileKey::data(file_id), pos, full)?;
                    index.insert(
                        &mut cf,
                        IndexValue::new(key.clone(), file_id, pos, data_len),
                    )?;
                }
            }
            continue;
        }

        for (offset, data) in &pending.subsections {
            let value = index.find(&mut cf, key)?.ok_or_else(|| {
                StorageError::InvariantViolation(format!(
                    "sub-section write to index {} without a base value",
                    index_id.0
                ))
            })?;
            let end = offset + data.len() as u32;
            if end <= value.length {
                cf.write_at(FileKey::data(value.file_id), value.pos + offset, data)?;
            } else {
                // Extension: relocate the whole value into a larger extent.
                let mut extended = vec![0u8; end as usize];
                cf.read_at(
                    FileKey::data(value.file_id),
                    value.pos,
                    &mut extended[..value.length as usize],
                )?;
                extended[*offset as usize..end as usize].copy_from_slice(data);
                freed.push((value.file_id, value.pos, value.length));
                let (file_id, pos) = allocate(
                    &mut cf,
                    deletion,
                    &mut new_db_file,
                    &mut new_db_size,
                    *max_file_size,
                    end,
                )?;
                cf.write_at(FileKey::data(file_id), pos, &extended)?;
                index.insert(&mut cf, IndexValue::new(key.clone(), file_id, pos, end))?;
            }
        }
    }

    // Deletes tombstone the element and surrender its extent.
    for (index_id, key) in &tx.deletes {
        let index = indexes.get_mut(&index_id.0).unwrap();
        if let Some(old) = index.delete(&mut cf, key)? {
            freed.push((old.file_id, old.pos, old.length));
        }
    }

    // Extents freed above activate only now, so a commit never recycles
    // space it freed itself; consumed extents were retired during planning.
    for (file_id, offset, length) in freed {
        if length == 0 {
            continue;
        }
        let write = deletion.release(file_id, offset, length);
        cf.write_at(
            FileKey::deletion_index(),
            write.file_offset(),
            &write.record,
        )?;
    }

    // New tail counters land in the headers after everything else.
    cf.write_at(
        FileKey::deletion_index(),
        0,
        &db_header_image(new_db_file, new_db_size, deletion.num_records()),
    )?;
    for id in &touched {
        let header = indexes[id].header_image();
        cf.write_at(FileKey::index(*id, 0), 0, &header)?;
    }

    // Planning is complete; now the physical sequence begins.
    let marker = TailMarker {
        db_last_file: *last_file,
        db_last_size: *last_size,
        indexes: touched
            .iter()
            .map(|id| {
                let index = &indexes[id];
                (*id, index.last_file(), index.last_size())
            })
            .collect(),
    };
    let CommitFiles {
        staged, records, ..
    } = cf;

    wal.write(&LogPayload { marker, records })?;

    let mut synced: Vec<FileKey> = Vec::new();
    for write in &staged {
        files.write_at(write.key, write.offset, &write.data)?;
        if !synced.contains(&write.key) {
            synced.push(write.key);
        }
    }

    if !finalize {
        return Ok(());
    }

    for key in &synced {
        files.sync(*key)?;
    }
    wal.truncate()?;

    *last_file = new_db_file;
    *last_size = new_db_size;
    for id in &touched {
        indexes.get_mut(id).unwrap().promote_tails();
    }
    Ok(())
}

/// Places `length` bytes: best-fit from the deletion index, else the data
/// tail, rolling to a fresh file when the current one cannot hold the value.
fn allocate(
    cf: &mut CommitFiles<'_>,
    deletion: &mut DeletionIndex,
    new_db_file: &mut u16,
    new_db_size: &mut u32,
    max_file_size: u32,
    length: u32,
) -> Result<(u16, u32)> {
    if length == 0 {
        return Ok((*new_db_file, *new_db_size));
    }

    if let Some((file_id, offset, writes)) = deletion.allocate(length) {
        for write in writes {
            cf.write_at(
                FileKey::deletion_index(),
                write.file_offset(),
                &write.record,
            )?;
        }
        return Ok((file_id, offset));
    }

    let fits = new_db_size
        .checked_add(length)
        .is_some_and(|end| end <= max_file_size);
    if !fits && *new_db_size > 0 {
        if *new_db_file == u16::MAX {
            bail!(StorageError::Full("data file ids exhausted".into()));
        }
        *new_db_file += 1;
        *new_db_size = 0;
    }
    let location = (*new_db_file, *new_db_size);
    *new_db_size += length;
    Ok(location)
}

#[cfg(test)]
mod tests {
    use crate::config::DELETED_SENTINEL;
    use crate::database::{Database, IndexId};
    use tempfile::tempdir;

    const IDX: IndexId = IndexId(1);

    fn open(dir: &std::path::Path) -> Database {
        let db = Database::builder().data_dir(dir).open().unwrap();
        db.load_index(IDX, 2).unwrap();
        db
    }

    fn open_small_files(dir: &std::path::Path, max_file_size: u32) -> Database {
        let db = Database::builder()
            .data_dir(dir)
            .max_file_size(max_file_size)
            .open()
            .unwrap();
        db.load_index(IDX, 2).unwrap();
        db
    }

    fn key(n: u16) -> [u8; 2] {
        n.to_be_bytes()
    }

    #[test]
    fn committed_writes_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let db = open(dir.path());
            let mut tx = db.begin();
            db.write_value(&mut tx, IDX, &key(1), b"A").unwrap();
            db.commit(tx).unwrap();
        }

        let db = open(dir.path());

        assert!(!db.recovery_report().replayed);
        assert_eq!(db.read_value(None, IDX, &key(1)).unwrap().unwrap(), b"A");
    }

    #[test]
    fn crash_after_data_writes_rolls_back_on_reopen() {
        let dir = tempdir().unwrap();
        let (prev_file, prev_size) = {
            let db = open(dir.path());
            let mut tx = db.begin();
            db.write_value(&mut tx, IDX, &key(500), b"baseline").unwrap();
            db.commit(tx).unwrap();
            let engine = db.inner.lock();
            let tails = (engine.last_file, engine.last_size);
            drop(engine);

            // Seventy keys force at least one root split, then the commit
            // stops inside the crash window: data and index files mutated,
            // log not truncated.
            let mut tx = db.begin();
            for n in 0..70u16 {
                db.write_value(&mut tx, IDX, &key(n), &[n as u8; 16]).unwrap();
            }
            db.commit_without_finalize(tx).unwrap();
            tails
        };

        let db = open(dir.path());

        assert!(db.recovery_report().replayed);
        assert!(db.recovery_report().records_applied > 0);
        for n in 0..70u16 {
            assert!(
                db.read_value(None, IDX, &key(n)).unwrap().is_none(),
                "key {} must not survive the torn commit",
                n
            );
        }
        // The pre-transaction state is intact, tails included.
        assert_eq!(
            db.read_value(None, IDX, &key(500)).unwrap().unwrap(),
            b"baseline"
        );
        let engine = db.inner.lock();
        assert_eq!((engine.last_file, engine.last_size), (prev_file, prev_size));
    }

    #[test]
    fn shrinking_a_value_frees_its_tail_into_the_deletion_index() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let mut tx = db.begin();
        db.write_value(&mut tx, IDX, &key(9), &[0xEE; 100]).unwrap();
        db.commit(tx).unwrap();

        let mut tx = db.begin();
        db.write_value(&mut tx, IDX, &key(9), &[0x11; 40]).unwrap();
        db.commit(tx).unwrap();

        assert_eq!(
            db.read_value(None, IDX, &key(9)).unwrap().unwrap(),
            vec![0x11; 40]
        );
        let engine = db.inner.lock();
        let sections: Vec<_> = engine.deletion.active_sections().collect();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].length, 60);
        assert_eq!(sections[0].offset, 40);
    }

    #[test]
    fn freed_space_is_reused_by_a_later_commit() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let mut tx = db.begin();
        db.write_value(&mut tx, IDX, &key(1), &[1u8; 64]).unwrap();
        db.commit(tx).unwrap();
        let mut tx = db.begin();
        db.remove_value(&mut tx, IDX, &key(1)).unwrap();
        db.commit(tx).unwrap();

        let tail_before = db.inner.lock().last_size;
        let mut tx = db.begin();
        db.write_value(&mut tx, IDX, &key(2), &[2u8; 48]).unwrap();
        db.commit(tx).unwrap();

        // The 48-byte value fits in the freed 64-byte extent, so the data
        // tail does not move.
        let engine = db.inner.lock();
        assert_eq!(engine.last_size, tail_before);
        drop(engine);
        assert_eq!(
            db.read_value(None, IDX, &key(2)).unwrap().unwrap(),
            vec![2u8; 48]
        );
    }

    #[test]
    fn a_value_that_no_file_can_extend_rolls_to_a_new_data_file() {
        let dir = tempdir().unwrap();
        let db = open_small_files(dir.path(), 200);
        let mut tx = db.begin();
        db.write_value(&mut tx, IDX, &key(1), &[7u8; 195]).unwrap();
        db.commit(tx).unwrap();
        assert_eq!(db.inner.lock().last_file, 0);

        let mut tx = db.begin();
        db.write_value(&mut tx, IDX, &key(2), &[8u8; 100]).unwrap();
        db.commit(tx).unwrap();

        let engine = db.inner.lock();
        assert_eq!(engine.last_file, 1);
        assert_eq!(engine.last_size, 100);
        drop(engine);
        assert_eq!(
            db.read_value(None, IDX, &key(2)).unwrap().unwrap(),
            vec![8u8; 100]
        );
    }

    #[test]
    fn subsection_commit_splices_into_place() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let mut tx = db.begin();
        db.write_value(&mut tx, IDX, &key(3), &[b'a'; 100]).unwrap();
        db.commit(tx).unwrap();

        let mut tx = db.begin();
        db.write_value_subsection(&mut tx, IDX, &key(3), 10, b"XYZ")
            .unwrap();
        db.commit(tx).unwrap();

        let value = db.read_value(None, IDX, &key(3)).unwrap().unwrap();
        assert_eq!(&value[10..13], b"XYZ");
        assert_eq!(&value[..10], &[b'a'; 10]);
        assert_eq!(&value[13..], &[b'a'; 87]);
        assert_eq!(value.len(), 100);
    }

    #[test]
    fn subsection_extension_relocates_and_frees_the_old_extent() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let mut tx = db.begin();
        db.write_value(&mut tx, IDX, &key(4), &[b'x'; 8]).unwrap();
        db.commit(tx).unwrap();

        let mut tx = db.begin();
        db.write_value_subsection(&mut tx, IDX, &key(4), 6, b"123456")
            .unwrap();
        db.commit(tx).unwrap();

        let value = db.read_value(None, IDX, &key(4)).unwrap().unwrap();
        assert_eq!(value.len(), 12);
        assert_eq!(&value[..6], &[b'x'; 6]);
        assert_eq!(&value[6..], b"123456");
        let engine = db.inner.lock();
        assert!(engine
            .deletion
            .active_sections()
            .any(|section| section.length == 8));
    }

    #[test]
    fn overwrite_from_scratch_sentinel_replaces_the_value() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let mut tx = db.begin();
        db.write_value(&mut tx, IDX, &key(5), &[b'o'; 32]).unwrap();
        db.commit(tx).unwrap();

        let mut tx = db.begin();
        db.write_value_subsection(&mut tx, IDX, &key(5), DELETED_SENTINEL, b"new")
            .unwrap();
        db.commit(tx).unwrap();

        assert_eq!(db.read_value(None, IDX, &key(5)).unwrap().unwrap(), b"new");
    }

    #[test]
    fn rename_combined_with_pending_write_targets_the_new_key() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let mut tx = db.begin();
        db.write_value(&mut tx, IDX, &key(1), b"v1").unwrap();
        db.commit(tx).unwrap();

        // Overwrite then rename inside one transaction: the new bytes must
        // follow the key.
        let mut tx = db.begin();
        db.write_value(&mut tx, IDX, &key(1), b"v2").unwrap();
        db.change_key(&mut tx, IDX, &key(1), &key(2)).unwrap();
        db.commit(tx).unwrap();

        assert!(db.read_value(None, IDX, &key(1)).unwrap().is_none());
        assert_eq!(db.read_value(None, IDX, &key(2)).unwrap().unwrap(), b"v2");
    }

    #[test]
    fn empty_transaction_commits_without_touching_the_log() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());

        let tx = db.begin();
        db.commit(tx).unwrap();

        let mut engine = db.inner.lock();
        assert!(engine.wal.read().unwrap().is_none());
    }

    #[test]
    fn zero_length_values_commit_and_read_back_empty() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());

        let mut tx = db.begin();
        db.write_value(&mut tx, IDX, &key(6), b"").unwrap();
        db.commit(tx).unwrap();

        assert_eq!(db.read_value(None, IDX, &key(6)).unwrap().unwrap(), b"");
        assert_eq!(db.value_length(None, IDX, &key(6)).unwrap(), Some(0));
    }
}
