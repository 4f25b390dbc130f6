//! # Database Module
//!
//! Public surface of the storage engine. A [`Database`] owns one folder of
//! numbered files, the deletion index, the write-ahead log, and the loaded
//! B-tree indexes. All modifications are staged in a [`Transaction`] and
//! delivered atomically by [`Database::commit`].
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Database (public API)                │
//! ├────────────────────────────┬────────────────────────────┤
//! │     Transaction buffer     │        Commit engine       │
//! │  (pending writes/deletes/  │  (staging, before-images,  │
//! │   renames, read overlay)   │   ordered flush, recovery) │
//! ├────────────────────────────┴────────────────────────────┤
//! │                  B-tree indexes (index/)                │
//! ├─────────────────────────────────────────────────────────┤
//! │   File manager │ Deletion index │ Write-ahead log       │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Reads
//!
//! Readers observe the committed state plus their own transaction buffer: a
//! pending full write serves from its bytes, pending sub-sections overlay a
//! committed base read, a pending delete reads as absent, and a pending
//! rename redirects the target key to its committed source.
//!
//! ## Concurrency
//!
//! The engine state sits behind one mutex, making `Database` freely shareable
//! while keeping the single-writer contract: at most one commit runs at a
//! time, and readers see either the state before it or after it. The folder
//! must not be opened by more than one engine instance; embedders are
//! expected to guarantee that.
//!
//! ## Lifecycle
//!
//! Opening a database runs the crash-consistency check: a non-empty log from
//! an interrupted commit is replayed (restoring every overwritten range and
//! the tail counters) before any index is loaded. Indexes are loaded lazily
//! by id with their key size and cache budget.

mod builder;
mod commit;
mod recovery;
mod transaction;

pub use builder::DatabaseBuilder;
pub use recovery::RecoveryReport;
pub use transaction::Transaction;

use std::path::PathBuf;

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::config::{DB_HEADER_SIZE, DELETED_SECTION_SIZE, DELETED_SENTINEL};
use crate::error::StorageError;
use crate::index::{lexicographic, BTreeIndex, KeyCompare};
use crate::storage::{DeletionIndex, FileIo, FileKey, FileManager, WriteAheadLog};

use transaction::splice;

/// Identifier of one logical index within a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexId(pub u8);

pub(crate) struct Engine {
    pub(crate) files: FileManager,
    pub(crate) wal: WriteAheadLog,
    pub(crate) deletion: DeletionIndex,
    /// Data-file tail: id and size of the most recently written data file.
    pub(crate) last_file: u16,
    pub(crate) last_size: u32,
    pub(crate) indexes: HashMap<u8, BTreeIndex>,
    pub(crate) max_file_size: u32,
}

pub(crate) struct DatabaseOptions {
    pub data_dir: PathBuf,
    pub folder: String,
    pub max_file_size: u32,
    pub index_cache_limit: u32,
}

/// An embedded transactional key-value store over ordered B-tree indexes.
pub struct Database {
    inner: Mutex<Engine>,
    recovery: RecoveryReport,
    index_cache_limit: u32,
}

impl Database {
    /// Starts configuring a database. See [`DatabaseBuilder`].
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::new()
    }

    pub(crate) fn open_with(options: DatabaseOptions) -> Result<Self> {
        let mut files = FileManager::open(&options.data_dir, &options.folder)?;
        let mut wal = WriteAheadLog::open(&files.folder_path().join("log"))
            .wrap_err("failed to open write-ahead log")?;

        let recovery = recovery::ensure_consistent(&mut files, &mut wal)
            .wrap_err("failed to recover database")?;

        let (last_file, last_size, num_records) = read_db_header(&mut files)?;
        let deletion = load_deletion_index(&mut files, num_records)?;

        Ok(Self {
            inner: Mutex::new(Engine {
                files,
                wal,
                deletion,
                last_file,
                last_size,
                indexes: HashMap::new(),
                max_file_size: options.max_file_size,
            }),
            recovery,
            index_cache_limit: options.index_cache_limit,
        })
    }

    /// What the consistency check found and did while opening.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Loads (or creates) an index with the default cache budget and
    /// lexicographic key ordering.
    pub fn load_index(&self, index: IndexId, key_size: u8) -> Result<()> {
        self.load_index_with(index, key_size, self.index_cache_limit, lexicographic)
    }

    /// Loads (or creates) an index with an explicit cache budget and
    /// comparator. Loading an already-loaded index verifies the key size and
    /// is otherwise a no-op.
    pub fn load_index_with(
        &self,
        index: IndexId,
        key_size: u8,
        cache_limit: u32,
        compare: KeyCompare,
    ) -> Result<()> {
        let mut engine = self.inner.lock();
        if let Some(existing) = engine.indexes.get(&index.0) {
            if existing.key_size() != key_size {
                bail!(StorageError::InvariantViolation(format!(
                    "index {} is loaded with {}-byte keys, requested {}",
                    index.0,
                    existing.key_size(),
                    key_size
                )));
            }
            return Ok(());
        }

        let engine = &mut *engine;
        let loaded = BTreeIndex::load(
            &mut engine.files,
            index.0,
            key_size,
            cache_limit,
            engine.max_file_size,
            compare,
        )
        .wrap_err_with(|| format!("failed to load index {}", index.0))?;
        engine.indexes.insert(index.0, loaded);
        Ok(())
    }

    /// Creates an empty transaction.
    pub fn begin(&self) -> Transaction {
        Transaction::new()
    }

    /// Queues a full-replacement write. Replaces any pending write for the
    /// key and cancels a pending delete.
    pub fn write_value(
        &self,
        tx: &mut Transaction,
        index: IndexId,
        key: &[u8],
        data: &[u8],
    ) -> Result<()> {
        let engine = self.inner.lock();
        check_key(&engine, index, key)?;
        ensure!(
            (data.len() as u64) < DELETED_SENTINEL as u64,
            "value of {} bytes exceeds the addressable length",
            data.len()
        );
        drop(engine);
        tx.stage_full_write(index, key.to_vec(), data.to_vec());
        Ok(())
    }

    /// Queues a full write whose value is the concatenation of `parts`.
    pub fn write_concatenated_value(
        &self,
        tx: &mut Transaction,
        index: IndexId,
        key: &[u8],
        parts: &[&[u8]],
    ) -> Result<()> {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        let mut data = Vec::with_capacity(total);
        for part in parts {
            data.extend_from_slice(part);
        }
        self.write_value(tx, index, key, &data)
    }

    /// Queues an overwrite of a sub-section of an existing value, extending
    /// it when the write reaches past the end. Passing `DELETED_SENTINEL` as
    /// the offset replaces the value from scratch.
    ///
    /// The key must exist, either persistently or as a pending write.
    pub fn write_value_subsection(
        &self,
        tx: &mut Transaction,
        index: IndexId,
        key: &[u8],
        offset: u32,
        data: &[u8],
    ) -> Result<()> {
        if offset == DELETED_SENTINEL {
            return self.write_value(tx, index, key, data);
        }

        let mut engine = self.inner.lock();
        check_key(&engine, index, key)?;
        if effective_length(&mut engine, Some(tx), index, key)?.is_none() {
            bail!(StorageError::InvariantViolation(format!(
                "sub-section write to index {} without a base value",
                index.0
            )));
        }
        drop(engine);
        tx.stage_subsection(index, key.to_vec(), offset, data.to_vec());
        Ok(())
    }

    /// Queues a delete. Drops any pending writes for the key; deleting a key
    /// that does not exist commits as a no-op.
    pub fn remove_value(&self, tx: &mut Transaction, index: IndexId, key: &[u8]) -> Result<()> {
        let engine = self.inner.lock();
        check_key(&engine, index, key)?;
        drop(engine);
        tx.stage_delete(index, key.to_vec());
        Ok(())
    }

    /// Queues a key rename. A pending write for `old` is retargeted to
    /// `new`; a committed value under `old` moves to `new` at commit, where
    /// it replaces (and frees) any committed value under `new`.
    pub fn change_key(
        &self,
        tx: &mut Transaction,
        index: IndexId,
        old: &[u8],
        new: &[u8],
    ) -> Result<()> {
        let mut engine = self.inner.lock();
        check_key(&engine, index, old)?;
        check_key(&engine, index, new)?;

        let engine = &mut *engine;
        let committed = get_index(&engine.indexes, index)?
            .find(&mut engine.files, old)?
            .is_some();
        let via_rename = tx.rename_source_of(index, old).is_some();

        tx.retarget_write(index, old, new);
        if committed || via_rename {
            tx.stage_rename(index, old.to_vec(), new.to_vec());
        }
        Ok(())
    }

    /// Reads a whole value, observing the transaction buffer when given.
    pub fn read_value(
        &self,
        tx: Option<&Transaction>,
        index: IndexId,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let mut engine = self.inner.lock();
        effective_value(&mut engine, tx, index, key)
    }

    /// Reads `length` bytes starting at `offset`. A range that reaches past
    /// the value's end reads as absent.
    pub fn read_value_section(
        &self,
        tx: Option<&Transaction>,
        index: IndexId,
        key: &[u8],
        offset: u32,
        length: u32,
    ) -> Result<Option<Vec<u8>>> {
        let mut engine = self.inner.lock();
        let Some(value) = effective_value(&mut engine, tx, index, key)? else {
            return Ok(None);
        };
        let start = offset as usize;
        let end = start + length as usize;
        if end > value.len() {
            return Ok(None);
        }
        Ok(Some(value[start..end].to_vec()))
    }

    /// Total current length of a value, accounting for pending full writes
    /// and the furthest extent reached by pending sub-sections.
    pub fn value_length(
        &self,
        tx: Option<&Transaction>,
        index: IndexId,
        key: &[u8],
    ) -> Result<Option<u32>> {
        let mut engine = self.inner.lock();
        effective_length(&mut engine, tx, index, key)
    }

    /// All committed keys of an index in ascending comparator order.
    pub fn scan_keys(&self, index: IndexId) -> Result<Vec<Vec<u8>>> {
        let mut engine = self.inner.lock();
        let engine = &mut *engine;
        let idx = get_index(&engine.indexes, index)?;
        let mut keys = Vec::new();
        idx.scan(&mut engine.files, &mut |el| keys.push(el.key.clone()))?;
        Ok(keys)
    }

    /// Commits the transaction: log before-images, place data, update
    /// indexes, reclaim extents, promote tails, truncate the log. Atomic at
    /// the log-truncate boundary.
    pub fn commit(&self, tx: Transaction) -> Result<()> {
        let mut engine = self.inner.lock();
        commit::run(&mut engine, tx, true)
    }

    /// Runs a commit but stops before the data sync and log truncation,
    /// leaving the folder exactly as a crash inside the commit window would.
    #[cfg(test)]
    pub(crate) fn commit_without_finalize(&self, tx: Transaction) -> Result<()> {
        let mut engine = self.inner.lock();
        commit::run(&mut engine, tx, false)
    }
}

fn check_key(engine: &Engine, index: IndexId, key: &[u8]) -> Result<()> {
    let idx = get_index(&engine.indexes, index)?;
    if key.len() != idx.key_size() as usize {
        bail!(StorageError::InvariantViolation(format!(
            "key is {} bytes, index {} uses {}-byte keys",
            key.len(),
            index.0,
            idx.key_size()
        )));
    }
    Ok(())
}

pub(crate) fn get_index(indexes: &HashMap<u8, BTreeIndex>, index: IndexId) -> Result<&BTreeIndex> {
    match indexes.get(&index.0) {
        Some(idx) => Ok(idx),
        None => bail!(StorageError::InvariantViolation(format!(
            "index {} is not loaded",
            index.0
        ))),
    }
}

fn read_committed(
    files: &mut FileManager,
    indexes: &HashMap<u8, BTreeIndex>,
    index: IndexId,
    key: &[u8],
) -> Result<Option<Vec<u8>>> {
    let idx = get_index(indexes, index)?;
    let Some(value) = idx.find(files, key)? else {
        return Ok(None);
    };
    let mut buf = vec![0u8; value.length as usize];
    files.read_at(FileKey::data(value.file_id), value.pos, &mut buf)?;
    Ok(Some(buf))
}

fn effective_value(
    engine: &mut Engine,
    tx: Option<&Transaction>,
    index: IndexId,
    key: &[u8],
) -> Result<Option<Vec<u8>>> {
    let Engine { files, indexes, .. } = engine;

    if let Some(tx) = tx {
        if tx.is_deleted(index, key) {
            return Ok(None);
        }
        if let Some(pending) = tx.pending(index, key) {
            if let Some(full) = &pending.full {
                return Ok(Some(full.clone()));
            }
            let mut base = read_committed(files, indexes, index, key)?.unwrap_or_default();
            for (offset, data) in &pending.subsections {
                splice(&mut base, *offset as usize, data);
            }
            return Ok(Some(base));
        }
        if tx.is_renamed_away(index, key) {
            return Ok(None);
        }
        if let Some(old) = tx.rename_source_of(index, key) {
            let old = old.to_vec();
            return read_committed(files, indexes, index, &old);
        }
    }

    read_committed(files, indexes, index, key)
}

fn effective_length(
    engine: &mut Engine,
    tx: Option<&Transaction>,
    index: IndexId,
    key: &[u8],
) -> Result<Option<u32>> {
    let Engine { files, indexes, .. } = engine;
    let committed = |files: &mut FileManager, key: &[u8]| -> Result<Option<u32>> {
        Ok(get_index(indexes, index)?
            .find(files, key)?
            .map(|v| v.length))
    };

    if let Some(tx) = tx {
        if tx.is_deleted(index, key) {
            return Ok(None);
        }
        if let Some(pending) = tx.pending(index, key) {
            if let Some(full) = &pending.full {
                return Ok(Some(full.len() as u32));
            }
            let base = committed(files, key)?.unwrap_or(0);
            let reach = pending
                .subsections
                .iter()
                .map(|(offset, data)| offset + data.len() as u32)
                .max()
                .unwrap_or(0);
            return Ok(Some(base.max(reach)));
        }
        if tx.is_renamed_away(index, key) {
            return Ok(None);
        }
        if let Some(old) = tx.rename_source_of(index, key) {
            let old = old.to_vec();
            return committed(files, &old);
        }
    }

    committed(files, key)
}

fn read_db_header(files: &mut FileManager) -> Result<(u16, u32, u32)> {
    let del = FileKey::deletion_index();
    if !files.exists(del) || files.len(del)? < DB_HEADER_SIZE {
        files.write_at(del, 0, &[0u8; DB_HEADER_SIZE as usize])?;
        files.sync(del)?;
        return Ok((0, 0, 0));
    }

    let mut header = [0u8; DB_HEADER_SIZE as usize];
    files.read_at(del, 0, &mut header)?;
    let last_file = u16::from_le_bytes(header[0..2].try_into().unwrap());
    let last_size = u32::from_le_bytes(header[2..6].try_into().unwrap());
    let num_records = u32::from_le_bytes(header[6..10].try_into().unwrap());
    Ok((last_file, last_size, num_records))
}

fn load_deletion_index(files: &mut FileManager, num_records: u32) -> Result<DeletionIndex> {
    if num_records == 0 {
        return Ok(DeletionIndex::new());
    }
    let mut records = vec![0u8; (num_records * DELETED_SECTION_SIZE) as usize];
    files.read_at(FileKey::deletion_index(), DB_HEADER_SIZE, &mut records)?;
    DeletionIndex::load(&records, num_records).wrap_err("failed to load deletion index")
}

pub(crate) fn db_header_image(last_file: u16, last_size: u32, num_records: u32) -> [u8; 10] {
    let mut out = [0u8; DB_HEADER_SIZE as usize];
    out[0..2].copy_from_slice(&last_file.to_le_bytes());
    out[2..6].copy_from_slice(&last_size.to_le_bytes());
    out[6..10].copy_from_slice(&num_records.to_le_bytes());
    out
}
