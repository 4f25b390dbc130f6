//! # Write-Ahead Log
//!
//! Before-image log that makes the commit protocol crash-safe. Before any
//! byte of previously committed state is overwritten, the commit engine
//! collects the range's current contents into a log record; the full set of
//! records for a commit, together with the previous tail counters of the
//! database and every touched index, is written to the `log` file and synced
//! before the first destructive write reaches any other file.
//!
//! ## File Format
//!
//! ```text
//! +---------------------------+
//! | used_len : u32 LE         |  0 means the log is empty (clean shutdown)
//! | crc64    : u64 LE         |  CRC-64/ECMA over the payload bytes
//! +---------------------------+
//! | payload                   |
//! |   tail marker             |
//! |   record*                 |
//! +---------------------------+
//!
//! tail marker = [n_indexes:1 | db_last_file:2 | db_last_size:4]
//!               n_indexes × [index_id:1 | last_file:2 | last_size:4]
//! record      = [record_len:4 | file_type:1 | index_id:1 | file_id:2 |
//!                offset:4 | prev_len:4 | prev_bytes]
//! ```
//!
//! `record_len` counts the bytes that follow it, so a scan can skip records
//! without interpreting them.
//!
//! ## Write Protocol
//!
//! The payload is assembled fully in memory and written in one pass at
//! offset 12; the header (length plus checksum) is written last, then the
//! file is synced. A crash mid-write leaves `used_len` at zero, which is
//! indistinguishable from a clean log. Truncation zeroes the header and
//! syncs; payload bytes beyond the header are dead and get overwritten by
//! the next commit.
//!
//! ## Recovery Contract
//!
//! A non-zero `used_len` on open means the previous commit did not reach its
//! truncation point. The recovery path verifies the checksum (mismatch is a
//! corruption error, not silent data loss), replays the records in reverse
//! so that the earliest image of every range wins, restores the recorded
//! tail counters, and truncates. Replaying is idempotent; a crash during
//! recovery simply replays the same images again.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{bail, Result, WrapErr};
use zerocopy::byteorder::{LittleEndian, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{WAL_HEADER_SIZE, WAL_RECORD_FIXED_SIZE};
use crate::error::StorageError;

use super::FileType;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct LogHeader {
    used_len: U32<LittleEndian>,
    crc64: U64<LittleEndian>,
}

const _: () = assert!(size_of::<LogHeader>() == WAL_HEADER_SIZE);

/// Before-image of one byte range that a commit overwrites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub file_type: FileType,
    pub index_id: u8,
    pub file_id: u16,
    pub offset: u32,
    pub prev: Vec<u8>,
}

/// Previous tail counters for the database and each index a commit touches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TailMarker {
    pub db_last_file: u16,
    pub db_last_size: u32,
    /// `(index_id, last_file, last_size)` triples.
    pub indexes: Vec<(u8, u16, u32)>,
}

/// Everything one commit appends to the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogPayload {
    pub marker: TailMarker,
    pub records: Vec<LogRecord>,
}

impl LogPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            7 + self.marker.indexes.len() * 7
                + self
                    .records
                    .iter()
                    .map(|r| WAL_RECORD_FIXED_SIZE + r.prev.len())
                    .sum::<usize>(),
        );

        out.push(self.marker.indexes.len() as u8);
        out.extend_from_slice(&self.marker.db_last_file.to_le_bytes());
        out.extend_from_slice(&self.marker.db_last_size.to_le_bytes());
        for (index_id, last_file, last_size) in &self.marker.indexes {
            out.push(*index_id);
            out.extend_from_slice(&last_file.to_le_bytes());
            out.extend_from_slice(&last_size.to_le_bytes());
        }

        for record in &self.records {
            let record_len = (WAL_RECORD_FIXED_SIZE - 4 + record.prev.len()) as u32;
            out.extend_from_slice(&record_len.to_le_bytes());
            out.push(record.file_type.as_u8());
            out.push(record.index_id);
            out.extend_from_slice(&record.file_id.to_le_bytes());
            out.extend_from_slice(&record.offset.to_le_bytes());
            out.extend_from_slice(&(record.prev.len() as u32).to_le_bytes());
            out.extend_from_slice(&record.prev);
        }

        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { bytes, pos: 0 };

        let n_indexes = cursor.u8()? as usize;
        let db_last_file = cursor.u16()?;
        let db_last_size = cursor.u32()?;
        let mut indexes = Vec::with_capacity(n_indexes);
        for _ in 0..n_indexes {
            let index_id = cursor.u8()?;
            let last_file = cursor.u16()?;
            let last_size = cursor.u32()?;
            indexes.push((index_id, last_file, last_size));
        }

        let mut records = Vec::new();
        while cursor.pos < bytes.len() {
            let record_len = cursor.u32()? as usize;
            let file_type = FileType::from_u8(cursor.u8()?).ok_or_else(|| {
                StorageError::Corrupted("log record names an unknown file type".into())
            })?;
            let index_id = cursor.u8()?;
            let file_id = cursor.u16()?;
            let offset = cursor.u32()?;
            let prev_len = cursor.u32()? as usize;
            if record_len != WAL_RECORD_FIXED_SIZE - 4 + prev_len {
                bail!(StorageError::Corrupted(format!(
                    "log record length {} does not match its image length {}",
                    record_len, prev_len
                )));
            }
            let prev = cursor.take(prev_len)?.to_vec();
            records.push(LogRecord {
                file_type,
                index_id,
                file_id,
                offset,
                prev,
            });
        }

        Ok(Self {
            marker: TailMarker {
                db_last_file,
                db_last_size,
                indexes,
            },
            records,
        })
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            bail!(StorageError::Corrupted(format!(
                "log payload truncated at byte {}",
                self.pos
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
}

/// The `log` file of one database, held open for the database's lifetime.
#[derive(Debug)]
pub struct WriteAheadLog {
    file: File,
}

impl WriteAheadLog {
    /// Opens (or creates) the log file. A fresh file gets a zeroed header so
    /// that a later open never mistakes it for a pending commit.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open log file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err("failed to stat log file")?
            .len();
        if len < WAL_HEADER_SIZE as u64 {
            file.seek(SeekFrom::Start(0))
                .wrap_err("failed to seek log file")?;
            file.write_all(&[0u8; WAL_HEADER_SIZE])
                .wrap_err("failed to initialize log header")?;
            file.sync_all().wrap_err("failed to sync fresh log header")?;
        }

        Ok(Self { file })
    }

    /// Writes the payload and then the header, and syncs. After this returns,
    /// every before-image is durable.
    pub fn write(&mut self, payload: &LogPayload) -> Result<()> {
        let bytes = payload.encode();
        let header = LogHeader {
            used_len: U32::new(bytes.len() as u32),
            crc64: U64::new(CRC64.checksum(&bytes)),
        };

        self.file
            .seek(SeekFrom::Start(WAL_HEADER_SIZE as u64))
            .wrap_err("failed to seek log file")?;
        self.file
            .write_all(&bytes)
            .wrap_err("failed to write log payload")?;
        self.file
            .seek(SeekFrom::Start(0))
            .wrap_err("failed to seek log file")?;
        self.file
            .write_all(header.as_bytes())
            .wrap_err("failed to write log header")?;
        self.file.sync_all().wrap_err("failed to sync log file")
    }

    /// Reads the pending payload, if the log is non-empty.
    ///
    /// A checksum or format mismatch is a corruption error; the caller must
    /// not guess at partial state.
    pub fn read(&mut self) -> Result<Option<LogPayload>> {
        self.file
            .seek(SeekFrom::Start(0))
            .wrap_err("failed to seek log file")?;
        let mut header_bytes = [0u8; WAL_HEADER_SIZE];
        self.file
            .read_exact(&mut header_bytes)
            .wrap_err("failed to read log header")?;
        let header = LogHeader::ref_from_bytes(&header_bytes)
            .map_err(|e| eyre::eyre!("failed to parse log header: {:?}", e))?;

        let used_len = header.used_len.get() as usize;
        if used_len == 0 {
            return Ok(None);
        }

        let mut payload = vec![0u8; used_len];
        self.file
            .read_exact(&mut payload)
            .map_err(|_| StorageError::Corrupted("log payload shorter than its header".into()))?;

        let checksum = CRC64.checksum(&payload);
        if checksum != header.crc64.get() {
            bail!(StorageError::Corrupted(format!(
                "log checksum mismatch: stored {:#018x}, computed {:#018x}",
                header.crc64.get(),
                checksum
            )));
        }

        LogPayload::decode(&payload).map(Some)
    }

    /// Zeroes the header and syncs. An empty log equals a completed commit.
    pub fn truncate(&mut self) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(0))
            .wrap_err("failed to seek log file")?;
        self.file
            .write_all(&[0u8; WAL_HEADER_SIZE])
            .wrap_err("failed to zero log header")?;
        self.file.sync_all().wrap_err("failed to sync log truncation")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_payload() -> LogPayload {
        LogPayload {
            marker: TailMarker {
                db_last_file: 2,
                db_last_size: 4096,
                indexes: vec![(3, 0, 1677), (7, 1, 6)],
            },
            records: vec![
                LogRecord {
                    file_type: FileType::Data,
                    index_id: 0,
                    file_id: 2,
                    offset: 128,
                    prev: b"old-value".to_vec(),
                },
                LogRecord {
                    file_type: FileType::Index,
                    index_id: 3,
                    file_id: 0,
                    offset: 6,
                    prev: vec![0xAB; 33],
                },
            ],
        }
    }

    #[test]
    fn payload_encoding_round_trips() {
        let payload = sample_payload();

        let decoded = LogPayload::decode(&payload.encode()).unwrap();

        assert_eq!(decoded, payload);
    }

    #[test]
    fn truncated_payload_is_reported_as_corruption() {
        let bytes = sample_payload().encode();

        let result = LogPayload::decode(&bytes[..bytes.len() - 3]);

        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::Corrupted(_))
        ));
    }

    #[test]
    fn fresh_log_reads_as_clean() {
        let dir = tempdir().unwrap();
        let mut wal = WriteAheadLog::open(&dir.path().join("log")).unwrap();

        assert!(wal.read().unwrap().is_none());
    }

    #[test]
    fn written_payload_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        let payload = sample_payload();

        {
            let mut wal = WriteAheadLog::open(&path).unwrap();
            wal.write(&payload).unwrap();
        }

        let mut wal = WriteAheadLog::open(&path).unwrap();
        assert_eq!(wal.read().unwrap(), Some(payload));
    }

    #[test]
    fn truncate_marks_the_log_clean_without_shrinking_it() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        let mut wal = WriteAheadLog::open(&path).unwrap();
        wal.write(&sample_payload()).unwrap();

        wal.truncate().unwrap();

        assert!(wal.read().unwrap().is_none());
        // Stale payload bytes past the header are dead, not harmful.
        assert!(path.metadata().unwrap().len() > WAL_HEADER_SIZE as u64);
    }

    #[test]
    fn corrupted_payload_fails_the_checksum() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        let mut wal = WriteAheadLog::open(&path).unwrap();
        wal.write(&sample_payload()).unwrap();
        drop(wal);

        // Flip one payload byte behind the log's back.
        let mut raw = std::fs::read(&path).unwrap();
        raw[WAL_HEADER_SIZE + 2] ^= 0xFF;
        std::fs::write(&path, &raw).unwrap();

        let mut wal = WriteAheadLog::open(&path).unwrap();
        let err = wal.read().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::Corrupted(_))
        ));
    }
}
