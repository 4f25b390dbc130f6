//! # Error Kinds
//!
//! Fallible operations throughout the engine return `eyre::Result`, with
//! context attached at I/O and recovery boundaries. When the *kind* of a
//! failure matters to a caller, the root cause is a [`StorageError`], which a
//! caller can recover with `report.downcast_ref::<StorageError>()`.
//!
//! Recoverable "absent key" results are expressed as `Ok(None)` by the read
//! APIs; [`StorageError::NotFound`] exists for the places where absence is a
//! hard failure (for example a sub-section write against a missing value).
//!
//! Fatal kinds (`Io`, `Corrupted`, `Full`) leave the in-memory engine state
//! unreliable. The database must be closed and reopened, which runs the
//! consistency check against the write-ahead log.

use thiserror::Error;

/// Classified failure causes for engine operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem failure. Writes do not imply durability; durability is
    /// established only by the explicit sync points of the commit protocol.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected bytes or a checksum mismatch while reading persistent
    /// state, typically detected during recovery.
    #[error("corrupted database state: {0}")]
    Corrupted(String),

    /// The requested key is absent from both the committed store and the
    /// transaction buffer.
    #[error("value not found")]
    NotFound,

    /// Programmer error: wrong key size, sub-section write without a base
    /// value, rename with mismatched key lengths.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// No file ID remains available, or the disk is full.
    #[error("storage exhausted: {0}")]
    Full(String),
}

impl StorageError {
    /// Fatal kinds require closing and reopening the database.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, StorageError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert_from_std() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: StorageError = io.into();

        assert!(matches!(err, StorageError::Io(_)));
        assert!(err.to_string().contains("i/o failure"));
    }

    #[test]
    fn not_found_is_the_only_recoverable_kind() {
        assert!(!StorageError::NotFound.is_fatal());
        assert!(StorageError::Corrupted("bad node".into()).is_fatal());
        assert!(StorageError::Full("file ids exhausted".into()).is_fatal());
        assert!(StorageError::InvariantViolation("key size".into()).is_fatal());
    }

    #[test]
    fn kind_survives_eyre_wrapping() {
        let report = eyre::Report::new(StorageError::Corrupted("log checksum".into()))
            .wrap_err("recovering database");

        let kind = report.downcast_ref::<StorageError>();
        assert!(matches!(kind, Some(StorageError::Corrupted(_))));
    }
}
