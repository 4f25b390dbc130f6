//! # tallydb - Embedded Transactional Key-Value Storage
//!
//! tallydb is the storage engine behind a cryptocurrency node's accounting
//! subsystem: a set of ordered B-tree indexes mapping fixed-length binary
//! keys to variable-length values in append-only data files, with crash-safe
//! commits, free-space reclamation, and an in-memory write buffer that
//! delivers modifications atomically.
//!
//! ## Quick Start
//!
//! ```ignore
//! use tallydb::{Database, IndexId};
//!
//! let db = Database::builder().data_dir("./state").open()?;
//! db.load_index(IndexId(3), 20)?;
//!
//! let mut tx = db.begin();
//! db.write_value(&mut tx, IndexId(3), &key, b"value")?;
//! db.commit(tx)?;
//!
//! assert_eq!(db.read_value(None, IndexId(3), &key)?.as_deref(), Some(&b"value"[..]));
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │       Accounter (balances, outputs,         │
//! │        branch-aware history)                │
//! ├─────────────────────────────────────────────┤
//! │   Database API │ Transaction buffer         │
//! ├─────────────────────────────────────────────┤
//! │   Commit engine (staging, before-images)    │
//! ├─────────────────────────────────────────────┤
//! │   B-tree indexes │ Deletion index │ WAL     │
//! ├─────────────────────────────────────────────┤
//! │   File manager (numbered files, one folder) │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Durability Model
//!
//! Commits follow a write-ahead protocol: before-images of every overwritten
//! range become durable in the log before any destructive write, and the log
//! truncates only after the data and index files are synced. A crash at any
//! point is rolled back on the next open, so readers only ever observe a
//! prefix of the commit history.
//!
//! ## Module Overview
//!
//! - [`database`]: public API, transaction buffer, commit, recovery
//! - [`index`]: order-64 B-tree indexes with memory-cached upper levels
//! - [`storage`]: file manager, deletion index, write-ahead log
//! - [`accounter`]: the accounting schema built on the engine
//! - [`config`]: layout constants and engine parameters

pub mod accounter;
pub mod config;
pub mod database;
pub mod error;
pub mod index;
pub mod storage;

pub use accounter::{Accounter, Credit, Outpoint, TransactionEvent};
pub use database::{Database, DatabaseBuilder, IndexId, RecoveryReport, Transaction};
pub use error::StorageError;
