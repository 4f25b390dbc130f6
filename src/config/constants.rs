//! # Engine Configuration Constants
//!
//! This module centralizes the fixed parameters of the storage engine,
//! grouping interdependent values together so that a change to one is checked
//! against the others. Constants that feed into on-disk layouts are co-located
//! with the derivation of the layout sizes they imply.
//!
//! ## Dependency Graph
//!
//! ```text
//! BTREE_ELEMENTS (64)
//!       │
//!       ├─> BTREE_HALF_ELEMENTS (derived: BTREE_ELEMENTS / 2)
//!       │     Split boundary: 32 elements stay left, element 32 promotes,
//!       │     32 elements move to the new right sibling.
//!       │
//!       └─> node_disk_size(key_size)
//!             1 count byte
//!             + 64 × (key_size + INDEX_VALUE_META_SIZE) element slots
//!             + 65 × CHILD_POINTER_SIZE child slots
//!
//! DELETED_SENTINEL (0xFFFF_FFFF)
//!       │
//!       ├─> marks a tombstoned index element (length field)
//!       ├─> signals "value does not exist" from raw length queries
//!       └─> as a sub-section offset, requests replacement from scratch
//!
//! DEFAULT_MAX_FILE_SIZE (2 GiB)
//!       │
//!       └─> file offsets are u32; 2 GiB leaves headroom below the 4 GiB
//!           addressing limit. Fixed per database once chosen.
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `BTREE_HALF_ELEMENTS * 2 == BTREE_ELEMENTS` (split arithmetic)
//! 2. `DELETED_SECTION_SIZE` matches the encoded deleted-section record
//! 3. `WAL_RECORD_FIXED_SIZE` matches the fixed prefix of a log record

/// Maximum number of elements per B-tree node.
pub const BTREE_ELEMENTS: usize = 64;

/// Elements remaining in each half after a node split.
pub const BTREE_HALF_ELEMENTS: usize = BTREE_ELEMENTS / 2;

const _: () = assert!(
    BTREE_HALF_ELEMENTS * 2 == BTREE_ELEMENTS,
    "BTREE_ELEMENTS must be even for median-promotion splits"
);

/// Length value marking a tombstoned index element. The same constant is
/// returned where an API reports "does not exist" as a raw length, and is
/// accepted as a sub-section offset meaning "replace the value from scratch".
pub const DELETED_SENTINEL: u32 = 0xFFFF_FFFF;

/// Default upper bound on a single data or index file. Fixed per database.
pub const DEFAULT_MAX_FILE_SIZE: u32 = 0x8000_0000;

/// Default byte budget for the memory-cached levels of each index.
pub const DEFAULT_INDEX_CACHE_LIMIT: u32 = 10 * 1024 * 1024;

// ============================================================================
// ON-DISK LAYOUT SIZES
// These mirror the serialized formats in storage/ and index/.
// ============================================================================

/// Index file header: `[last_file: u16 LE | last_size: u32 LE]`.
pub const INDEX_FILE_HEADER_SIZE: u32 = 6;

/// Database header at the start of the deletion-index file:
/// `[last_file: u16 LE | last_size: u32 LE | num_records: u32 LE]`.
pub const DB_HEADER_SIZE: u32 = 10;

/// One deleted-section record:
/// `[active: u8 | length: u32 BE | file_id: u16 LE | offset: u32 LE | reserved: u8]`.
pub const DELETED_SECTION_SIZE: u32 = 12;

/// Serialized size of the positional part of an index element
/// (`file_id: u16 | pos: u32 | length: u32`), excluding the key.
pub const INDEX_VALUE_META_SIZE: usize = 10;

/// One serialized child pointer: `[index_file: u16 LE | offset: u32 LE]`.
pub const CHILD_POINTER_SIZE: usize = 6;

/// Log file header: `[used_len: u32 LE | crc64: u64 LE]`.
pub const WAL_HEADER_SIZE: usize = 12;

/// Fixed prefix of one log record, before the variable `prev_bytes`:
/// `[record_len: u32 | file_type: u8 | index_id: u8 | file_id: u16 |
///   offset: u32 | prev_len: u32]`.
pub const WAL_RECORD_FIXED_SIZE: usize = 16;

/// Serialized size of a B-tree node for an index with the given key size.
pub const fn node_disk_size(key_size: u8) -> u32 {
    1 + BTREE_ELEMENTS as u32 * (key_size as u32 + INDEX_VALUE_META_SIZE as u32)
        + (BTREE_ELEMENTS as u32 + 1) * CHILD_POINTER_SIZE as u32
}

const _: () = assert!(
    node_disk_size(10) == 1 + 64 * 20 + 65 * 6,
    "node_disk_size derivation mismatch"
);
