//! # Accounter Key Schema
//!
//! Key builders and record layouts for the accounting indexes. Every index
//! uses fixed-length keys; multi-field keys serialize their numeric fields
//! big-endian so that the engine's lexicographic comparator sorts them
//! numerically, which is what makes the per-account time index a usable
//! history scan.
//!
//! Record payloads (values) are little-endian, matching the engine's own
//! on-disk convention for non-sorting fields.
//!
//! ## Index Families
//!
//! | Index                     | Key layout                                   | Value            |
//! |---------------------------|----------------------------------------------|------------------|
//! | `COUNTERS`                | `[0]`                                        | next ids (24 B)  |
//! | `TX_DETAILS`              | `tx_id:8`                                    | details (41 B)   |
//! | `TX_HASH_TO_ID`           | `hash:32`                                    | `tx_id` (8 B)    |
//! | `BRANCH_TX_DETAILS`       | `branch:1 │ tx_id:8`                         | height (4 B)     |
//! | `OUTPUT_DETAILS`          | `output_id:8`                                | details (44 B)   |
//! | `OUTPOINT_TO_ID`          | `tx_hash:32 │ out_index:4`                   | `output_id` (8 B)|
//! | `BRANCH_OUTPUT_SPENT`     | `branch:1 │ output_id:8`                     | flag (1 B)       |
//! | `OUTPUT_ACCOUNTS`         | `output_id:8 │ account:8`                    | empty            |
//! | `ACCOUNT_TX_DETAILS`      | `account:8 │ tx_id:8`                        | delta (8 B)      |
//! | `TX_ACCOUNTS`             | `tx_id:8 │ account:8`                        | empty            |
//! | `BRANCH_ACCOUNT_BALANCE`  | `branch:1 │ account:8`                       | balance (8 B)    |
//! | `ACCOUNT_TIME_TX`         | `branch:1 │ account:8 │ time:8 │ tx_id:8`    | empty            |
//! | `ACCOUNT_UNSPENT_OUTPUTS` | `branch:1 │ account:8 │ output_id:8`         | empty            |
//! | `WATCHED_HASHES`          | `addr_hash:20 │ account:8`                   | empty            |
//! | `TX_HEIGHT_BRANCH_AND_ID` | `branch:1 │ height:4 │ tx_id:8`              | empty            |

use crate::database::IndexId;

pub const COUNTERS: IndexId = IndexId(0);
pub const TX_DETAILS: IndexId = IndexId(1);
pub const TX_HASH_TO_ID: IndexId = IndexId(2);
pub const BRANCH_TX_DETAILS: IndexId = IndexId(3);
pub const OUTPUT_DETAILS: IndexId = IndexId(4);
pub const OUTPOINT_TO_ID: IndexId = IndexId(5);
pub const BRANCH_OUTPUT_SPENT: IndexId = IndexId(6);
pub const OUTPUT_ACCOUNTS: IndexId = IndexId(7);
pub const ACCOUNT_TX_DETAILS: IndexId = IndexId(8);
pub const BRANCH_ACCOUNT_BALANCE: IndexId = IndexId(9);
pub const ACCOUNT_TIME_TX: IndexId = IndexId(10);
pub const ACCOUNT_UNSPENT_OUTPUTS: IndexId = IndexId(11);
pub const WATCHED_HASHES: IndexId = IndexId(12);
pub const TX_ACCOUNTS: IndexId = IndexId(13);
pub const TX_HEIGHT_BRANCH_AND_ID: IndexId = IndexId(14);

/// `(index, key_size)` pairs for everything the accounter loads at open.
pub(crate) const SCHEMA: &[(IndexId, u8)] = &[
    (COUNTERS, 1),
    (TX_DETAILS, 8),
    (TX_HASH_TO_ID, 32),
    (BRANCH_TX_DETAILS, 9),
    (OUTPUT_DETAILS, 8),
    (OUTPOINT_TO_ID, 36),
    (BRANCH_OUTPUT_SPENT, 9),
    (OUTPUT_ACCOUNTS, 16),
    (ACCOUNT_TX_DETAILS, 16),
    (BRANCH_ACCOUNT_BALANCE, 9),
    (ACCOUNT_TIME_TX, 25),
    (ACCOUNT_UNSPENT_OUTPUTS, 17),
    (WATCHED_HASHES, 28),
    (TX_ACCOUNTS, 16),
    (TX_HEIGHT_BRANCH_AND_ID, 13),
];

pub fn counters_key() -> [u8; 1] {
    [0]
}

pub fn tx_details_key(tx_id: u64) -> [u8; 8] {
    tx_id.to_be_bytes()
}

pub fn tx_hash_key(hash: &[u8; 32]) -> [u8; 32] {
    *hash
}

pub fn branch_tx_key(branch: u8, tx_id: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = branch;
    key[1..9].copy_from_slice(&tx_id.to_be_bytes());
    key
}

pub fn output_details_key(output_id: u64) -> [u8; 8] {
    output_id.to_be_bytes()
}

pub fn outpoint_key(tx_hash: &[u8; 32], out_index: u32) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[0..32].copy_from_slice(tx_hash);
    key[32..36].copy_from_slice(&out_index.to_be_bytes());
    key
}

pub fn branch_output_key(branch: u8, output_id: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = branch;
    key[1..9].copy_from_slice(&output_id.to_be_bytes());
    key
}

pub fn output_account_key(output_id: u64, account: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[0..8].copy_from_slice(&output_id.to_be_bytes());
    key[8..16].copy_from_slice(&account.to_be_bytes());
    key
}

pub fn account_tx_key(account: u64, tx_id: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[0..8].copy_from_slice(&account.to_be_bytes());
    key[8..16].copy_from_slice(&tx_id.to_be_bytes());
    key
}

pub fn tx_account_key(tx_id: u64, account: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[0..8].copy_from_slice(&tx_id.to_be_bytes());
    key[8..16].copy_from_slice(&account.to_be_bytes());
    key
}

pub fn height_entry_key(branch: u8, height: u32, tx_id: u64) -> [u8; 13] {
    let mut key = [0u8; 13];
    key[0] = branch;
    key[1..5].copy_from_slice(&height.to_be_bytes());
    key[5..13].copy_from_slice(&tx_id.to_be_bytes());
    key
}

pub fn balance_key(branch: u8, account: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = branch;
    key[1..9].copy_from_slice(&account.to_be_bytes());
    key
}

pub fn time_entry_key(branch: u8, account: u64, timestamp: u64, tx_id: u64) -> [u8; 25] {
    let mut key = [0u8; 25];
    key[0] = branch;
    key[1..9].copy_from_slice(&account.to_be_bytes());
    key[9..17].copy_from_slice(&timestamp.to_be_bytes());
    key[17..25].copy_from_slice(&tx_id.to_be_bytes());
    key
}

pub fn unspent_key(branch: u8, account: u64, output_id: u64) -> [u8; 17] {
    let mut key = [0u8; 17];
    key[0] = branch;
    key[1..9].copy_from_slice(&account.to_be_bytes());
    key[9..17].copy_from_slice(&output_id.to_be_bytes());
    key
}

pub fn watched_key(addr_hash: &[u8; 20], account: u64) -> [u8; 28] {
    let mut key = [0u8; 28];
    key[0..20].copy_from_slice(addr_hash);
    key[20..28].copy_from_slice(&account.to_be_bytes());
    key
}

/// Persistent id counters, stored under `COUNTERS`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub next_output_id: u64,
    pub next_tx_id: u64,
    pub next_account_id: u64,
}

impl Counters {
    pub fn encode(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[0..8].copy_from_slice(&self.next_output_id.to_le_bytes());
        out[8..16].copy_from_slice(&self.next_tx_id.to_le_bytes());
        out[16..24].copy_from_slice(&self.next_account_id.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 24 {
            return None;
        }
        Some(Self {
            next_output_id: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            next_tx_id: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            next_account_id: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
        })
    }
}

/// Value stored under `TX_DETAILS`. `branch_instances` counts the branches
/// that currently own the transaction; it lives at a fixed offset so it can
/// be bumped with a sub-section write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxDetailsRecord {
    pub timestamp: u64,
    pub branch_instances: u8,
    pub hash: [u8; 32],
}

/// Byte offset of `branch_instances` within a `TX_DETAILS` value.
pub const TX_DETAILS_INSTANCES_OFFSET: u32 = 8;

impl TxDetailsRecord {
    pub fn encode(&self) -> [u8; 41] {
        let mut out = [0u8; 41];
        out[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        out[8] = self.branch_instances;
        out[9..41].copy_from_slice(&self.hash);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 41 {
            return None;
        }
        Some(Self {
            timestamp: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            branch_instances: bytes[8],
            hash: bytes[9..41].try_into().unwrap(),
        })
    }
}

/// Value stored under `OUTPUT_DETAILS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputDetailsRecord {
    pub value: u64,
    pub tx_hash: [u8; 32],
    pub out_index: u32,
}

impl OutputDetailsRecord {
    pub fn encode(&self) -> [u8; 44] {
        let mut out = [0u8; 44];
        out[0..8].copy_from_slice(&self.value.to_le_bytes());
        out[8..40].copy_from_slice(&self.tx_hash);
        out[40..44].copy_from_slice(&self.out_index.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 44 {
            return None;
        }
        Some(Self {
            value: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            tx_hash: bytes[8..40].try_into().unwrap(),
            out_index: u32::from_be_bytes(bytes[40..44].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_entries_sort_by_timestamp_within_an_account() {
        let earlier = time_entry_key(0, 5, 1_000, 99);
        let later = time_entry_key(0, 5, 2_000, 1);
        let other_account = time_entry_key(0, 6, 0, 0);

        assert!(earlier < later);
        assert!(later < other_account);
    }

    #[test]
    fn unspent_keys_cluster_by_branch_then_account() {
        let a = unspent_key(0, 1, u64::MAX);
        let b = unspent_key(0, 2, 0);
        let c = unspent_key(1, 0, 0);

        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn height_entries_sort_by_height_within_a_branch() {
        let low = height_entry_key(0, 100, 50);
        let high = height_entry_key(0, 7_000, 1);
        let other_branch = height_entry_key(1, 0, 0);

        assert!(low < high);
        assert!(high < other_branch);
    }

    #[test]
    fn counters_record_round_trips() {
        let counters = Counters {
            next_output_id: 7,
            next_tx_id: 300,
            next_account_id: 2,
        };

        assert_eq!(Counters::decode(&counters.encode()), Some(counters));
        assert_eq!(Counters::decode(&[0u8; 3]), None);
    }

    #[test]
    fn tx_details_instances_sit_at_their_declared_offset() {
        let record = TxDetailsRecord {
            timestamp: 42,
            branch_instances: 3,
            hash: [9u8; 32],
        };

        let bytes = record.encode();

        assert_eq!(bytes[TX_DETAILS_INSTANCES_OFFSET as usize], 3);
        assert_eq!(TxDetailsRecord::decode(&bytes), Some(record));
    }

    #[test]
    fn output_details_round_trip() {
        let record = OutputDetailsRecord {
            value: 50_000,
            tx_hash: [1u8; 32],
            out_index: 4,
        };

        assert_eq!(OutputDetailsRecord::decode(&record.encode()), Some(record));
    }
}
