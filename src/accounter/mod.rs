//! # Accounter
//!
//! Projects transaction events into per-account balances, unspent-output
//! tracking, and branch-aware history. This layer is a pure consumer of the
//! storage engine: every mutation is a set of index writes delivered in one
//! engine transaction, so an event is either fully visible or not at all.
//!
//! ## Model
//!
//! Accounts watch address hashes. A [`TransactionEvent`] names the branch it
//! was observed on, the outputs that pay watched accounts (credits) and the
//! previously recorded outputs it spends (debits). Recording an event:
//!
//! - assigns (or reuses) a transaction id for the hash, bumps the count of
//!   branches owning it, and files the id under its block height on the
//!   branch so a fork point can be unwound by height scan,
//! - registers each credited output with its details, its spent flag on the
//!   branch, its owning accounts, and the per-account unspent entry,
//! - marks each debited output spent on the branch and removes the unspent
//!   entries of its owners,
//! - folds the credits and debits into one signed delta per account, stored
//!   in the account's transaction details and applied to its branch balance,
//!   with a time-ordered history entry and a transaction-to-account
//!   membership entry per account.
//!
//! Branches are opaque single-byte lineages; recording the same transaction
//! hash on another branch reuses its id and details.
//!
//! ## Consistency
//!
//! Reads used while building an event (output lookups, owner scans) see
//! committed state; debits must therefore reference outputs committed by an
//! earlier event, which matches how a node feeds confirmed transactions in
//! order. Balances never go negative; a debit that would overdraw an
//! account is an invariant violation and poisons nothing, since the
//! transaction is simply dropped.

mod keys;

pub use keys::{
    Counters, OutputDetailsRecord, TxDetailsRecord, ACCOUNT_TIME_TX, ACCOUNT_TX_DETAILS,
    ACCOUNT_UNSPENT_OUTPUTS, BRANCH_ACCOUNT_BALANCE, BRANCH_OUTPUT_SPENT, BRANCH_TX_DETAILS,
    COUNTERS, OUTPOINT_TO_ID, OUTPUT_ACCOUNTS, OUTPUT_DETAILS, TX_ACCOUNTS, TX_DETAILS,
    TX_HASH_TO_ID, TX_HEIGHT_BRANCH_AND_ID, WATCHED_HASHES,
};

use std::collections::BTreeMap;
use std::path::Path;

use eyre::{bail, Result, WrapErr};
use parking_lot::Mutex;

use crate::database::{Database, Transaction};
use crate::error::StorageError;

use keys::*;

pub type AccountId = u64;
pub type TxId = u64;
pub type OutputId = u64;

/// An output paying a watched account.
#[derive(Debug, Clone, Copy)]
pub struct Credit {
    pub account: AccountId,
    pub output_index: u32,
    pub value: u64,
}

/// Reference to a previously recorded output being spent.
#[derive(Debug, Clone, Copy)]
pub struct Outpoint {
    pub tx_hash: [u8; 32],
    pub index: u32,
}

/// One observed transaction, as fed by the node.
#[derive(Debug, Clone)]
pub struct TransactionEvent {
    pub hash: [u8; 32],
    pub timestamp: u64,
    pub branch: u8,
    pub block_height: u32,
    pub credits: Vec<Credit>,
    pub debits: Vec<Outpoint>,
}

/// Accounting store over one engine database.
pub struct Accounter {
    db: Database,
    counters: Mutex<Counters>,
}

impl Accounter {
    /// Opens (or creates) the accounting database under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db = Database::builder()
            .data_dir(data_dir)
            .folder("accounter")
            .open()
            .wrap_err("failed to open accounter database")?;

        for (index, key_size) in SCHEMA {
            db.load_index(*index, *key_size)?;
        }

        let counters = db
            .read_value(None, COUNTERS, &counters_key())?
            .and_then(|bytes| Counters::decode(&bytes))
            .unwrap_or_default();

        Ok(Self {
            db,
            counters: Mutex::new(counters),
        })
    }

    /// The engine database underneath, for direct inspection.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Allocates a fresh account id.
    pub fn new_account(&self) -> Result<AccountId> {
        let mut counters = self.counters.lock();
        let account = counters.next_account_id;
        counters.next_account_id += 1;

        let mut tx = self.db.begin();
        self.db
            .write_value(&mut tx, COUNTERS, &counters_key(), &counters.encode())?;
        self.db.commit(tx)?;
        Ok(account)
    }

    /// Registers an address hash as belonging to an account.
    pub fn watch_address(&self, account: AccountId, addr_hash: &[u8; 20]) -> Result<()> {
        let mut tx = self.db.begin();
        self.db
            .write_value(&mut tx, WATCHED_HASHES, &watched_key(addr_hash, account), b"")?;
        self.db.commit(tx)
    }

    /// Accounts watching an address hash.
    pub fn accounts_watching(&self, addr_hash: &[u8; 20]) -> Result<Vec<AccountId>> {
        let keys = self.db.scan_keys(WATCHED_HASHES)?;
        Ok(keys
            .iter()
            .filter(|key| &key[0..20] == addr_hash)
            .map(|key| u64::from_be_bytes(key[20..28].try_into().unwrap()))
            .collect())
    }

    /// Records one transaction event atomically and returns its id.
    pub fn record_transaction(&self, event: &TransactionEvent) -> Result<TxId> {
        let mut counters = self.counters.lock();
        let mut tx = self.db.begin();

        // Transaction id: reuse for a hash already seen on another branch.
        let hash_key = tx_hash_key(&event.hash);
        let (tx_id, instances) = match self.db.read_value(Some(&tx), TX_HASH_TO_ID, &hash_key)? {
            Some(bytes) if bytes.len() == 8 => {
                let id = u64::from_le_bytes(bytes[..].try_into().unwrap());
                let details = self
                    .db
                    .read_value(Some(&tx), TX_DETAILS, &tx_details_key(id))?
                    .and_then(|b| TxDetailsRecord::decode(&b))
                    .ok_or_else(|| {
                        StorageError::Corrupted(format!("transaction {} has no details", id))
                    })?;
                (id, details.branch_instances)
            }
            _ => {
                let id = counters.next_tx_id;
                counters.next_tx_id += 1;
                self.db
                    .write_value(&mut tx, TX_HASH_TO_ID, &hash_key, &id.to_le_bytes())?;
                let details = TxDetailsRecord {
                    timestamp: event.timestamp,
                    branch_instances: 0,
                    hash: event.hash,
                };
                self.db
                    .write_value(&mut tx, TX_DETAILS, &tx_details_key(id), &details.encode())?;
                (id, 0)
            }
        };
        self.db.write_value_subsection(
            &mut tx,
            TX_DETAILS,
            &tx_details_key(tx_id),
            TX_DETAILS_INSTANCES_OFFSET,
            &[instances + 1],
        )?;
        self.db.write_value(
            &mut tx,
            BRANCH_TX_DETAILS,
            &branch_tx_key(event.branch, tx_id),
            &event.block_height.to_le_bytes(),
        )?;
        self.db.write_value(
            &mut tx,
            TX_HEIGHT_BRANCH_AND_ID,
            &height_entry_key(event.branch, event.block_height, tx_id),
            b"",
        )?;

        // Net balance change per account across all credits and debits.
        let mut deltas: BTreeMap<AccountId, i64> = BTreeMap::new();

        for credit in &event.credits {
            // An output is registered once globally; a second branch seeing
            // the same transaction reuses its id and adds branch entries.
            let registered = self
                .db
                .read_value(
                    Some(&tx),
                    OUTPOINT_TO_ID,
                    &outpoint_key(&event.hash, credit.output_index),
                )?
                .filter(|bytes| bytes.len() == 8)
                .map(|bytes| u64::from_le_bytes(bytes[..].try_into().unwrap()));
            let output_id = match registered {
                Some(id) => id,
                None => {
                    let id = counters.next_output_id;
                    counters.next_output_id += 1;
                    let details = OutputDetailsRecord {
                        value: credit.value,
                        tx_hash: event.hash,
                        out_index: credit.output_index,
                    };
                    self.db.write_value(
                        &mut tx,
                        OUTPUT_DETAILS,
                        &output_details_key(id),
                        &details.encode(),
                    )?;
                    self.db.write_value(
                        &mut tx,
                        OUTPOINT_TO_ID,
                        &outpoint_key(&event.hash, credit.output_index),
                        &id.to_le_bytes(),
                    )?;
                    id
                }
            };
            self.db.write_value(
                &mut tx,
                BRANCH_OUTPUT_SPENT,
                &branch_output_key(event.branch, output_id),
                &[0],
            )?;
            self.db.write_value(
                &mut tx,
                OUTPUT_ACCOUNTS,
                &output_account_key(output_id, credit.account),
                b"",
            )?;
            self.db.write_value(
                &mut tx,
                ACCOUNT_UNSPENT_OUTPUTS,
                &unspent_key(event.branch, credit.account, output_id),
                b"",
            )?;
            *deltas.entry(credit.account).or_default() += credit.value as i64;
        }

        for outpoint in &event.debits {
            let Some(output_id) = self.lookup_output(outpoint)? else {
                // Not an output we track; nothing of ours is being spent.
                continue;
            };
            let details = self
                .db
                .read_value(None, OUTPUT_DETAILS, &output_details_key(output_id))?
                .and_then(|b| OutputDetailsRecord::decode(&b))
                .ok_or_else(|| {
                    StorageError::Corrupted(format!("output {} has no details", output_id))
                })?;

            self.db.write_value(
                &mut tx,
                BRANCH_OUTPUT_SPENT,
                &branch_output_key(event.branch, output_id),
                &[1],
            )?;
            for account in self.output_owners(output_id)? {
                self.db.remove_value(
                    &mut tx,
                    ACCOUNT_UNSPENT_OUTPUTS,
                    &unspent_key(event.branch, account, output_id),
                )?;
                *deltas.entry(account).or_default() -= details.value as i64;
            }
        }

        for (account, delta) in &deltas {
            self.db.write_value(
                &mut tx,
                ACCOUNT_TX_DETAILS,
                &account_tx_key(*account, tx_id),
                &delta.to_le_bytes(),
            )?;
            self.db.write_value(
                &mut tx,
                TX_ACCOUNTS,
                &tx_account_key(tx_id, *account),
                b"",
            )?;
            self.db.write_value(
                &mut tx,
                ACCOUNT_TIME_TX,
                &time_entry_key(event.branch, *account, event.timestamp, tx_id),
                b"",
            )?;
            self.apply_balance_change(&mut tx, event.branch, *account, *delta)?;
        }

        self.db
            .write_value(&mut tx, COUNTERS, &counters_key(), &counters.encode())?;
        self.db.commit(tx)?;
        Ok(tx_id)
    }

    /// Current balance of an account on a branch.
    pub fn balance(&self, branch: u8, account: AccountId) -> Result<u64> {
        Ok(self
            .db
            .read_value(None, BRANCH_ACCOUNT_BALANCE, &balance_key(branch, account))?
            .filter(|bytes| bytes.len() == 8)
            .map(|bytes| u64::from_le_bytes(bytes[..].try_into().unwrap()))
            .unwrap_or(0))
    }

    /// Unspent output ids of an account on a branch, ascending.
    pub fn unspent_outputs(&self, branch: u8, account: AccountId) -> Result<Vec<OutputId>> {
        let prefix = {
            let mut p = [0u8; 9];
            p[0] = branch;
            p[1..9].copy_from_slice(&account.to_be_bytes());
            p
        };
        let keys = self.db.scan_keys(ACCOUNT_UNSPENT_OUTPUTS)?;
        Ok(keys
            .iter()
            .filter(|key| key[0..9] == prefix)
            .map(|key| u64::from_be_bytes(key[9..17].try_into().unwrap()))
            .collect())
    }

    /// Transaction history of an account on a branch, time-ascending.
    pub fn account_history(&self, branch: u8, account: AccountId) -> Result<Vec<(u64, TxId)>> {
        let prefix = {
            let mut p = [0u8; 9];
            p[0] = branch;
            p[1..9].copy_from_slice(&account.to_be_bytes());
            p
        };
        let keys = self.db.scan_keys(ACCOUNT_TIME_TX)?;
        Ok(keys
            .iter()
            .filter(|key| key[0..9] == prefix)
            .map(|key| {
                (
                    u64::from_be_bytes(key[9..17].try_into().unwrap()),
                    u64::from_be_bytes(key[17..25].try_into().unwrap()),
                )
            })
            .collect())
    }

    /// Transactions recorded on a branch at or above `height`, ascending by
    /// height then id. This is the scan a reorg walks to unwind a branch
    /// past a fork point.
    pub fn branch_transactions_from(&self, branch: u8, height: u32) -> Result<Vec<(u32, TxId)>> {
        let floor = height_entry_key(branch, height, 0);
        let keys = self.db.scan_keys(TX_HEIGHT_BRANCH_AND_ID)?;
        Ok(keys
            .iter()
            .filter(|key| key[0] == branch && key[..] >= floor[..])
            .map(|key| {
                (
                    u32::from_be_bytes(key[1..5].try_into().unwrap()),
                    u64::from_be_bytes(key[5..13].try_into().unwrap()),
                )
            })
            .collect())
    }

    /// Accounts whose balances a transaction touched, ascending.
    pub fn transaction_accounts(&self, tx_id: TxId) -> Result<Vec<AccountId>> {
        let prefix = tx_id.to_be_bytes();
        let keys = self.db.scan_keys(TX_ACCOUNTS)?;
        Ok(keys
            .iter()
            .filter(|key| key[0..8] == prefix)
            .map(|key| u64::from_be_bytes(key[8..16].try_into().unwrap()))
            .collect())
    }

    /// Spent flag of an output on a branch, `None` when unknown there.
    pub fn is_output_spent(&self, branch: u8, outpoint: &Outpoint) -> Result<Option<bool>> {
        let Some(output_id) = self.lookup_output(outpoint)? else {
            return Ok(None);
        };
        Ok(self
            .db
            .read_value(None, BRANCH_OUTPUT_SPENT, &branch_output_key(branch, output_id))?
            .map(|bytes| bytes.first() == Some(&1)))
    }

    /// Flips an output's spent status on a branch, adjusting the owning
    /// accounts' balances and unspent entries. Used when a branch reorg
    /// unwinds or replays a spend.
    pub fn set_output_spent(&self, branch: u8, outpoint: &Outpoint, spent: bool) -> Result<()> {
        let Some(output_id) = self.lookup_output(outpoint)? else {
            bail!(StorageError::NotFound);
        };
        let current = self
            .db
            .read_value(None, BRANCH_OUTPUT_SPENT, &branch_output_key(branch, output_id))?
            .map(|bytes| bytes.first() == Some(&1));
        if current == Some(spent) {
            return Ok(());
        }

        let details = self
            .db
            .read_value(None, OUTPUT_DETAILS, &output_details_key(output_id))?
            .and_then(|b| OutputDetailsRecord::decode(&b))
            .ok_or_else(|| {
                StorageError::Corrupted(format!("output {} has no details", output_id))
            })?;

        let mut tx = self.db.begin();
        self.db.write_value(
            &mut tx,
            BRANCH_OUTPUT_SPENT,
            &branch_output_key(branch, output_id),
            &[spent as u8],
        )?;
        for account in self.output_owners(output_id)? {
            let unspent = unspent_key(branch, account, output_id);
            let delta = if spent {
                self.db
                    .remove_value(&mut tx, ACCOUNT_UNSPENT_OUTPUTS, &unspent)?;
                -(details.value as i64)
            } else {
                self.db
                    .write_value(&mut tx, ACCOUNT_UNSPENT_OUTPUTS, &unspent, b"")?;
                details.value as i64
            };
            self.apply_balance_change(&mut tx, branch, account, delta)?;
        }
        self.db.commit(tx)
    }

    fn lookup_output(&self, outpoint: &Outpoint) -> Result<Option<OutputId>> {
        Ok(self
            .db
            .read_value(None, OUTPOINT_TO_ID, &outpoint_key(&outpoint.tx_hash, outpoint.index))?
            .filter(|bytes| bytes.len() == 8)
            .map(|bytes| u64::from_le_bytes(bytes[..].try_into().unwrap())))
    }

    fn output_owners(&self, output_id: OutputId) -> Result<Vec<AccountId>> {
        let prefix = output_id.to_be_bytes();
        let keys = self.db.scan_keys(OUTPUT_ACCOUNTS)?;
        Ok(keys
            .iter()
            .filter(|key| key[0..8] == prefix)
            .map(|key| u64::from_be_bytes(key[8..16].try_into().unwrap()))
            .collect())
    }

    fn apply_balance_change(
        &self,
        tx: &mut Transaction,
        branch: u8,
        account: AccountId,
        delta: i64,
    ) -> Result<()> {
        let key = balance_key(branch, account);
        let current = self
            .db
            .read_value(Some(tx), BRANCH_ACCOUNT_BALANCE, &key)?
            .filter(|bytes| bytes.len() == 8)
            .map(|bytes| u64::from_le_bytes(bytes[..].try_into().unwrap()))
            .unwrap_or(0);

        let updated = current as i64 + delta;
        if updated < 0 {
            bail!(StorageError::InvariantViolation(format!(
                "balance of account {} on branch {} would drop below zero",
                account, branch
            )));
        }
        self.db
            .write_value(tx, BRANCH_ACCOUNT_BALANCE, &key, &(updated as u64).to_le_bytes())
    }
}
