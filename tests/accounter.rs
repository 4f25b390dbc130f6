//! # Accounter Integration Tests
//!
//! Drives the accounting schema end-to-end through the engine: balances per
//! branch, unspent-output tracking, time-ordered history, and reopening the
//! store mid-history.

use tempfile::tempdir;
use tallydb::accounter::Accounter;
use tallydb::{Credit, Outpoint, TransactionEvent};

fn hash(tag: u8) -> [u8; 32] {
    [tag; 32]
}

fn credit_event(tag: u8, timestamp: u64, branch: u8, account: u64, value: u64) -> TransactionEvent {
    TransactionEvent {
        hash: hash(tag),
        timestamp,
        branch,
        block_height: timestamp as u32,
        credits: vec![Credit {
            account,
            output_index: 0,
            value,
        }],
        debits: vec![],
    }
}

#[test]
fn credits_accumulate_into_the_branch_balance() {
    let dir = tempdir().unwrap();
    let accounter = Accounter::open(dir.path()).unwrap();
    let account = accounter.new_account().unwrap();

    accounter
        .record_transaction(&credit_event(1, 100, 0, account, 5_000))
        .unwrap();
    accounter
        .record_transaction(&credit_event(2, 200, 0, account, 1_250))
        .unwrap();

    assert_eq!(accounter.balance(0, account).unwrap(), 6_250);
    assert_eq!(accounter.balance(1, account).unwrap(), 0);
    assert_eq!(accounter.unspent_outputs(0, account).unwrap().len(), 2);
}

#[test]
fn spending_an_output_debits_its_owner() {
    let dir = tempdir().unwrap();
    let accounter = Accounter::open(dir.path()).unwrap();
    let account = accounter.new_account().unwrap();
    accounter
        .record_transaction(&credit_event(1, 100, 0, account, 9_000))
        .unwrap();

    let spend = TransactionEvent {
        hash: hash(2),
        timestamp: 150,
        branch: 0,
        block_height: 150,
        credits: vec![],
        debits: vec![Outpoint {
            tx_hash: hash(1),
            index: 0,
        }],
    };
    accounter.record_transaction(&spend).unwrap();

    assert_eq!(accounter.balance(0, account).unwrap(), 0);
    assert!(accounter.unspent_outputs(0, account).unwrap().is_empty());
    assert_eq!(
        accounter
            .is_output_spent(
                0,
                &Outpoint {
                    tx_hash: hash(1),
                    index: 0
                }
            )
            .unwrap(),
        Some(true)
    );
}

#[test]
fn change_with_spend_nets_the_difference() {
    let dir = tempdir().unwrap();
    let accounter = Accounter::open(dir.path()).unwrap();
    let account = accounter.new_account().unwrap();
    accounter
        .record_transaction(&credit_event(1, 100, 0, account, 10_000))
        .unwrap();

    // Spend the 10k output, receive 7k change back.
    let spend = TransactionEvent {
        hash: hash(2),
        timestamp: 160,
        branch: 0,
        block_height: 160,
        credits: vec![Credit {
            account,
            output_index: 1,
            value: 7_000,
        }],
        debits: vec![Outpoint {
            tx_hash: hash(1),
            index: 0,
        }],
    };
    accounter.record_transaction(&spend).unwrap();

    assert_eq!(accounter.balance(0, account).unwrap(), 7_000);
    assert_eq!(accounter.unspent_outputs(0, account).unwrap().len(), 1);
}

#[test]
fn history_is_time_ordered_per_branch() {
    let dir = tempdir().unwrap();
    let accounter = Accounter::open(dir.path()).unwrap();
    let account = accounter.new_account().unwrap();

    // Recorded out of time order; the index sorts them.
    let tx_late = accounter
        .record_transaction(&credit_event(2, 900, 0, account, 10))
        .unwrap();
    let tx_early = accounter
        .record_transaction(&credit_event(1, 100, 0, account, 20))
        .unwrap();

    let history = accounter.account_history(0, account).unwrap();
    assert_eq!(history, vec![(100, tx_early), (900, tx_late)]);
}

#[test]
fn branches_keep_separate_balances_for_one_transaction() {
    let dir = tempdir().unwrap();
    let accounter = Accounter::open(dir.path()).unwrap();
    let account = accounter.new_account().unwrap();

    // The same transaction hash lands on two branches; the id is shared,
    // the balances are per branch.
    let main = credit_event(1, 100, 0, account, 4_000);
    let mut fork = credit_event(1, 100, 1, account, 4_000);
    fork.credits[0].output_index = 0;

    let id_main = accounter.record_transaction(&main).unwrap();
    let id_fork = accounter.record_transaction(&fork).unwrap();

    assert_eq!(id_main, id_fork);
    assert_eq!(accounter.balance(0, account).unwrap(), 4_000);
    assert_eq!(accounter.balance(1, account).unwrap(), 4_000);
    // One output registered globally, unspent on both branches.
    assert_eq!(accounter.unspent_outputs(0, account).unwrap(), vec![0]);
    assert_eq!(accounter.unspent_outputs(1, account).unwrap(), vec![0]);
}

#[test]
fn reorg_unwinds_a_spend_via_set_output_spent() {
    let dir = tempdir().unwrap();
    let accounter = Accounter::open(dir.path()).unwrap();
    let account = accounter.new_account().unwrap();
    accounter
        .record_transaction(&credit_event(1, 100, 0, account, 2_500))
        .unwrap();
    let outpoint = Outpoint {
        tx_hash: hash(1),
        index: 0,
    };
    accounter
        .record_transaction(&TransactionEvent {
            hash: hash(2),
            timestamp: 150,
            branch: 0,
            block_height: 150,
            credits: vec![],
            debits: vec![outpoint],
        })
        .unwrap();
    assert_eq!(accounter.balance(0, account).unwrap(), 0);

    accounter.set_output_spent(0, &outpoint, false).unwrap();

    assert_eq!(accounter.balance(0, account).unwrap(), 2_500);
    assert_eq!(accounter.unspent_outputs(0, account).unwrap().len(), 1);
    // Flipping to the same state is a no-op.
    accounter.set_output_spent(0, &outpoint, false).unwrap();
    assert_eq!(accounter.balance(0, account).unwrap(), 2_500);
}

#[test]
fn branch_transactions_scan_by_height_from_a_fork_point() {
    let dir = tempdir().unwrap();
    let accounter = Accounter::open(dir.path()).unwrap();
    let account = accounter.new_account().unwrap();

    // block_height tracks the timestamp in the helper.
    let tx_a = accounter
        .record_transaction(&credit_event(1, 100, 0, account, 10))
        .unwrap();
    let tx_b = accounter
        .record_transaction(&credit_event(2, 250, 0, account, 10))
        .unwrap();
    let tx_c = accounter
        .record_transaction(&credit_event(3, 400, 0, account, 10))
        .unwrap();
    accounter
        .record_transaction(&credit_event(4, 300, 1, account, 10))
        .unwrap();

    assert_eq!(
        accounter.branch_transactions_from(0, 0).unwrap(),
        vec![(100, tx_a), (250, tx_b), (400, tx_c)]
    );
    // Unwinding past a fork at height 200 touches only the later entries.
    assert_eq!(
        accounter.branch_transactions_from(0, 200).unwrap(),
        vec![(250, tx_b), (400, tx_c)]
    );
    assert!(accounter.branch_transactions_from(2, 0).unwrap().is_empty());
}

#[test]
fn transaction_accounts_lists_every_touched_account() {
    let dir = tempdir().unwrap();
    let accounter = Accounter::open(dir.path()).unwrap();
    let alice = accounter.new_account().unwrap();
    let bob = accounter.new_account().unwrap();

    let event = TransactionEvent {
        hash: hash(1),
        timestamp: 100,
        branch: 0,
        block_height: 100,
        credits: vec![
            Credit {
                account: alice,
                output_index: 0,
                value: 600,
            },
            Credit {
                account: bob,
                output_index: 1,
                value: 400,
            },
        ],
        debits: vec![],
    };
    let tx_id = accounter.record_transaction(&event).unwrap();

    assert_eq!(
        accounter.transaction_accounts(tx_id).unwrap(),
        vec![alice, bob]
    );
    assert!(accounter.transaction_accounts(tx_id + 1).unwrap().is_empty());
}

#[test]
fn watched_addresses_map_back_to_accounts() {
    let dir = tempdir().unwrap();
    let accounter = Accounter::open(dir.path()).unwrap();
    let alice = accounter.new_account().unwrap();
    let bob = accounter.new_account().unwrap();

    accounter.watch_address(alice, &[0xAA; 20]).unwrap();
    accounter.watch_address(bob, &[0xAA; 20]).unwrap();
    accounter.watch_address(bob, &[0xBB; 20]).unwrap();

    assert_eq!(accounter.accounts_watching(&[0xAA; 20]).unwrap(), vec![alice, bob]);
    assert_eq!(accounter.accounts_watching(&[0xBB; 20]).unwrap(), vec![bob]);
    assert!(accounter.accounts_watching(&[0xCC; 20]).unwrap().is_empty());
}

#[test]
fn accounter_state_survives_reopen() {
    let dir = tempdir().unwrap();
    let account;
    {
        let accounter = Accounter::open(dir.path()).unwrap();
        account = accounter.new_account().unwrap();
        accounter
            .record_transaction(&credit_event(1, 100, 0, account, 777))
            .unwrap();
    }

    let accounter = Accounter::open(dir.path()).unwrap();

    assert_eq!(accounter.balance(0, account).unwrap(), 777);
    assert_eq!(accounter.unspent_outputs(0, account).unwrap().len(), 1);
    // Counters resume past the persisted ids.
    let next = accounter.new_account().unwrap();
    assert!(next > account);
}
