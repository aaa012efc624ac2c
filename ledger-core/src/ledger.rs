//! Per-account grouping and backward balance reconstruction.
//!
//! Entries carry the balance *after* themselves. The last entry of each
//! account bucket is seeded with the externally supplied anchor (the true
//! on-chain balance immediately after the block); every earlier balance is
//! derived by undoing the following entry: a `Send` of `x` means the balance
//! before it was `x` higher, a `Receive` means it was `x` lower.

use std::collections::BTreeMap;

use alloy_primitives::{Address, U256};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{BlockLedger, Direction, LedgerEntry, TransferEvent};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("no anchor balance supplied for {0}")]
    MissingAnchor(Address),
    #[error("balance arithmetic out of range for {account} at entry {index}")]
    Arithmetic { account: Address, index: usize },
}

/// Expands native transfer events into per-account ledger entries, bucketed
/// by owning account. Both endpoints present yields a `Send` for the source
/// and a `Receive` for the destination; contract creations yield only the
/// `Send`. Produced order is preserved within each bucket, which is already
/// (tx index, internal index) ascending because extraction emits in block
/// order.
///
/// Token transfer events are not expanded here: their amounts are in foreign
/// units and must not enter native balance arithmetic.
pub fn expand_block(events: &[TransferEvent], block_time: DateTime<Utc>) -> BlockLedger {
    let mut ledger = BlockLedger::new();

    for ev in events.iter().filter(|ev| ev.is_native()) {
        ledger.entry(ev.from).or_default().push(LedgerEntry {
            account: ev.from,
            block_number: ev.block_number,
            tx_index: ev.tx_index,
            internal_index: ev.log_index,
            direction: Direction::Send,
            counterparty: ev.to,
            amount: ev.amount,
            tx_hash: ev.tx_hash,
            balance: U256::ZERO,
            block_time,
        });

        if let Some(to) = ev.to {
            ledger.entry(to).or_default().push(LedgerEntry {
                account: to,
                block_number: ev.block_number,
                tx_index: ev.tx_index,
                internal_index: ev.log_index,
                direction: Direction::Receive,
                counterparty: Some(ev.from),
                amount: ev.amount,
                tx_hash: ev.tx_hash,
                balance: U256::ZERO,
                block_time,
            });
        }
    }

    ledger
}

/// Seeds each bucket's last entry with its anchor balance and walks backward
/// filling the rest. Reconstruction is fatal per bucket: a missing anchor or
/// out-of-range arithmetic removes that account's bucket and reports it;
/// other buckets are unaffected.
pub fn fill_balances(
    ledger: &mut BlockLedger,
    anchors: &BTreeMap<Address, U256>,
) -> Vec<(Address, BuildError)> {
    let mut failed = Vec::new();

    for (account, entries) in ledger.iter_mut() {
        if let Err(err) = fill_account(*account, entries, anchors) {
            failed.push((*account, err));
        }
    }
    for (account, _) in &failed {
        ledger.remove(account);
    }

    failed
}

fn fill_account(
    account: Address,
    entries: &mut [LedgerEntry],
    anchors: &BTreeMap<Address, U256>,
) -> Result<(), BuildError> {
    let anchor = *anchors
        .get(&account)
        .ok_or(BuildError::MissingAnchor(account))?;

    // Buckets are created on first push and never left empty.
    let last = entries.len() - 1;
    entries[last].balance = anchor;

    for i in (0..last).rev() {
        let next = &entries[i + 1];
        let balance = match next.direction {
            Direction::Send => next.balance.checked_add(next.amount),
            Direction::Receive => next.balance.checked_sub(next.amount),
        }
        .ok_or(BuildError::Arithmetic { account, index: i })?;
        entries[i].balance = balance;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, b256};

    const A: Address = address!("00000000000000000000000000000000000000aa");
    const B: Address = address!("00000000000000000000000000000000000000bb");
    const C: Address = address!("00000000000000000000000000000000000000cc");

    fn time() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn native(tx_index: u32, from: Address, to: Option<Address>, amount: u64) -> TransferEvent {
        TransferEvent {
            block_number: 100,
            tx_index,
            log_index: 0,
            from,
            to,
            amount: U256::from(amount),
            tx_hash: b256!(
                "1111111111111111111111111111111111111111111111111111111111111111"
            ),
            token_contract: None,
        }
    }

    fn anchors(pairs: &[(Address, u64)]) -> BTreeMap<Address, U256> {
        pairs
            .iter()
            .map(|(addr, bal)| (*addr, U256::from(*bal)))
            .collect()
    }

    #[test]
    fn transfer_expands_to_send_and_receive() {
        let ledger = expand_block(&[native(0, A, Some(B), 50)], time());

        assert_eq!(ledger.len(), 2);
        let send = &ledger[&A][0];
        let recv = &ledger[&B][0];
        assert_eq!(send.direction, Direction::Send);
        assert_eq!(send.counterparty, Some(B));
        assert_eq!(recv.direction, Direction::Receive);
        assert_eq!(recv.counterparty, Some(A));
        assert_eq!(send.amount, recv.amount);
        assert_eq!(send.tx_hash, recv.tx_hash);
    }

    #[test]
    fn contract_creation_expands_to_single_send() {
        let ledger = expand_block(&[native(0, A, None, 10)], time());

        assert_eq!(ledger.len(), 1);
        let entries = &ledger[&A];
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].direction, Direction::Send);
        assert_eq!(entries[0].counterparty, None);
    }

    #[test]
    fn token_events_do_not_enter_the_ledger() {
        let mut ev = native(0, A, Some(B), 50);
        ev.token_contract = Some(C);
        assert!(expand_block(&[ev], time()).is_empty());
    }

    #[test]
    fn anchor_seeds_last_entry_and_preceding_is_derived() {
        // Block 100: A sends 50 to B, A's balance after the block is 950, so
        // A's preceding entry balance is 950 + 50 = 1000.
        let events = [native(0, A, Some(B), 30), native(1, A, Some(B), 50)];
        let mut ledger = expand_block(&events, time());
        let failed = fill_balances(&mut ledger, &anchors(&[(A, 950), (B, 500)]));

        assert!(failed.is_empty());
        let a = &ledger[&A];
        assert_eq!(a[1].balance, U256::from(950u64));
        assert_eq!(a[0].balance, U256::from(1000u64));

        // B received 50 last, so before that it held 500 - 50 = 450.
        let b = &ledger[&B];
        assert_eq!(b[1].balance, U256::from(500u64));
        assert_eq!(b[0].balance, U256::from(450u64));
    }

    #[test]
    fn backward_fill_invariant_holds_for_every_consecutive_pair() {
        let events = [
            native(0, A, Some(B), 10),
            native(1, B, Some(A), 25),
            native(2, A, Some(C), 5),
            native(3, C, Some(A), 40),
        ];
        let mut ledger = expand_block(&events, time());
        let failed = fill_balances(&mut ledger, &anchors(&[(A, 1000), (B, 200), (C, 300)]));
        assert!(failed.is_empty());

        for entries in ledger.values() {
            for pair in entries.windows(2) {
                let expected = match pair[1].direction {
                    Direction::Send => pair[1].balance + pair[1].amount,
                    Direction::Receive => pair[1].balance - pair[1].amount,
                };
                assert_eq!(pair[0].balance, expected);
            }
        }
    }

    #[test]
    fn reconstruction_is_idempotent() {
        let events = [native(0, A, Some(B), 10), native(1, B, Some(A), 3)];
        let anchors = anchors(&[(A, 100), (B, 200)]);

        let mut first = expand_block(&events, time());
        fill_balances(&mut first, &anchors);
        let mut second = expand_block(&events, time());
        fill_balances(&mut second, &anchors);

        assert_eq!(first, second);
    }

    #[test]
    fn underflow_drops_only_the_affected_bucket() {
        // B's anchor is smaller than its last received amount: walking back
        // underflows. A's bucket must still be filled.
        let events = [native(0, A, Some(B), 10), native(1, A, Some(B), 50)];
        let mut ledger = expand_block(&events, time());
        let failed = fill_balances(&mut ledger, &anchors(&[(A, 100), (B, 20)]));

        assert_eq!(failed.len(), 1);
        assert!(matches!(
            failed[0],
            (account, BuildError::Arithmetic { .. }) if account == B
        ));
        assert!(!ledger.contains_key(&B));
        assert_eq!(ledger[&A][0].balance, U256::from(150u64));
    }

    #[test]
    fn missing_anchor_is_fatal_per_bucket() {
        let mut ledger = expand_block(&[native(0, A, Some(B), 10)], time());
        let failed = fill_balances(&mut ledger, &anchors(&[(A, 100)]));

        assert_eq!(failed, vec![(B, BuildError::MissingAnchor(B))]);
        assert!(ledger.contains_key(&A));
        assert!(!ledger.contains_key(&B));
    }

    #[test]
    fn internal_index_comes_from_the_log_index() {
        let mut ev = native(2, A, Some(B), 7);
        ev.log_index = 5;
        let ledger = expand_block(&[ev], time());
        assert_eq!(ledger[&A][0].internal_index, 5);
        assert_eq!(ledger[&A][0].tx_index, 2);
    }
}
