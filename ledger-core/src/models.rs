use std::collections::BTreeMap;
use std::str::FromStr;

use alloy_primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One qualifying transfer pulled out of a block, before grouping. A native
/// value transfer (no token contract) or a decoded token `Transfer` log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub block_number: u64,
    pub tx_index: u32,
    /// Position within the block's log list; 0 for top-level value transfers.
    pub log_index: u32,
    pub from: Address,
    /// None marks a contract-creation transaction.
    pub to: Option<Address>,
    pub amount: U256,
    pub tx_hash: B256,
    /// None marks a native-coin transfer.
    pub token_contract: Option<Address>,
}

impl TransferEvent {
    pub fn is_native(&self) -> bool {
        self.token_contract.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Receive,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Send => "send",
            Direction::Receive => "receive",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown transfer direction {0:?}")]
pub struct UnknownDirection(pub String);

impl FromStr for Direction {
    type Err = UnknownDirection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send" => Ok(Direction::Send),
            "receive" => Ok(Direction::Receive),
            other => Err(UnknownDirection(other.to_string())),
        }
    }
}

/// One side of a transfer, owned by one account. `balance` stays zero until
/// backward reconstruction fills it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub account: Address,
    pub block_number: u64,
    pub tx_index: u32,
    /// Disambiguates multiple entries for the same account within one
    /// transaction; 0 for top-level value transfers.
    pub internal_index: u32,
    pub direction: Direction,
    pub counterparty: Option<Address>,
    pub amount: U256,
    pub tx_hash: B256,
    pub balance: U256,
    pub block_time: DateTime<Utc>,
}

/// Per-account entry slices for one block, each ordered by
/// (block number, tx index, internal index) ascending.
pub type BlockLedger = BTreeMap<Address, Vec<LedgerEntry>>;

/// Persisted form of a ledger entry. Amounts are decimal strings so arbitrary
/// precision survives the round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerRow {
    pub account_addr: String,
    pub block_num: i64,
    pub tx_idx: i32,
    pub itx_idx: i32,
    pub direction: String, // "send" | "receive"
    pub counterparty_addr: Option<String>,
    pub amount: String,
    pub balance: String,
    pub tx_hash: String,
    pub block_time: DateTime<Utc>,
}

impl From<&LedgerEntry> for LedgerRow {
    fn from(entry: &LedgerEntry) -> Self {
        LedgerRow {
            account_addr: format!("{:#x}", entry.account),
            block_num: entry.block_number as i64,
            tx_idx: entry.tx_index as i32,
            itx_idx: entry.internal_index as i32,
            direction: entry.direction.as_str().to_string(),
            counterparty_addr: entry.counterparty.map(|a| format!("{a:#x}")),
            amount: entry.amount.to_string(),
            balance: entry.balance.to_string(),
            tx_hash: format!("{:#x}", entry.tx_hash),
            block_time: entry.block_time,
        }
    }
}

#[derive(Debug, Error)]
pub enum RowDecodeError {
    #[error(transparent)]
    Direction(#[from] UnknownDirection),
    #[error("bad address column {0:?}")]
    Address(String),
    #[error("bad integer column {0:?}")]
    Integer(String),
    #[error("bad hash column {0:?}")]
    Hash(String),
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = RowDecodeError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        let parse_addr = |s: &str| {
            Address::from_str(s).map_err(|_| RowDecodeError::Address(s.to_string()))
        };
        let parse_u256 = |s: &str| {
            U256::from_str(s).map_err(|_| RowDecodeError::Integer(s.to_string()))
        };
        let counterparty = match row.counterparty_addr.as_deref() {
            Some(s) => Some(parse_addr(s)?),
            None => None,
        };
        Ok(LedgerEntry {
            account: parse_addr(&row.account_addr)?,
            block_number: row.block_num as u64,
            tx_index: row.tx_idx as u32,
            internal_index: row.itx_idx as u32,
            direction: row.direction.parse()?,
            counterparty,
            amount: parse_u256(&row.amount)?,
            balance: parse_u256(&row.balance)?,
            tx_hash: B256::from_str(&row.tx_hash)
                .map_err(|_| RowDecodeError::Hash(row.tx_hash.clone()))?,
            block_time: row.block_time,
        })
    }
}

/// Raw persisted form of a token-contract transfer. These rows carry no
/// running balance: the anchor is the native-coin balance, token amounts are
/// in the token's own units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TokenTransferRow {
    pub block_num: i64,
    pub tx_idx: i32,
    pub log_idx: i32,
    pub from_addr: String,
    pub to_addr: Option<String>,
    pub amount: String,
    pub tx_hash: String,
    pub token_addr: String,
}

impl TokenTransferRow {
    /// None for native transfer events.
    pub fn from_event(event: &TransferEvent) -> Option<Self> {
        let token = event.token_contract?;
        Some(TokenTransferRow {
            block_num: event.block_number as i64,
            tx_idx: event.tx_index as i32,
            log_idx: event.log_index as i32,
            from_addr: format!("{:#x}", event.from),
            to_addr: event.to.map(|a| format!("{a:#x}")),
            amount: event.amount.to_string(),
            tx_hash: format!("{:#x}", event.tx_hash),
            token_addr: format!("{token:#x}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, b256};

    fn entry() -> LedgerEntry {
        LedgerEntry {
            account: address!("00000000000000000000000000000000000000aa"),
            block_number: 100,
            tx_index: 3,
            internal_index: 7,
            direction: Direction::Send,
            counterparty: Some(address!("00000000000000000000000000000000000000bb")),
            amount: U256::from(42u64),
            tx_hash: b256!("1111111111111111111111111111111111111111111111111111111111111111"),
            balance: U256::from(958u64),
            block_time: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn ledger_row_round_trip() {
        let original = entry();
        let row = LedgerRow::from(&original);
        assert_eq!(row.direction, "send");
        assert_eq!(row.amount, "42");
        let back = LedgerEntry::try_from(row).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn round_trip_preserves_large_amounts() {
        let mut original = entry();
        original.amount = U256::MAX;
        original.balance = U256::MAX - U256::from(1u64);
        let back = LedgerEntry::try_from(LedgerRow::from(&original)).unwrap();
        assert_eq!(back.amount, U256::MAX);
        assert_eq!(back.balance, original.balance);
    }

    #[test]
    fn missing_counterparty_round_trips_as_null() {
        let mut original = entry();
        original.counterparty = None;
        let row = LedgerRow::from(&original);
        assert_eq!(row.counterparty_addr, None);
        assert_eq!(LedgerEntry::try_from(row).unwrap().counterparty, None);
    }

    #[test]
    fn third_direction_value_is_rejected() {
        let mut row = LedgerRow::from(&entry());
        row.direction = "hold".to_string();
        assert!(matches!(
            LedgerEntry::try_from(row),
            Err(RowDecodeError::Direction(UnknownDirection(s))) if s == "hold"
        ));
    }
}
