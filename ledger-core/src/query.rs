//! Read path: thin translations from address/range queries to store lookups,
//! independent of ingestion. All results come back newest first, bounded to
//! one fixed page.

use std::str::FromStr;

use alloy_primitives::{Address, B256};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;

use crate::db;
use crate::models::LedgerRow;

/// Fixed page size for every read operation.
pub const PAGE_SIZE: i64 = 100;

/// A block-range bound: explicit number, block hash, or symbolic marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockId {
    Number(u64),
    Hash(B256),
    Latest,
    Earliest,
    Pending,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid block id {0:?}")]
pub struct ParseBlockIdError(pub String);

impl FromStr for BlockId {
    type Err = ParseBlockIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "latest" => Ok(BlockId::Latest),
            "earliest" => Ok(BlockId::Earliest),
            "pending" => Ok(BlockId::Pending),
            _ => {
                if let Some(hex) = s.strip_prefix("0x") {
                    if hex.len() == 64 {
                        return B256::from_str(s)
                            .map(BlockId::Hash)
                            .map_err(|_| ParseBlockIdError(s.to_string()));
                    }
                    return u64::from_str_radix(hex, 16)
                        .map(BlockId::Number)
                        .map_err(|_| ParseBlockIdError(s.to_string()));
                }
                s.parse::<u64>()
                    .map(BlockId::Number)
                    .map_err(|_| ParseBlockIdError(s.to_string()))
            }
        }
    }
}

/// Canonical-chain lookups needed to resolve symbolic and hash bounds.
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn current_block_number(&self) -> Option<u64>;
    async fn block_number_by_hash(&self, hash: B256) -> Option<u64>;
}

/// No node attached: hash and `latest` bounds cannot be resolved and the
/// affected queries return empty results.
pub struct NoChainReader;

#[async_trait]
impl ChainReader for NoChainReader {
    async fn current_block_number(&self) -> Option<u64> {
        None
    }

    async fn block_number_by_hash(&self, _hash: B256) -> Option<u64> {
        None
    }
}

pub struct LedgerQuery<C> {
    pool: PgPool,
    chain: C,
}

impl<C: ChainReader> LedgerQuery<C> {
    pub fn new(pool: PgPool, chain: C) -> Self {
        LedgerQuery { pool, chain }
    }

    /// Latest transfers across all accounts, newest first.
    pub async fn latest_transfers(&self) -> Result<Vec<LedgerRow>> {
        db::latest_ledger_entries(&self.pool, PAGE_SIZE).await
    }

    /// One account's transfers within a wall-clock window, newest first.
    pub async fn account_transfers_by_time(
        &self,
        account: Address,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerRow>> {
        db::account_ledger_entries_by_time(&self.pool, account, from, to, PAGE_SIZE).await
    }

    /// One account's transfers within a block-number window, newest first.
    /// Bounds that cannot be resolved (a `pending` marker, an unknown hash,
    /// `latest` with no node attached) yield an empty result rather than an
    /// error.
    pub async fn account_transfers_by_block(
        &self,
        account: Address,
        from: BlockId,
        to: BlockId,
    ) -> Result<Vec<LedgerRow>> {
        let (Some(from), Some(to)) = (
            resolve_bound(&self.chain, from).await,
            resolve_bound(&self.chain, to).await,
        ) else {
            return Ok(Vec::new());
        };
        db::account_ledger_entries_by_block(&self.pool, account, from, to, PAGE_SIZE).await
    }
}

async fn resolve_bound<C: ChainReader>(chain: &C, id: BlockId) -> Option<u64> {
    match id {
        BlockId::Number(n) => Some(n),
        BlockId::Earliest => Some(1),
        BlockId::Latest => chain.current_block_number().await,
        BlockId::Hash(hash) => chain.block_number_by_hash(hash).await,
        // Pending blocks have no settled ledger; unsupported.
        BlockId::Pending => None,
    }
}
