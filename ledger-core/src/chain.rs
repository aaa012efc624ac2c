// Node-facing data types: what the host chain delivers for each finalized
// block, and sender resolution for the two transaction formats.

use alloy_primitives::{Address, PrimitiveSignature, B256, U256};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// One notification per finalized block: the block and its event logs.
#[derive(Debug, Clone)]
pub struct ChainEvent {
    pub block: Block,
    pub logs: Vec<Log>,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub number: u64,
    pub hash: B256,
    pub state_root: B256,
    /// Unix seconds.
    pub timestamp: u64,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.timestamp as i64, 0).unwrap_or(DateTime::UNIX_EPOCH)
    }
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub hash: B256,
    /// None marks a contract-creation transaction.
    pub to: Option<Address>,
    pub value: U256,
    pub sender: SenderInfo,
}

/// Typed envelopes carry the sender; legacy transactions only carry the
/// signature, bound to the chain id per EIP-155.
#[derive(Debug, Clone)]
pub enum SenderInfo {
    Known(Address),
    LegacySigned {
        /// Chain-id-bound signing hash computed by the node.
        signing_hash: B256,
        v: u64,
        r: U256,
        s: U256,
    },
}

#[derive(Debug, Error)]
pub enum SenderError {
    #[error("signature v value {v} does not bind chain id {chain_id}")]
    ChainIdMismatch { v: u64, chain_id: u64 },
    #[error("signature recovery failed: {0}")]
    Recovery(#[from] alloy_primitives::SignatureError),
}

impl Transaction {
    /// Resolves the sender. Legacy transactions recover it from the EIP-155
    /// signature over the signing hash.
    pub fn sender(&self, chain_id: u64) -> Result<Address, SenderError> {
        match &self.sender {
            SenderInfo::Known(addr) => Ok(*addr),
            SenderInfo::LegacySigned {
                signing_hash,
                v,
                r,
                s,
            } => {
                let odd_y = legacy_parity(*v, chain_id)
                    .ok_or(SenderError::ChainIdMismatch { v: *v, chain_id })?;
                let sig = PrimitiveSignature::new(*r, *s, odd_y);
                Ok(sig.recover_address_from_prehash(signing_hash)?)
            }
        }
    }
}

/// y-parity from a legacy `v`: either the pre-protection 27/28 form or the
/// EIP-155 form `v = parity + chain_id * 2 + 35`.
fn legacy_parity(v: u64, chain_id: u64) -> Option<bool> {
    match v {
        27 | 28 => Some(v == 28),
        _ => {
            let base = chain_id.checked_mul(2)?.checked_add(35)?;
            match v.checked_sub(base)? {
                0 => Some(false),
                1 => Some(true),
                _ => None,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Log {
    /// Emitting contract.
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
    /// Index of the transaction this log belongs to.
    pub tx_index: u32,
    pub tx_hash: B256,
}
