use alloy_primitives::{b256, Address, B256, U256};
use thiserror::Error;

use crate::chain::{ChainEvent, Log, SenderError};
use crate::models::TransferEvent;

/// ERC-20 / KIP-7 `Transfer(address,address,uint256)` topic hash.
pub const TRANSFER_EVENT_TOPIC: B256 =
    b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

const WORD_BYTES: usize = 32;

/// Extraction output for one block. Issues are non-fatal: a malformed log is
/// skipped and a failed sender recovery degrades to the zero address; the
/// caller decides how loudly to report them.
#[derive(Debug, Default)]
pub struct BlockTransfers {
    pub events: Vec<TransferEvent>,
    pub issues: Vec<ExtractIssue>,
}

#[derive(Debug, Error)]
pub enum ExtractIssue {
    #[error("tx {tx_index}: sender recovery failed, using zero address: {source}")]
    SenderRecovery { tx_index: u32, source: SenderError },
    #[error("log {log_index}: {source}")]
    MalformedLog { log_index: u32, source: LogDataError },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogDataError {
    #[error("data length is not valid. want a multiple of 32, actual: {len}")]
    UnalignedData { len: usize },
    #[error("expected at least 4 words, actual: {words}")]
    MissingWords { words: usize },
}

/// Turns one finalized block plus its logs into the ordered transfer list:
/// one native event per transaction in block order, then one token event per
/// matching `Transfer` log in log order. No filtering by transaction status
/// or zero value here; callers that need it filter downstream.
pub fn extract_transfers(event: &ChainEvent, chain_id: u64) -> BlockTransfers {
    let mut out = BlockTransfers::default();
    let block_number = event.block.number;

    for (tx_index, tx) in event.block.transactions.iter().enumerate() {
        let tx_index = tx_index as u32;
        let from = match tx.sender(chain_id) {
            Ok(addr) => addr,
            Err(source) => {
                out.issues
                    .push(ExtractIssue::SenderRecovery { tx_index, source });
                Address::ZERO
            }
        };
        out.events.push(TransferEvent {
            block_number,
            tx_index,
            log_index: 0,
            from,
            to: tx.to,
            amount: tx.value,
            tx_hash: tx.hash,
            token_contract: None,
        });
    }

    for (log_index, log) in event.logs.iter().enumerate() {
        let log_index = log_index as u32;
        if log.topics.first() != Some(&TRANSFER_EVENT_TOPIC) {
            continue;
        }
        match decode_transfer_log(log, block_number, log_index) {
            Ok(ev) => out.events.push(ev),
            Err(source) => out
                .issues
                .push(ExtractIssue::MalformedLog { log_index, source }),
        }
    }

    out
}

fn decode_transfer_log(
    log: &Log,
    block_number: u64,
    log_index: u32,
) -> Result<TransferEvent, LogDataError> {
    // Topics followed by the data words: word 1 is the sender, word 2 the
    // destination, word 3 the amount.
    let mut words = log.topics.clone();
    words.extend(split_to_words(&log.data)?);
    if words.len() < 4 {
        return Err(LogDataError::MissingWords { words: words.len() });
    }
    Ok(TransferEvent {
        block_number,
        tx_index: log.tx_index,
        log_index,
        from: word_to_address(words[1]),
        to: Some(word_to_address(words[2])),
        amount: U256::from_be_bytes(words[3].0),
        tx_hash: log.tx_hash,
        token_contract: Some(log.address),
    })
}

fn split_to_words(data: &[u8]) -> Result<Vec<B256>, LogDataError> {
    if data.len() % WORD_BYTES != 0 {
        return Err(LogDataError::UnalignedData { len: data.len() });
    }
    Ok(data.chunks_exact(WORD_BYTES).map(B256::from_slice).collect())
}

/// Trims a 32-byte word down to the trailing address field.
fn word_to_address(word: B256) -> Address {
    Address::from_word(word)
}
