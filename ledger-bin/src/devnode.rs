// In-process stand-in for the host node, for local runs: produces one
// synthetic finalized block per interval, moving value between a fixed set of
// accounts, and answers state and chain lookups consistently with what it
// emitted. Swap in a real node client behind the same traits for production.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::{keccak256, Address, B256, U256};
use async_trait::async_trait;
use ledger_core::chain::{Block, ChainEvent, SenderInfo, Transaction};
use ledger_core::pipeline::{StateError, StateReader};
use ledger_core::query::ChainReader;
use tokio::sync::mpsc;
use tracing::info;

const ACCOUNTS: usize = 3;
const INITIAL_BALANCE: u64 = 1_000_000_000;

pub struct DevNode {
    inner: Mutex<NodeState>,
}

struct NodeState {
    head: u64,
    balances: BTreeMap<Address, U256>,
    /// Post-block balances keyed by state root.
    snapshots: HashMap<B256, BTreeMap<Address, U256>>,
    block_numbers: HashMap<B256, u64>,
}

fn dev_account(i: usize) -> Address {
    Address::with_last_byte(0xa0 + i as u8)
}

impl DevNode {
    pub fn new() -> Self {
        let balances = (0..ACCOUNTS)
            .map(|i| (dev_account(i), U256::from(INITIAL_BALANCE)))
            .collect();
        DevNode {
            inner: Mutex::new(NodeState {
                head: 0,
                balances,
                snapshots: HashMap::new(),
                block_numbers: HashMap::new(),
            }),
        }
    }

    /// Emits one finalized block per interval into the pipeline queue. The
    /// send blocks while the queue is full, which is the backpressure the
    /// pipeline expects from its publisher.
    pub async fn produce_blocks(self: Arc<Self>, events: mpsc::Sender<ChainEvent>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            let event = self.next_block();
            let number = event.block.number;
            if events.send(event).await.is_err() {
                info!("pipeline queue closed, block production stopping");
                return;
            }
            if number % 100 == 0 {
                info!(block = number, "dev chain progress");
            }
        }
    }

    fn next_block(&self) -> ChainEvent {
        let mut state = self.inner.lock().unwrap();
        let number = state.head + 1;

        let from = dev_account(number as usize % ACCOUNTS);
        let to = dev_account((number as usize + 1) % ACCOUNTS);
        // Clamp to what the sender holds so the emitted value always matches
        // the balance movement in the snapshot.
        let amount = U256::from(100 + number % 50).min(state.balances[&from]);

        let from_balance = state.balances[&from] - amount;
        // Total supply is fixed, so the credit cannot overflow.
        let to_balance = state.balances[&to] + amount;
        state.balances.insert(from, from_balance);
        state.balances.insert(to, to_balance);

        let hash = keccak256(number.to_be_bytes());
        let state_root = keccak256(hash);
        let snapshot = state.balances.clone();
        state.snapshots.insert(state_root, snapshot);
        state.block_numbers.insert(hash, number);
        state.head = number;

        ChainEvent {
            block: Block {
                number,
                hash,
                state_root,
                timestamp: 1_700_000_000 + number,
                transactions: vec![Transaction {
                    hash: keccak256(state_root),
                    to: Some(to),
                    value: amount,
                    sender: SenderInfo::Known(from),
                }],
            },
            logs: vec![],
        }
    }
}

#[async_trait]
impl StateReader for DevNode {
    async fn balance_at(&self, state_root: B256, account: Address) -> Result<U256, StateError> {
        let state = self.inner.lock().unwrap();
        state
            .snapshots
            .get(&state_root)
            .map(|balances| balances.get(&account).copied().unwrap_or(U256::ZERO))
            .ok_or(StateError::Unavailable { root: state_root })
    }
}

#[async_trait]
impl ChainReader for DevNode {
    async fn current_block_number(&self) -> Option<u64> {
        let state = self.inner.lock().unwrap();
        (state.head > 0).then_some(state.head)
    }

    async fn block_number_by_hash(&self, hash: B256) -> Option<u64> {
        self.inner.lock().unwrap().block_numbers.get(&hash).copied()
    }
}
