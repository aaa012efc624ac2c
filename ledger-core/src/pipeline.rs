//! The ingestion worker: a single dedicated task draining the chain-event
//! queue, one block at a time. Serial processing is intentional; balance
//! reconstruction must see the world state of exactly the block in hand, and
//! a serialized worker needs no per-block locking or snapshot versioning.

use std::collections::BTreeMap;
use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::chain::ChainEvent;
use crate::extract::extract_transfers;
use crate::ledger::{expand_block, fill_balances};
use crate::models::{LedgerEntry, TransferEvent};

/// Inbound queue depth. One pending event is enough: the worker is strictly
/// serialized and a blocked publisher is the backpressure.
pub const EVENT_QUEUE_DEPTH: usize = 1;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("world state unavailable for root {root}")]
    Unavailable { root: B256 },
}

/// Point-in-time account state of the host node.
#[async_trait]
pub trait StateReader: Send + Sync {
    /// Native-coin balance of `account` at the world state identified by
    /// `state_root`.
    async fn balance_at(&self, state_root: B256, account: Address) -> Result<U256, StateError>;
}

/// Durable destination for finished per-block ledger deltas.
#[async_trait]
pub trait LedgerSink: Send + Sync {
    async fn persist_entries(&self, account: Address, entries: &[LedgerEntry])
        -> anyhow::Result<()>;
    async fn record_token_transfer(&self, event: &TransferEvent) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    Idle,
    Running,
    Stopping,
    Stopped,
}

pub struct EventPipeline<S, K> {
    chain_id: u64,
    state: Arc<S>,
    sink: Arc<K>,
}

/// Control handle for a started pipeline. Dropping it also stops the worker.
pub struct PipelineHandle {
    stop: watch::Sender<bool>,
    phase: watch::Receiver<PipelinePhase>,
    worker: JoinHandle<()>,
}

impl PipelineHandle {
    pub fn phase(&self) -> PipelinePhase {
        *self.phase.borrow()
    }

    /// Signals the worker and waits for it to finish. The stop signal is
    /// observed only between events, so the block in flight drains first.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.worker.await;
    }
}

impl<S, K> EventPipeline<S, K>
where
    S: StateReader + 'static,
    K: LedgerSink + 'static,
{
    pub fn new(chain_id: u64, state: Arc<S>, sink: Arc<K>) -> Self {
        EventPipeline {
            chain_id,
            state,
            sink,
        }
    }

    /// Spawns the worker over the inbound event queue.
    pub fn start(self, events: mpsc::Receiver<ChainEvent>) -> PipelineHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (phase_tx, phase_rx) = watch::channel(PipelinePhase::Idle);
        let worker = tokio::spawn(self.run(events, stop_rx, phase_tx));
        PipelineHandle {
            stop: stop_tx,
            phase: phase_rx,
            worker,
        }
    }

    async fn run(
        self,
        mut events: mpsc::Receiver<ChainEvent>,
        mut stop: watch::Receiver<bool>,
        phase: watch::Sender<PipelinePhase>,
    ) {
        let _ = phase.send(PipelinePhase::Running);
        loop {
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => self.process(event).await,
                    None => {
                        info!("chain event source closed");
                        break;
                    }
                },
            }
        }
        let _ = phase.send(PipelinePhase::Stopping);
        events.close();
        let _ = phase.send(PipelinePhase::Stopped);
        info!("ingestion worker stopped");
    }

    async fn process(&self, event: ChainEvent) {
        let block = event.block.number;
        let transfers = extract_transfers(&event, self.chain_id);
        for issue in &transfers.issues {
            warn!(block, "{issue}");
        }

        let mut ledger = expand_block(&transfers.events, event.block.time());

        // One state lookup per touched account, not per entry. A failed
        // lookup drops the whole block: there is no anchor to reconstruct
        // from and the node will not regress, so no retry either.
        let mut anchors = BTreeMap::new();
        for account in ledger.keys().copied().collect::<Vec<_>>() {
            match self.state.balance_at(event.block.state_root, account).await {
                Ok(balance) => {
                    anchors.insert(account, balance);
                }
                Err(err) => {
                    error!(block, %account, "failed to get state, dropping block: {err}");
                    return;
                }
            }
        }

        for (account, err) in fill_balances(&mut ledger, &anchors) {
            error!(block, %account, "balance reconstruction failed, bucket skipped: {err}");
        }

        for (account, entries) in &ledger {
            if let Err(err) = self.sink.persist_entries(*account, entries).await {
                error!(block, %account, "failed to persist ledger entries: {err:?}");
            }
        }

        for token_event in transfers
            .events
            .iter()
            .filter(|ev| ev.token_contract.is_some())
        {
            if let Err(err) = self.sink.record_token_transfer(token_event).await {
                error!(
                    block,
                    tx_idx = token_event.tx_index,
                    log_idx = token_event.log_index,
                    "failed to record token transfer: {err:?}"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Block, SenderInfo, Transaction};
    use alloy_primitives::{address, b256};
    use std::collections::HashMap;
    use std::sync::Mutex;

    const CHAIN_ID: u64 = 8217;
    const A: Address = address!("00000000000000000000000000000000000000aa");
    const B: Address = address!("00000000000000000000000000000000000000bb");

    /// Balances per state root; roots absent from the map fail the lookup.
    struct MapState {
        roots: HashMap<B256, BTreeMap<Address, U256>>,
    }

    #[async_trait]
    impl StateReader for MapState {
        async fn balance_at(
            &self,
            state_root: B256,
            account: Address,
        ) -> Result<U256, StateError> {
            self.roots
                .get(&state_root)
                .and_then(|balances| balances.get(&account).copied())
                .ok_or(StateError::Unavailable { root: state_root })
        }
    }

    #[derive(Default)]
    struct MemorySink {
        entries: Mutex<Vec<LedgerEntry>>,
        token_rows: Mutex<Vec<TransferEvent>>,
    }

    #[async_trait]
    impl LedgerSink for MemorySink {
        async fn persist_entries(
            &self,
            _account: Address,
            entries: &[LedgerEntry],
        ) -> anyhow::Result<()> {
            self.entries.lock().unwrap().extend_from_slice(entries);
            Ok(())
        }

        async fn record_token_transfer(&self, event: &TransferEvent) -> anyhow::Result<()> {
            self.token_rows.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn root_for(n: u64) -> B256 {
        B256::with_last_byte(n as u8)
    }

    fn block_event(number: u64, transfers: &[(Address, Address, u64)]) -> ChainEvent {
        ChainEvent {
            block: Block {
                number,
                hash: B256::with_last_byte(0xf0),
                state_root: root_for(number),
                timestamp: 1_700_000_000 + number,
                transactions: transfers
                    .iter()
                    .map(|(from, to, value)| Transaction {
                        hash: b256!(
                            "1111111111111111111111111111111111111111111111111111111111111111"
                        ),
                        to: Some(*to),
                        value: U256::from(*value),
                        sender: SenderInfo::Known(*from),
                    })
                    .collect(),
            },
            logs: vec![],
        }
    }

    fn pipeline_with(
        roots: HashMap<B256, BTreeMap<Address, U256>>,
    ) -> (EventPipeline<MapState, MemorySink>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let pipeline = EventPipeline::new(CHAIN_ID, Arc::new(MapState { roots }), sink.clone());
        (pipeline, sink)
    }

    /// Waits for the worker to drain the queue and stop on its own (the
    /// sender side must already be dropped).
    async fn wait_until_stopped(handle: &PipelineHandle) {
        let mut phase = handle.phase.clone();
        while *phase.borrow() != PipelinePhase::Stopped {
            if phase.changed().await.is_err() {
                break;
            }
        }
        assert_eq!(*phase.borrow(), PipelinePhase::Stopped);
    }

    #[tokio::test]
    async fn block_is_extracted_anchored_and_persisted() {
        let mut roots = HashMap::new();
        roots.insert(
            root_for(100),
            BTreeMap::from([(A, U256::from(950u64)), (B, U256::from(500u64))]),
        );
        let (pipeline, sink) = pipeline_with(roots);

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let handle = pipeline.start(rx);

        tx.send(block_event(100, &[(A, B, 50)])).await.unwrap();
        drop(tx);
        wait_until_stopped(&handle).await;

        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries.len(), 2);
        let a = entries.iter().find(|e| e.account == A).unwrap();
        let b = entries.iter().find(|e| e.account == B).unwrap();
        assert_eq!(a.balance, U256::from(950u64));
        assert_eq!(b.balance, U256::from(500u64));
    }

    #[tokio::test]
    async fn state_failure_drops_the_block_but_not_the_worker() {
        // Only block 101 has state available.
        let mut roots = HashMap::new();
        roots.insert(root_for(101), BTreeMap::from([(A, U256::from(90u64)), (B, U256::from(10u64))]));
        let (pipeline, sink) = pipeline_with(roots);

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let handle = pipeline.start(rx);

        tx.send(block_event(100, &[(A, B, 50)])).await.unwrap();
        tx.send(block_event(101, &[(A, B, 10)])).await.unwrap();
        drop(tx);
        wait_until_stopped(&handle).await;

        let entries = sink.entries.lock().unwrap();
        assert!(entries.iter().all(|e| e.block_number == 101));
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn stop_signal_ends_the_worker() {
        let (pipeline, _sink) = pipeline_with(HashMap::new());
        let (tx, rx) = mpsc::channel::<ChainEvent>(EVENT_QUEUE_DEPTH);
        let handle = pipeline.start(rx);

        // The queue stays open; stop alone must end the worker.
        handle.stop().await;
        drop(tx);
    }

    #[tokio::test]
    async fn phase_reaches_stopped() {
        let (pipeline, _sink) = pipeline_with(HashMap::new());
        let (tx, rx) = mpsc::channel::<ChainEvent>(EVENT_QUEUE_DEPTH);
        let handle = pipeline.start(rx);

        let _ = handle.stop.send(true);
        let mut phase = handle.phase.clone();
        while *phase.borrow() != PipelinePhase::Stopped {
            if phase.changed().await.is_err() {
                break;
            }
        }
        assert_eq!(*phase.borrow(), PipelinePhase::Stopped);
        drop(tx);
    }
}
