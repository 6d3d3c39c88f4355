//! In-memory chain adapter
//!
//! Deterministic stand-in for a real ledger: every accepted submission is
//! mined into its own block, escrows are tracked in memory, and failures
//! can be scripted ahead of time. Backs the `simulated` adapter kind and
//! the scenario tests.

use crate::chain::{ChainAdapter, EscrowState, EscrowStatus, PreparedTransaction};
use crate::error::{RelayerError, RelayerResult};
use crate::events::{kinds, EventFilter, RawChainEvent};
use crate::relay::{MessageType, WireMessage};
use crate::security::verify_secret;
use crate::types::{ChainId, OrderId, Secret, TxRef};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Scripted outcome for an upcoming `submit`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Node unavailable: retryable
    Transient,
    /// Contract revert: not retryable
    Permanent,
}

#[derive(Default)]
struct SimState {
    head: u64,
    tx_counter: u64,
    /// Block each transaction landed in
    txs: HashMap<TxRef, u64>,
    escrows: HashMap<String, EscrowState>,
    escrow_orders: HashMap<String, OrderId>,
    submit_attempts: u64,
    submissions: Vec<PreparedTransaction>,
    failures: VecDeque<FailureMode>,
    history: Vec<RawChainEvent>,
}

pub struct SimulatedChain {
    chain: ChainId,
    state: Mutex<SimState>,
    events: broadcast::Sender<RawChainEvent>,
}

impl SimulatedChain {
    pub fn new(chain: ChainId) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            chain,
            state: Mutex::new(SimState::default()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panicked test thread must not wedge the simulation
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `count` submissions fail
    pub fn fail_next(&self, count: usize, mode: FailureMode) {
        let mut state = self.lock();
        for _ in 0..count {
            state.failures.push_back(mode);
        }
    }

    /// Mine empty blocks
    pub fn advance(&self, blocks: u64) {
        let mut state = self.lock();
        state.head += blocks;
        debug!("Chain {} advanced to block {}", self.chain, state.head);
    }

    pub fn head(&self) -> u64 {
        self.lock().head
    }

    /// Every `submit` call, including failed ones
    pub fn submit_attempts(&self) -> u64 {
        self.lock().submit_attempts
    }

    /// Accepted submissions, in order
    pub fn submissions(&self) -> Vec<PreparedTransaction> {
        self.lock().submissions.clone()
    }

    /// Relayed messages accepted by this chain
    pub fn relayed_messages(&self) -> Vec<WireMessage> {
        self.lock()
            .submissions
            .iter()
            .filter_map(|tx| match tx {
                PreparedTransaction::RelayMessage { message } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn escrow_for(&self, order_id: &OrderId) -> Option<(String, EscrowState)> {
        let state = self.lock();
        state
            .escrow_orders
            .iter()
            .find(|(_, id)| *id == order_id)
            .and_then(|(escrow_ref, _)| {
                state
                    .escrows
                    .get(escrow_ref)
                    .map(|escrow| (escrow_ref.clone(), escrow.clone()))
            })
    }

    /// Record an external transaction in the current head block
    pub fn record_tx(&self) -> TxRef {
        let mut state = self.lock();
        self.next_tx(&mut state, false)
    }

    /// Inject an event as if emitted by a contract
    pub fn emit_raw(&self, event: RawChainEvent) {
        let mut state = self.lock();
        state.txs.entry(event.tx_ref.clone()).or_insert(event.block_number);
        self.publish(&mut state, event);
    }

    /// A taker withdrawing from an escrow with the preimage
    pub fn reveal_secret(&self, order_id: &OrderId, secret: &Secret) -> RelayerResult<TxRef> {
        let mut state = self.lock();
        let (escrow_ref, hashlock) = state
            .escrow_orders
            .iter()
            .find(|(_, id)| *id == order_id)
            .and_then(|(escrow_ref, _)| {
                state
                    .escrows
                    .get(escrow_ref)
                    .filter(|e| e.status == EscrowStatus::Active)
                    .and_then(|e| e.hashlock)
                    .map(|h| (escrow_ref.clone(), h))
            })
            .ok_or_else(|| self.revert(format!("no active escrow for order {}", order_id)))?;

        if !verify_secret(secret, &hashlock) {
            return Err(self.revert("secret does not open escrow".to_string()));
        }

        let tx_ref = self.next_tx(&mut state, true);
        let block = state.head;
        if let Some(escrow) = state.escrows.get_mut(&escrow_ref) {
            escrow.status = EscrowStatus::Withdrawn;
        }
        let revealed = RawChainEvent::new(self.chain, kinds::SECRET_REVEALED, tx_ref.clone(), block)
            .with("order_id", order_id.to_string())
            .with("hashlock", hashlock.to_string())
            .with("secret", secret.to_hex());
        let withdrawn = RawChainEvent::new(self.chain, kinds::ESCROW_WITHDRAWN, tx_ref.clone(), block)
            .with("order_id", order_id.to_string())
            .with("escrow_ref", escrow_ref);
        self.publish(&mut state, revealed);
        self.publish(&mut state, withdrawn);
        Ok(tx_ref)
    }

    fn next_tx(&self, state: &mut SimState, mine: bool) -> TxRef {
        if mine {
            state.head += 1;
        }
        state.tx_counter += 1;
        let tx_ref = TxRef(format!("{}-tx-{}", self.chain, state.tx_counter));
        state.txs.insert(tx_ref.clone(), state.head);
        tx_ref
    }

    fn publish(&self, state: &mut SimState, event: RawChainEvent) {
        state.history.push(event.clone());
        // No live subscribers is fine; history replays on subscribe
        let _ = self.events.send(event);
    }

    fn revert(&self, message: String) -> RelayerError {
        RelayerError::PermanentChain {
            chain: self.chain,
            message,
        }
    }

    fn apply(&self, state: &mut SimState, tx: &PreparedTransaction, tx_ref: &TxRef) -> RelayerResult<()> {
        let block = state.head;
        match tx {
            PreparedTransaction::CreateEscrow {
                order_id,
                amount,
                hashlock,
                timelock,
                ..
            } => {
                let escrow_ref = format!("{}-escrow-{}", self.chain, hex::encode(&order_id.0[..8]));
                if state.escrows.contains_key(&escrow_ref) {
                    return Err(self.revert(format!("escrow {} already exists", escrow_ref)));
                }
                state.escrows.insert(
                    escrow_ref.clone(),
                    EscrowState {
                        status: EscrowStatus::Active,
                        amount: *amount,
                        hashlock: Some(*hashlock),
                        timelock: *timelock,
                    },
                );
                state.escrow_orders.insert(escrow_ref.clone(), *order_id);
                let event = RawChainEvent::new(self.chain, kinds::ESCROW_CREATED, tx_ref.clone(), block)
                    .with("order_id", order_id.to_string())
                    .with("escrow_ref", escrow_ref)
                    .with("hashlock", hashlock.to_string())
                    .with("timelock", *timelock)
                    .with("amount", amount.to_string());
                self.publish(state, event);
            }
            PreparedTransaction::Settle { .. } => {}
            PreparedTransaction::RelayMessage { message } => {
                let is_refund = message.message_type.as_deref() == Some(MessageType::Refund.as_str());
                let order_id = message.order_id.as_deref().and_then(|id| id.parse::<OrderId>().ok());
                if let (true, Some(order_id)) = (is_refund, order_id) {
                    let escrow_ref = state
                        .escrow_orders
                        .iter()
                        .find(|(_, id)| **id == order_id)
                        .map(|(escrow_ref, _)| escrow_ref.clone());
                    match escrow_ref {
                        Some(escrow_ref) => {
                            if let Some(escrow) = state.escrows.get_mut(&escrow_ref) {
                                escrow.status = EscrowStatus::Refunded;
                            }
                            let event =
                                RawChainEvent::new(self.chain, kinds::ESCROW_REFUNDED, tx_ref.clone(), block)
                                    .with("order_id", order_id.to_string())
                                    .with("escrow_ref", escrow_ref);
                            self.publish(state, event);
                        }
                        None => warn!("Refund for order {} without escrow on {}", order_id, self.chain),
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChainAdapter for SimulatedChain {
    fn chain(&self) -> ChainId {
        self.chain
    }

    async fn subscribe(&self, filter: EventFilter) -> RelayerResult<BoxStream<'static, RawChainEvent>> {
        // Snapshot and subscribe under one lock so nothing falls between them
        let (backlog, receiver) = {
            let state = self.lock();
            let backlog: Vec<RawChainEvent> = state
                .history
                .iter()
                .filter(|e| filter.matches(e))
                .cloned()
                .collect();
            (backlog, self.events.subscribe())
        };

        let live = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Simulated subscription lagged by {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |event| futures::future::ready(filter.matches(event)));

        Ok(stream::iter(backlog).chain(live).boxed())
    }

    async fn confirmation_depth(&self, tx_ref: &TxRef) -> RelayerResult<u64> {
        let state = self.lock();
        Ok(state
            .txs
            .get(tx_ref)
            .map(|block| state.head.saturating_sub(*block))
            .unwrap_or(0))
    }

    async fn submit(&self, tx: PreparedTransaction) -> RelayerResult<TxRef> {
        let mut state = self.lock();
        state.submit_attempts += 1;

        if let Some(mode) = state.failures.pop_front() {
            debug!("Chain {}: scripted {:?} failure for {}", self.chain, mode, tx.kind());
            return Err(match mode {
                FailureMode::Transient => RelayerError::TransientChain {
                    chain: self.chain,
                    message: "node unavailable".to_string(),
                },
                FailureMode::Permanent => self.revert("execution reverted".to_string()),
            });
        }

        let tx_ref = self.next_tx(&mut state, true);
        self.apply(&mut state, &tx, &tx_ref)?;
        debug!("Chain {}: {} mined as {}", self.chain, tx.kind(), tx_ref);
        state.submissions.push(tx);
        Ok(tx_ref)
    }

    async fn query_escrow(&self, escrow_ref: &str) -> RelayerResult<EscrowState> {
        Ok(self
            .lock()
            .escrows
            .get(escrow_ref)
            .cloned()
            .unwrap_or_else(EscrowState::not_found))
    }

    async fn head_height(&self) -> RelayerResult<u64> {
        Ok(self.lock().head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::generate_hashlock;
    use crate::types::{Amount, Asset};

    fn create_escrow(order: OrderId, secret: &Secret) -> PreparedTransaction {
        PreparedTransaction::CreateEscrow {
            order_id: order,
            asset: Asset::new(ChainId::Evm, "0xusdc"),
            amount: Amount::from(1_000u64),
            recipient: "0xtaker".into(),
            hashlock: generate_hashlock(secret),
            timelock: 10_000,
        }
    }

    #[tokio::test]
    async fn scripted_failures_come_first() {
        let sim = SimulatedChain::new(ChainId::Ton);
        sim.fail_next(1, FailureMode::Transient);
        sim.fail_next(1, FailureMode::Permanent);
        let tx = PreparedTransaction::Settle {
            maker_order: OrderId([1u8; 32]),
            taker_order: OrderId([2u8; 32]),
        };

        assert!(sim.submit(tx.clone()).await.unwrap_err().is_retryable());
        assert!(!sim.submit(tx.clone()).await.unwrap_err().is_retryable());
        assert!(sim.submit(tx).await.is_ok());
        assert_eq!(sim.submit_attempts(), 3);
        assert_eq!(sim.submissions().len(), 1);
    }

    #[tokio::test]
    async fn depth_grows_with_head() {
        let sim = SimulatedChain::new(ChainId::Evm);
        let secret = Secret::new([1u8; 32]);
        let tx_ref = sim.submit(create_escrow(OrderId([1u8; 32]), &secret)).await.unwrap();
        assert_eq!(sim.confirmation_depth(&tx_ref).await.unwrap(), 0);
        sim.advance(3);
        assert_eq!(sim.confirmation_depth(&tx_ref).await.unwrap(), 3);
        assert_eq!(sim.confirmation_depth(&TxRef::new("nope")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn escrow_lifecycle_is_observable() {
        let sim = SimulatedChain::new(ChainId::Evm);
        let order = OrderId([9u8; 32]);
        let secret = Secret::new([1u8; 32]);
        sim.submit(create_escrow(order, &secret)).await.unwrap();

        let (escrow_ref, escrow) = sim.escrow_for(&order).unwrap();
        assert_eq!(escrow.status, EscrowStatus::Active);
        assert_eq!(sim.query_escrow(&escrow_ref).await.unwrap().amount, Amount::from(1_000u64));

        assert!(sim.reveal_secret(&order, &Secret::new([2u8; 32])).is_err());
        sim.reveal_secret(&order, &secret).unwrap();
        assert_eq!(
            sim.query_escrow(&escrow_ref).await.unwrap().status,
            EscrowStatus::Withdrawn
        );
        assert_eq!(
            sim.query_escrow("missing").await.unwrap().status,
            EscrowStatus::NotFound
        );
    }

    #[tokio::test]
    async fn subscription_replays_history_then_streams() {
        let sim = SimulatedChain::new(ChainId::Evm);
        sim.emit_raw(RawChainEvent::new(ChainId::Evm, "a", TxRef::new("1"), 1));
        sim.emit_raw(RawChainEvent::new(ChainId::Evm, "b", TxRef::new("2"), 5));

        let mut stream = sim.subscribe(EventFilter::all(ChainId::Evm, 2)).await.unwrap();
        sim.emit_raw(RawChainEvent::new(ChainId::Evm, "c", TxRef::new("3"), 6));

        assert_eq!(stream.next().await.unwrap().kind, "b");
        assert_eq!(stream.next().await.unwrap().kind, "c");
    }

    #[test]
    fn live_stream_waits_for_new_events() {
        let sim = SimulatedChain::new(ChainId::Ton);
        let mut stream = tokio_test::block_on(sim.subscribe(EventFilter::all(ChainId::Ton, 0))).unwrap();

        let mut next = tokio_test::task::spawn(stream.next());
        tokio_test::assert_pending!(next.poll());

        sim.emit_raw(RawChainEvent::new(ChainId::Ton, "x", TxRef::new("9"), 1));
        assert!(next.is_woken());
        let event = tokio_test::assert_ready!(next.poll()).unwrap();
        assert_eq!(event.kind, "x");
    }
}
