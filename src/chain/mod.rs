//! Chain module - adapter interface, event ingestion and finality
//!
//! This module provides:
//! - The `ChainAdapter` capability each ledger integration implements
//! - One ingestion loop per chain feeding a bounded channel
//! - Per-chain finality tracking
//! - An in-memory `SimulatedChain` adapter

pub mod finality;
pub mod listener;
pub mod simulated;

pub use finality::{FinalityReport, FinalityTracker};
pub use listener::ChainListener;
pub use simulated::{FailureMode, SimulatedChain};

use crate::error::{RelayerError, RelayerResult};
use crate::events::{ChainEvent, EventFilter, RawChainEvent};
use crate::relay::WireMessage;
use crate::state::Journal;
use crate::types::{Amount, Asset, ChainId, Hashlock, OrderId, TxRef};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Transaction the core asks an adapter to submit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PreparedTransaction {
    /// Lock the maker's funds behind the order's hashlock/timelock
    CreateEscrow {
        order_id: OrderId,
        asset: Asset,
        amount: Amount,
        recipient: String,
        hashlock: Hashlock,
        timelock: u64,
    },
    /// Settle two complementary same-chain orders in one transaction
    Settle {
        maker_order: OrderId,
        taker_order: OrderId,
    },
    /// Deliver a relayed cross-chain message
    RelayMessage { message: WireMessage },
}

impl PreparedTransaction {
    pub fn kind(&self) -> &'static str {
        match self {
            PreparedTransaction::CreateEscrow { .. } => "create_escrow",
            PreparedTransaction::Settle { .. } => "settle",
            PreparedTransaction::RelayMessage { .. } => "relay_message",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Active,
    Withdrawn,
    Refunded,
    NotFound,
}

/// On-chain escrow as reported by `query_escrow`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EscrowState {
    pub status: EscrowStatus,
    pub amount: Amount,
    pub hashlock: Option<Hashlock>,
    pub timelock: u64,
}

impl EscrowState {
    pub fn not_found() -> Self {
        Self {
            status: EscrowStatus::NotFound,
            amount: Amount::ZERO,
            hashlock: None,
            timelock: 0,
        }
    }
}

/// Capability interface to one ledger.
///
/// `submit` must return `TransientChain` for transport problems and
/// `PermanentChain` for reverts; the relay decides retry-vs-abort on it.
/// Implementations must be safe for concurrent use.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain(&self) -> ChainId;

    /// Restartable event stream starting at `filter.from_block`
    async fn subscribe(&self, filter: EventFilter) -> RelayerResult<BoxStream<'static, RawChainEvent>>;

    async fn confirmation_depth(&self, tx_ref: &TxRef) -> RelayerResult<u64>;

    async fn submit(&self, tx: PreparedTransaction) -> RelayerResult<TxRef>;

    async fn query_escrow(&self, escrow_ref: &str) -> RelayerResult<EscrowState>;

    async fn head_height(&self) -> RelayerResult<u64>;
}

/// Manages the adapters for all configured chains
pub struct ChainManager {
    /// Adapters indexed by chain
    adapters: DashMap<ChainId, Arc<dyn ChainAdapter>>,
    /// Listeners indexed by chain
    listeners: DashMap<ChainId, Arc<ChainListener>>,
    /// Finality trackers indexed by chain
    finality_trackers: DashMap<ChainId, Arc<FinalityTracker>>,
    /// Checkpoint persistence
    journal: Option<Arc<Journal>>,
    reconnect_delay: Duration,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl ChainManager {
    pub fn new(journal: Option<Arc<Journal>>, reconnect_delay: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            adapters: DashMap::new(),
            listeners: DashMap::new(),
            finality_trackers: DashMap::new(),
            journal,
            reconnect_delay,
            shutdown,
        }
    }

    /// Register an adapter together with its finality tracker
    pub fn register(&self, adapter: Arc<dyn ChainAdapter>, finality: Arc<FinalityTracker>) {
        let chain = adapter.chain();
        info!(
            "Registering chain {} ({} confirmations required)",
            chain,
            finality.required_confirmations()
        );
        let listener = ChainListener::new(chain, adapter.clone(), self.journal.clone());
        self.listeners.insert(chain, Arc::new(listener));
        self.finality_trackers.insert(chain, finality);
        self.adapters.insert(chain, adapter);
    }

    /// Get adapter for a specific chain
    pub fn adapter(&self, chain: ChainId) -> RelayerResult<Arc<dyn ChainAdapter>> {
        self.adapters
            .get(&chain)
            .map(|a| a.clone())
            .ok_or(RelayerError::ChainNotFound { chain })
    }

    /// Get finality tracker for a specific chain
    pub fn finality_tracker(&self, chain: ChainId) -> RelayerResult<Arc<FinalityTracker>> {
        self.finality_trackers
            .get(&chain)
            .map(|f| f.clone())
            .ok_or(RelayerError::ChainNotFound { chain })
    }

    pub fn finality_trackers(&self) -> Vec<Arc<FinalityTracker>> {
        self.finality_trackers.iter().map(|e| e.value().clone()).collect()
    }

    /// Spawn one ingestion loop per chain. Each restarts its subscription
    /// after an error; a full `events` channel applies backpressure to the
    /// adapter stream.
    pub async fn start_listeners(&self, events: mpsc::Sender<ChainEvent>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for entry in self.listeners.iter() {
            let listener = entry.value().clone();
            if let Err(e) = listener.restore_checkpoint().await {
                warn!("Chain {}: starting without checkpoint: {}", listener.chain(), e);
            }

            let events = events.clone();
            let mut shutdown = self.shutdown.subscribe();
            let reconnect_delay = self.reconnect_delay;

            handles.push(tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        break;
                    }

                    match listener.listen(&events, shutdown.clone()).await {
                        Ok(()) => break,
                        Err(e) => {
                            error!("Listener error for chain {}: {}", listener.chain(), e);
                            tokio::select! {
                                _ = tokio::time::sleep(reconnect_delay) => {}
                                _ = shutdown.changed() => {}
                            }
                        }
                    }
                }
                info!("Listener for chain {} stopped", listener.chain());
            }));
        }

        handles
    }

    /// Head height per chain; `None` for an unreachable chain
    pub async fn health_check(&self) -> Vec<(ChainId, Option<u64>)> {
        let adapters: Vec<_> = self
            .adapters
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut results = Vec::new();
        for (chain, adapter) in adapters {
            let head = match adapter.head_height().await {
                Ok(height) => Some(height),
                Err(e) => {
                    warn!("Chain {} health check failed: {}", chain, e);
                    None
                }
            };
            crate::metrics::record_chain_health(chain, head);
            results.push((chain, head));
        }
        results.sort_by_key(|(chain, _)| *chain);
        results
    }

    /// Get all connected chains
    pub fn connected_chains(&self) -> Vec<ChainId> {
        let mut chains: Vec<_> = self.adapters.iter().map(|e| *e.key()).collect();
        chains.sort();
        chains
    }

    /// Stop all chain listeners
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        info!("Chain manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(chain: ChainId) -> (ChainManager, Arc<SimulatedChain>) {
        let manager = ChainManager::new(None, Duration::from_millis(10));
        let sim = Arc::new(SimulatedChain::new(chain));
        let tracker = Arc::new(FinalityTracker::new(
            chain,
            3,
            3,
            Duration::from_millis(100),
            sim.clone(),
        ));
        manager.register(sim.clone(), tracker);
        (manager, sim)
    }

    #[tokio::test]
    async fn unknown_chain_is_reported() {
        let (manager, _) = manager_with(ChainId::Evm);
        assert!(manager.adapter(ChainId::Evm).is_ok());
        assert!(matches!(
            manager.adapter(ChainId::Ton),
            Err(RelayerError::ChainNotFound { chain: ChainId::Ton })
        ));
        assert_eq!(manager.connected_chains(), vec![ChainId::Evm]);
    }

    #[tokio::test]
    async fn health_check_reports_head_height() {
        let (manager, sim) = manager_with(ChainId::Ton);
        sim.advance(7);
        assert_eq!(manager.health_check().await, vec![(ChainId::Ton, Some(7))]);
    }

    #[tokio::test]
    async fn health_check_marks_failing_adapter() {
        let manager = ChainManager::new(None, Duration::from_millis(10));
        let mut mock = MockChainAdapter::new();
        mock.expect_chain().return_const(ChainId::Evm);
        mock.expect_head_height().returning(|| {
            Err(RelayerError::TransientChain {
                chain: ChainId::Evm,
                message: "node unavailable".into(),
            })
        });
        let mock: Arc<dyn ChainAdapter> = Arc::new(mock);
        let tracker = Arc::new(FinalityTracker::new(
            ChainId::Evm,
            3,
            3,
            Duration::from_millis(100),
            mock.clone(),
        ));
        manager.register(mock, tracker);
        assert_eq!(manager.health_check().await, vec![(ChainId::Evm, None)]);
    }

    #[tokio::test]
    async fn listeners_forward_parsed_events() {
        let (manager, sim) = manager_with(ChainId::Evm);
        let (tx, mut rx) = mpsc::channel(8);
        let handles = manager.start_listeners(tx).await;

        // Give the subscription a moment to attach
        tokio::time::sleep(Duration::from_millis(20)).await;
        sim.emit_raw(RawChainEvent::new(ChainId::Evm, "paused", TxRef::new("0xaa"), 1));

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.name(), "unknown");

        manager.stop();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
