//! Chain finality tracking
//!
//! Chains finalize differently, so each has its own confirmation depth
//! (e.g. 3 on the EVM side, 5 on TON). Events below that depth are
//! buffered and re-checked on every finality tick. An event still short
//! after `max_retries` checks is reported as stalled once and stays
//! buffered, so a slow chain delays a swap instead of losing it.

use crate::chain::ChainAdapter;
use crate::error::{RelayerError, RelayerResult};
use crate::events::ChainEvent;
use crate::types::{ChainId, TxRef};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

struct PendingEvent {
    event: ChainEvent,
    checks: u32,
    stalled: bool,
}

/// Result of one pass over the buffer
#[derive(Debug, Default)]
pub struct FinalityReport {
    /// Events that reached the required depth, with their depth
    pub finalized: Vec<(ChainEvent, u64)>,
    /// Events that just exhausted their re-checks
    pub stalled: Vec<ChainEvent>,
}

/// Tracks finality for events on a specific chain
pub struct FinalityTracker {
    chain: ChainId,
    /// Required confirmation depth
    required_confirmations: u64,
    max_retries: u32,
    call_timeout: Duration,
    adapter: Arc<dyn ChainAdapter>,
    pending: RwLock<Vec<PendingEvent>>,
    /// One pass at a time; the buffer lock is not held across depth queries
    checking: Mutex<()>,
}

impl FinalityTracker {
    pub fn new(
        chain: ChainId,
        required_confirmations: u64,
        max_retries: u32,
        call_timeout: Duration,
        adapter: Arc<dyn ChainAdapter>,
    ) -> Self {
        Self {
            chain,
            required_confirmations,
            max_retries,
            call_timeout,
            adapter,
            pending: RwLock::new(Vec::new()),
            checking: Mutex::new(()),
        }
    }

    pub fn chain(&self) -> ChainId {
        self.chain
    }

    pub fn required_confirmations(&self) -> u64 {
        self.required_confirmations
    }

    /// Current depth of a transaction, bounded by the call timeout
    pub async fn depth(&self, tx_ref: &TxRef) -> RelayerResult<u64> {
        match timeout(self.call_timeout, self.adapter.confirmation_depth(tx_ref)).await {
            Ok(result) => result,
            Err(_) => Err(RelayerError::Timeout {
                operation: format!("confirmation depth of {} on {}", tx_ref, self.chain),
            }),
        }
    }

    /// Depth if the transaction is final, `None` otherwise
    pub async fn finalized_depth(&self, tx_ref: &TxRef) -> RelayerResult<Option<u64>> {
        let depth = self.depth(tx_ref).await?;
        Ok((depth >= self.required_confirmations).then_some(depth))
    }

    /// Buffer an event until it reaches the required depth
    pub async fn track(&self, event: ChainEvent) {
        let mut pending = self.pending.write().await;
        let duplicate = pending
            .iter()
            .any(|p| p.event.tx_ref() == event.tx_ref() && p.event.name() == event.name());
        if duplicate {
            return;
        }
        debug!(
            "Tracking {} ({}) for finality on chain {}",
            event.name(),
            event.tx_ref(),
            self.chain
        );
        pending.push(PendingEvent {
            event,
            checks: 0,
            stalled: false,
        });
    }

    /// Get pending event count
    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Re-check every buffered event once
    pub async fn check_pending(&self) -> FinalityReport {
        let _pass = self.checking.lock().await;
        let mut report = FinalityReport::default();
        let batch = std::mem::take(&mut *self.pending.write().await);
        let mut still_pending = Vec::with_capacity(batch.len());

        for mut entry in batch {
            let depth = match self.depth(entry.event.tx_ref()).await {
                Ok(depth) => depth,
                Err(e) => {
                    debug!("Depth check for {} failed: {}", entry.event.tx_ref(), e);
                    0
                }
            };

            if depth >= self.required_confirmations {
                info!(
                    "{} ({}) finalized on chain {} ({} confirmations)",
                    entry.event.name(),
                    entry.event.tx_ref(),
                    self.chain,
                    depth
                );
                report.finalized.push((entry.event, depth));
                continue;
            }

            entry.checks += 1;
            if entry.checks >= self.max_retries && !entry.stalled {
                entry.stalled = true;
                warn!(
                    "{} ({}) stalled on chain {}: {} / {} confirmations after {} checks",
                    entry.event.name(),
                    entry.event.tx_ref(),
                    self.chain,
                    depth,
                    self.required_confirmations,
                    entry.checks
                );
                crate::metrics::record_finality_stall(self.chain);
                report.stalled.push(entry.event.clone());
            }
            still_pending.push(entry);
        }

        // Merge with whatever was tracked during the pass
        let mut pending = self.pending.write().await;
        for entry in pending.drain(..) {
            let same = |e: &ChainEvent| e.tx_ref() == entry.event.tx_ref() && e.name() == entry.event.name();
            let seen = still_pending.iter().any(|p| same(&p.event))
                || report.finalized.iter().any(|(e, _)| same(e));
            if !seen {
                still_pending.push(entry);
            }
        }
        *pending = still_pending;
        report
    }

    /// Buffered events that have been reported stalled
    pub async fn stalled(&self) -> Vec<ChainEvent> {
        self.pending
            .read()
            .await
            .iter()
            .filter(|p| p.stalled)
            .map(|p| p.event.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{EscrowState, MockChainAdapter, PreparedTransaction, SimulatedChain};
    use crate::events::{EventFilter, RawChainEvent};
    use async_trait::async_trait;
    use futures::stream::BoxStream;

    /// Answers depth queries slowly
    struct SlowDepth(Arc<SimulatedChain>);

    #[async_trait]
    impl ChainAdapter for SlowDepth {
        fn chain(&self) -> ChainId {
            self.0.chain()
        }

        async fn subscribe(&self, filter: EventFilter) -> RelayerResult<BoxStream<'static, RawChainEvent>> {
            self.0.subscribe(filter).await
        }

        async fn confirmation_depth(&self, tx_ref: &TxRef) -> RelayerResult<u64> {
            tokio::time::sleep(Duration::from_millis(150)).await;
            self.0.confirmation_depth(tx_ref).await
        }

        async fn submit(&self, tx: PreparedTransaction) -> RelayerResult<TxRef> {
            self.0.submit(tx).await
        }

        async fn query_escrow(&self, escrow_ref: &str) -> RelayerResult<EscrowState> {
            self.0.query_escrow(escrow_ref).await
        }

        async fn head_height(&self) -> RelayerResult<u64> {
            self.0.head_height().await
        }
    }

    fn unknown_event(tx: &str) -> ChainEvent {
        ChainEvent::Unknown {
            chain: ChainId::Ton,
            kind: "test".into(),
            tx_ref: TxRef::new(tx),
            block_number: 1,
        }
    }

    #[tokio::test]
    async fn event_finalizes_once_deep_enough() {
        let sim = Arc::new(SimulatedChain::new(ChainId::Ton));
        let tx = sim.record_tx();
        let tracker = FinalityTracker::new(ChainId::Ton, 5, 3, Duration::from_millis(100), sim.clone());

        tracker.track(unknown_event(tx.as_str())).await;
        tracker.track(unknown_event(tx.as_str())).await;
        assert_eq!(tracker.pending_count().await, 1);

        sim.advance(4);
        let report = tracker.check_pending().await;
        assert!(report.finalized.is_empty());

        sim.advance(1);
        let report = tracker.check_pending().await;
        assert_eq!(report.finalized.len(), 1);
        assert_eq!(report.finalized[0].1, 5);
        assert_eq!(tracker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn stall_is_reported_once_and_event_kept() {
        let sim = Arc::new(SimulatedChain::new(ChainId::Ton));
        let tx = sim.record_tx();
        let tracker = FinalityTracker::new(ChainId::Ton, 5, 3, Duration::from_millis(100), sim.clone());
        tracker.track(unknown_event(tx.as_str())).await;

        assert!(tracker.check_pending().await.stalled.is_empty());
        assert!(tracker.check_pending().await.stalled.is_empty());
        assert_eq!(tracker.check_pending().await.stalled.len(), 1);
        assert!(tracker.check_pending().await.stalled.is_empty());
        assert_eq!(tracker.stalled().await.len(), 1);

        sim.advance(5);
        assert_eq!(tracker.check_pending().await.finalized.len(), 1);
        assert!(tracker.stalled().await.is_empty());
    }

    #[tokio::test]
    async fn tracking_is_not_blocked_by_a_depth_pass() {
        let sim = Arc::new(SimulatedChain::new(ChainId::Ton));
        let first = sim.record_tx();
        let second = sim.record_tx();
        let tracker = Arc::new(FinalityTracker::new(
            ChainId::Ton,
            5,
            3,
            Duration::from_secs(1),
            Arc::new(SlowDepth(sim.clone())),
        ));
        tracker.track(unknown_event(first.as_str())).await;

        let pass = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.check_pending().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        tracker.track(unknown_event(second.as_str())).await;
        tracker.track(unknown_event(first.as_str())).await;
        assert!(started.elapsed() < Duration::from_millis(100));

        let report = pass.await.unwrap();
        assert!(report.finalized.is_empty());
        // The re-tracked first event merges with the checked one
        assert_eq!(tracker.pending_count().await, 2);
    }

    #[tokio::test]
    async fn depth_query_passes_through_adapter() {
        let mut mock = MockChainAdapter::new();
        mock.expect_confirmation_depth().returning(|_| Ok(10));
        let tracker = FinalityTracker::new(ChainId::Evm, 3, 3, Duration::from_millis(200), Arc::new(mock));
        assert_eq!(tracker.depth(&TxRef::new("0x1")).await.unwrap(), 10);

        let mut failing = MockChainAdapter::new();
        failing.expect_confirmation_depth().returning(|_| {
            Err(RelayerError::TransientChain {
                chain: ChainId::Evm,
                message: "rpc down".into(),
            })
        });
        let tracker = FinalityTracker::new(ChainId::Evm, 3, 3, Duration::from_millis(200), Arc::new(failing));
        assert!(tracker.depth(&TxRef::new("0x1")).await.unwrap_err().is_retryable());
        assert_eq!(tracker.finalized_depth(&TxRef::new("0x1")).await.ok(), None);
    }
}
