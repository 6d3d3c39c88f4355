//! Order state synchronization
//!
//! The only writer of `OrderRecord`s. Each record sits behind its own
//! lock, so mutations of one order are serialized while different orders
//! proceed independently; readers get cloned snapshots.
//!
//! Chain events only move state once final: events below the chain's
//! confirmation depth wait in that chain's `FinalityTracker` and are
//! applied by `poll_finality`.

use crate::chain::ChainManager;
use crate::error::{RelayerError, RelayerResult};
use crate::events::ChainEvent;
use crate::state::{Journal, SwapState};
use crate::types::{AtomicSwapSecurityParams, ChainId, Clock, CrossChainOrder, OrderId, TxRef};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// One audited transition. `from` is `None` for the creation entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: Option<SwapState>,
    pub to: SwapState,
    pub reason: String,
    pub at: u64,
}

/// Tracked state of one order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order: CrossChainOrder,
    pub state: SwapState,
    /// Name and tx of the last applied chain event
    pub last_event: Option<String>,
    /// Confirmation depth seen per chain name
    pub confirmations: BTreeMap<String, u64>,
    /// Escrow reference per chain name
    pub escrow_refs: BTreeMap<String, String>,
    /// Where the secret became public
    pub fulfillment_tx: Option<TxRef>,
    pub history: Vec<StateTransition>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl OrderRecord {
    pub fn new(order: CrossChainOrder, now: u64) -> Self {
        Self {
            order,
            state: SwapState::Pending,
            last_event: None,
            confirmations: BTreeMap::new(),
            escrow_refs: BTreeMap::new(),
            fulfillment_tx: None,
            history: vec![StateTransition {
                from: None,
                to: SwapState::Pending,
                reason: "order created".to_string(),
                at: now,
            }],
            created_at: now,
            updated_at: now,
        }
    }

    pub fn order_id(&self) -> OrderId {
        self.order.order_id
    }

    pub fn security(&self) -> Option<&AtomicSwapSecurityParams> {
        self.order.security.as_ref()
    }

    pub fn escrow_ref(&self, chain: ChainId) -> Option<&str> {
        self.escrow_refs.get(chain.as_str()).map(String::as_str)
    }

    /// Apply one legal transition; an illegal one changes nothing
    fn transition(&mut self, to: SwapState, reason: &str, now: u64) -> RelayerResult<StateTransition> {
        if !self.state.can_transition_to(to) {
            return Err(RelayerError::InvalidStateTransition {
                order_id: self.order.order_id.to_string(),
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        let entry = StateTransition {
            from: Some(self.state),
            to,
            reason: reason.to_string(),
            at: now,
        };
        self.state = to;
        self.updated_at = now;
        self.history.push(entry.clone());
        Ok(entry)
    }
}

/// Position on the happy path, if the state is on it
fn happy_rank(state: SwapState) -> Option<usize> {
    [
        SwapState::Pending,
        SwapState::EscrowedSrc,
        SwapState::EscrowedDst,
        SwapState::Fulfilled,
        SwapState::Completed,
    ]
    .iter()
    .position(|s| *s == state)
}

/// States to walk from `current` to reach `target` without skipping any.
/// `None` when `target` is already reached, passed, or unreachable.
fn path_to(current: SwapState, target: SwapState) -> Option<Vec<SwapState>> {
    const HAPPY: [SwapState; 5] = [
        SwapState::Pending,
        SwapState::EscrowedSrc,
        SwapState::EscrowedDst,
        SwapState::Fulfilled,
        SwapState::Completed,
    ];

    if let (Some(from), Some(to)) = (happy_rank(current), happy_rank(target)) {
        return (to > from).then(|| HAPPY[from + 1..=to].to_vec());
    }
    match (current, target) {
        (SwapState::Expired, SwapState::Refunded) => Some(vec![SwapState::Refunded]),
        (current, SwapState::Refunded) if current.can_transition_to(SwapState::Expired) => {
            Some(vec![SwapState::Expired, SwapState::Refunded])
        }
        (current, target) if current.can_transition_to(target) => Some(vec![target]),
        _ => None,
    }
}

/// Furthest escrow state the recorded escrows justify. A counterparty
/// escrow alone justifies nothing until the source escrow is known.
fn escrow_target(record: &OrderRecord) -> Option<SwapState> {
    let order = &record.order;
    let source = record.escrow_ref(order.source_chain()).is_some();
    let dest = order.direction.is_cross_chain() && record.escrow_ref(order.dest_chain()).is_some();
    match (source, dest) {
        (true, true) => Some(SwapState::EscrowedDst),
        (true, false) => Some(SwapState::EscrowedSrc),
        (false, _) => None,
    }
}

/// Authoritative per-order state store
pub struct StateSync {
    orders: DashMap<OrderId, Arc<RwLock<OrderRecord>>>,
    chains: Arc<ChainManager>,
    clock: Arc<dyn Clock>,
    journal: Option<Arc<Journal>>,
}

impl StateSync {
    pub fn new(chains: Arc<ChainManager>, clock: Arc<dyn Clock>) -> Self {
        Self {
            orders: DashMap::new(),
            chains,
            clock,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Reload order snapshots after a restart
    pub async fn restore(&self) -> RelayerResult<usize> {
        let Some(journal) = &self.journal else {
            return Ok(0);
        };
        let records = journal.load_orders().await?;
        let count = records.len();
        for record in records {
            self.orders
                .insert(record.order_id(), Arc::new(RwLock::new(record)));
        }
        info!("Restored {} orders from journal", count);
        self.refresh_active_gauge().await;
        Ok(count)
    }

    fn slot(&self, order_id: &OrderId) -> RelayerResult<Arc<RwLock<OrderRecord>>> {
        self.orders
            .get(order_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RelayerError::OrderNotFound {
                order_id: order_id.to_string(),
            })
    }

    /// Start tracking an order at `PENDING`
    pub async fn create_order(&self, order: CrossChainOrder) -> RelayerResult<OrderRecord> {
        let order_id = order.order_id;
        let record = OrderRecord::new(order, self.clock.now());

        let slot = match self.orders.entry(order_id) {
            Entry::Occupied(_) => {
                warn!("Rejected duplicate order {}", order_id);
                return Err(RelayerError::DuplicateOrder {
                    order_id: order_id.to_string(),
                });
            }
            Entry::Vacant(vacant) => vacant.insert(Arc::new(RwLock::new(record.clone()))).clone(),
        };

        let guard = slot.write().await;
        self.persist(&guard, guard.history.first()).await;
        drop(guard);

        info!("Tracking order {} ({:?})", order_id, record.order.direction);
        crate::metrics::record_transition(SwapState::Pending.as_str());
        self.refresh_active_gauge().await;
        Ok(record)
    }

    /// Apply `new_state` if it is reachable from the current state.
    /// An illegal transition is an error and leaves the record untouched.
    pub async fn update_order_state(
        &self,
        order_id: &OrderId,
        new_state: SwapState,
        reason: &str,
    ) -> RelayerResult<OrderRecord> {
        let slot = self.slot(order_id)?;
        let mut record = slot.write().await;
        let from = record.state;

        let entry = record.transition(new_state, reason, self.clock.now()).map_err(|e| {
            warn!("Order {}: refused {} -> {}: {}", order_id, from, new_state, reason);
            e
        })?;

        info!("Order {}: {} -> {} ({})", order_id, from, new_state, reason);
        self.persist(&record, Some(&entry)).await;
        let snapshot = record.clone();
        drop(record);

        crate::metrics::record_transition(new_state.as_str());
        self.refresh_active_gauge().await;
        Ok(snapshot)
    }

    /// Walk forward to `target` through every intermediate state.
    /// A no-op when the order is already at or past `target`.
    pub async fn advance_to(
        &self,
        order_id: &OrderId,
        target: SwapState,
        reason: &str,
    ) -> RelayerResult<OrderRecord> {
        let slot = self.slot(order_id)?;
        let mut record = slot.write().await;
        let steps = self.walk(&mut record, target, reason).await?;
        let snapshot = record.clone();
        drop(record);

        if steps > 0 {
            self.refresh_active_gauge().await;
        }
        Ok(snapshot)
    }

    async fn walk(&self, record: &mut OrderRecord, target: SwapState, reason: &str) -> RelayerResult<usize> {
        let Some(path) = path_to(record.state, target) else {
            debug!(
                "Order {} already at {}; ignoring move to {}",
                record.order_id(),
                record.state,
                target
            );
            return Ok(0);
        };

        let now = self.clock.now();
        for next in &path {
            let from = record.state;
            let entry = record.transition(*next, reason, now)?;
            info!("Order {}: {} -> {} ({})", record.order_id(), from, next, reason);
            self.persist(record, Some(&entry)).await;
            crate::metrics::record_transition(next.as_str());
        }
        Ok(path.len())
    }

    pub async fn get_order(&self, order_id: &OrderId) -> Option<OrderRecord> {
        let slot = self.slot(order_id).ok()?;
        let record = slot.read().await;
        Some(record.clone())
    }

    pub async fn get_state(&self, order_id: &OrderId) -> Option<SwapState> {
        let slot = self.slot(order_id).ok()?;
        let state = slot.read().await.state;
        Some(state)
    }

    /// Route an ingested event: apply it if already final, otherwise
    /// buffer it for finality re-checks.
    pub async fn observe_event(&self, event: ChainEvent) -> RelayerResult<Option<OrderRecord>> {
        let Some(order_id) = event.order_id() else {
            debug!("Ignoring {} on {}: no order", event.name(), event.chain());
            return Ok(None);
        };
        if !self.orders.contains_key(&order_id) {
            debug!("Ignoring {} for untracked order {}", event.name(), order_id);
            return Ok(None);
        }

        let tracker = self.chains.finality_tracker(event.chain())?;
        match tracker.finalized_depth(event.tx_ref()).await {
            Ok(Some(depth)) => self.apply_chain_event(&event, depth).await,
            Ok(None) => {
                tracker.track(event).await;
                Ok(None)
            }
            Err(e) => {
                debug!("Depth check for {} failed, buffering: {}", event.tx_ref(), e);
                tracker.track(event).await;
                Ok(None)
            }
        }
    }

    /// One finality tick over every chain. Returns the records that moved.
    pub async fn poll_finality(&self) -> Vec<OrderRecord> {
        let mut updated = Vec::new();
        for tracker in self.chains.finality_trackers() {
            let report = tracker.check_pending().await;
            for event in &report.stalled {
                error!(
                    "Finality stalled for {} ({}) on {}; operator attention needed",
                    event.name(),
                    event.tx_ref(),
                    event.chain()
                );
            }
            for (event, depth) in report.finalized {
                match self.apply_chain_event(&event, depth).await {
                    Ok(Some(record)) => updated.push(record),
                    Ok(None) => {}
                    Err(e) => warn!("Could not apply {} ({}): {}", event.name(), event.tx_ref(), e),
                }
            }
        }
        updated
    }

    /// Apply a final event. Repeated or out-of-date events only refresh
    /// bookkeeping, so re-delivery after a restart is harmless.
    pub async fn apply_chain_event(&self, event: &ChainEvent, depth: u64) -> RelayerResult<Option<OrderRecord>> {
        let Some(order_id) = event.order_id() else {
            return Ok(None);
        };
        let Ok(slot) = self.slot(&order_id) else {
            return Ok(None);
        };

        let mut record = slot.write().await;
        let chain = event.chain();
        record.confirmations.insert(chain.as_str().to_string(), depth);
        record.last_event = Some(format!("{}@{}", event.name(), event.tx_ref()));

        let target = match event {
            ChainEvent::EscrowCreated { escrow_ref, .. } => {
                record
                    .escrow_refs
                    .insert(chain.as_str().to_string(), escrow_ref.clone());
                let target = escrow_target(&record);
                if target.is_none() {
                    debug!(
                        "Order {}: escrow on {} held until the source escrow is seen",
                        order_id, chain
                    );
                }
                target
            }
            ChainEvent::SecretRevealed { tx_ref, .. } => {
                record.fulfillment_tx = Some(tx_ref.clone());
                Some(SwapState::Fulfilled)
            }
            ChainEvent::EscrowWithdrawn { .. } => Some(SwapState::Completed),
            ChainEvent::EscrowRefunded { .. } => Some(SwapState::Refunded),
            ChainEvent::Unknown { .. } => return Ok(None),
        };

        let reason = format!("{} on {} ({})", event.name(), chain, event.tx_ref());
        let steps = match target {
            Some(target) => self.walk(&mut record, target, &reason).await?,
            None => 0,
        };
        if steps == 0 {
            // Still persist the refreshed bookkeeping
            self.persist(&record, None).await;
        }
        let snapshot = record.clone();
        drop(record);

        self.refresh_active_gauge().await;
        Ok(Some(snapshot))
    }

    /// Record an escrow on `chain` and move as far as the known escrows
    /// allow. The reference is kept even when no transition follows: a
    /// counterparty escrow waits for the source escrow, and an escrow on a
    /// terminal order stays visible for the operator.
    pub async fn record_escrow(
        &self,
        order_id: &OrderId,
        chain: ChainId,
        escrow_ref: &str,
        reason: &str,
    ) -> RelayerResult<OrderRecord> {
        let slot = self.slot(order_id)?;
        let mut record = slot.write().await;
        record
            .escrow_refs
            .insert(chain.as_str().to_string(), escrow_ref.to_string());
        record.updated_at = self.clock.now();

        let walked = match escrow_target(&record) {
            Some(target) => self.walk(&mut record, target, reason).await,
            None => {
                debug!(
                    "Order {}: escrow on {} held until the source escrow is seen",
                    order_id, chain
                );
                Ok(0)
            }
        };
        let steps = match walked {
            Ok(steps) => steps,
            Err(e) => {
                self.persist(&record, None).await;
                return Err(e);
            }
        };
        if steps == 0 {
            self.persist(&record, None).await;
        }
        let snapshot = record.clone();
        drop(record);

        if steps > 0 {
            self.refresh_active_gauge().await;
        }
        Ok(snapshot)
    }

    pub async fn record_fulfillment_proof(&self, order_id: &OrderId, tx_ref: TxRef) -> RelayerResult<()> {
        let slot = self.slot(order_id)?;
        let mut record = slot.write().await;
        record.fulfillment_tx = Some(tx_ref);
        record.updated_at = self.clock.now();
        self.persist(&record, None).await;
        Ok(())
    }

    /// Orders not yet terminal
    pub async fn active_count(&self) -> usize {
        let mut count = 0;
        for slot in self.slots() {
            if !slot.read().await.state.is_terminal() {
                count += 1;
            }
        }
        count
    }

    /// Consistent per-order snapshots of every record
    pub async fn snapshot(&self) -> Vec<OrderRecord> {
        let mut records = Vec::new();
        for slot in self.slots() {
            records.push(slot.read().await.clone());
        }
        records.sort_by_key(|r| (r.created_at, r.order.order_id));
        records
    }

    pub async fn orders_in(&self, state: SwapState) -> Vec<OrderRecord> {
        self.snapshot()
            .await
            .into_iter()
            .filter(|r| r.state == state)
            .collect()
    }

    /// Events that exhausted their finality re-checks
    pub async fn stalled(&self) -> Vec<ChainEvent> {
        let mut stalled = Vec::new();
        for tracker in self.chains.finality_trackers() {
            stalled.extend(tracker.stalled().await);
        }
        stalled
    }

    /// Clone the slot handles so no map guard is held across an await
    fn slots(&self) -> Vec<Arc<RwLock<OrderRecord>>> {
        self.orders.iter().map(|e| e.value().clone()).collect()
    }

    async fn refresh_active_gauge(&self) {
        crate::metrics::set_active_orders(self.active_count().await);
    }

    /// Write-through to the journal. Order snapshots are re-derivable
    /// from chain state, so a failed write is logged, not fatal.
    async fn persist(&self, record: &OrderRecord, entry: Option<&StateTransition>) {
        let Some(journal) = &self.journal else {
            return;
        };
        if let Err(e) = journal.save_order(record).await {
            error!("Failed to journal order {}: {}", record.order_id(), e);
        }
        if let Some(entry) = entry {
            if let Err(e) = journal.append_history(&record.order_id(), entry).await {
                error!("Failed to journal history for {}: {}", record.order_id(), e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::{ChainAdapter, FinalityTracker, SimulatedChain};
    use crate::security::generate_hashlock;
    use crate::types::{
        compute_order_id, Amount, Asset, DestinationBinding, Direction, Hashlock, ManualClock, Secret,
    };
    use std::time::Duration;

    pub(crate) const NOW: u64 = 1_700_000_000;

    /// EVM -> TON order with a one hour timelock
    pub(crate) fn sample_order(salt: u8) -> CrossChainOrder {
        let secret = Secret::new([salt; 32]);
        let mut order = CrossChainOrder {
            order_id: OrderId([0u8; 32]),
            salt: format!("salt-{}", salt),
            maker: "0xmaker".into(),
            receiver: "0xmaker".into(),
            source_asset: Asset::new(ChainId::Evm, "0xusdc"),
            dest_asset: Asset::new(ChainId::Ton, "EQjetton"),
            source_amount: Amount::from(1_000u64),
            dest_amount: Amount::from(990u64),
            deadline: NOW + 3600,
            direction: Direction::EvmToTon,
            destination: Some(DestinationBinding {
                recipient: "UQtaker".into(),
                asset: Asset::new(ChainId::Ton, "EQjetton"),
            }),
            security: Some(AtomicSwapSecurityParams {
                hashlock: generate_hashlock(&secret),
                timelock: NOW + 3600,
                created_at: NOW,
            }),
            created_at: NOW,
        };
        order.order_id = compute_order_id(&order);
        order
    }

    struct Harness {
        sync: StateSync,
        evm: Arc<SimulatedChain>,
        ton: Arc<SimulatedChain>,
    }

    fn harness() -> Harness {
        let chains = Arc::new(ChainManager::new(None, Duration::from_millis(10)));
        let evm = Arc::new(SimulatedChain::new(ChainId::Evm));
        let ton = Arc::new(SimulatedChain::new(ChainId::Ton));
        for (sim, depth) in [(evm.clone(), 3), (ton.clone(), 5)] {
            let tracker = FinalityTracker::new(sim.chain(), depth, 3, Duration::from_millis(100), sim.clone());
            chains.register(sim, Arc::new(tracker));
        }
        let sync = StateSync::new(chains, Arc::new(ManualClock::new(NOW)));
        Harness { sync, evm, ton }
    }

    fn escrow_created(chain: ChainId, order_id: OrderId, tx_ref: TxRef) -> ChainEvent {
        ChainEvent::EscrowCreated {
            chain,
            order_id,
            escrow_ref: format!("{}-escrow", chain),
            hashlock: Hashlock([1u8; 32]),
            timelock: NOW + 3600,
            amount: Amount::from(1_000u64),
            tx_ref,
            block_number: 1,
        }
    }

    #[tokio::test]
    async fn duplicate_orders_are_rejected() {
        let h = harness();
        let record = h.sync.create_order(sample_order(1)).await.unwrap();
        assert_eq!(record.state, SwapState::Pending);
        assert_eq!(record.history.len(), 1);

        let err = h.sync.create_order(sample_order(1)).await.unwrap_err();
        assert!(matches!(err, RelayerError::DuplicateOrder { .. }));
        assert_eq!(h.sync.active_count().await, 1);
    }

    #[tokio::test]
    async fn illegal_transitions_leave_state_and_history_alone() {
        let h = harness();
        let id = h.sync.create_order(sample_order(2)).await.unwrap().order_id();

        for target in [SwapState::EscrowedDst, SwapState::Fulfilled, SwapState::Completed, SwapState::Refunded] {
            let err = h.sync.update_order_state(&id, target, "skip").await.unwrap_err();
            assert!(matches!(err, RelayerError::InvalidStateTransition { .. }));
        }
        let record = h.sync.get_order(&id).await.unwrap();
        assert_eq!(record.state, SwapState::Pending);
        assert_eq!(record.history.len(), 1);

        h.sync.update_order_state(&id, SwapState::Cancelled, "maker").await.unwrap();
        assert!(h
            .sync
            .update_order_state(&id, SwapState::EscrowedSrc, "late")
            .await
            .is_err());
        assert_eq!(h.sync.active_count().await, 0);
    }

    /// Legal moves from `PENDING` that end in `state`
    fn route_to(state: SwapState) -> Vec<SwapState> {
        use SwapState::*;
        match state {
            Pending => vec![],
            EscrowedSrc => vec![EscrowedSrc],
            EscrowedDst => vec![EscrowedSrc, EscrowedDst],
            Fulfilled => vec![EscrowedSrc, EscrowedDst, Fulfilled],
            Completed => vec![EscrowedSrc, EscrowedDst, Fulfilled, Completed],
            Expired => vec![Expired],
            Cancelled => vec![Cancelled],
            Refunded => vec![Expired, Refunded],
        }
    }

    #[tokio::test]
    async fn every_pair_outside_the_table_is_refused() {
        let h = harness();
        let mut salt = 100u8;

        for from in SwapState::ALL {
            for to in SwapState::ALL {
                salt += 1;
                let id = h.sync.create_order(sample_order(salt)).await.unwrap().order_id();
                for step in route_to(from) {
                    h.sync.update_order_state(&id, step, "setup").await.unwrap();
                }
                let before = h.sync.get_order(&id).await.unwrap();
                assert_eq!(before.state, from);

                let result = h.sync.update_order_state(&id, to, "attempt").await;
                let after = h.sync.get_order(&id).await.unwrap();
                if from.can_transition_to(to) {
                    assert!(result.is_ok(), "{} -> {} should be allowed", from, to);
                    assert_eq!(after.state, to);
                    assert_eq!(after.history.len(), before.history.len() + 1);
                } else {
                    assert!(
                        matches!(result, Err(RelayerError::InvalidStateTransition { .. })),
                        "{} -> {} should be refused",
                        from,
                        to
                    );
                    assert_eq!(after.state, from, "{} -> {}", from, to);
                    assert_eq!(after.history, before.history, "{} -> {}", from, to);
                }
            }
        }
    }

    #[tokio::test]
    async fn counterparty_escrow_waits_for_source_escrow() {
        let h = harness();
        let id = h.sync.create_order(sample_order(10)).await.unwrap().order_id();

        let ton = h
            .sync
            .apply_chain_event(&escrow_created(ChainId::Ton, id, TxRef::new("ton-tx-1")), 5)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ton.state, SwapState::Pending);
        assert_eq!(ton.history.len(), 1);
        assert_eq!(ton.escrow_ref(ChainId::Ton), Some("ton-escrow"));

        let record = h
            .sync
            .record_escrow(&id, ChainId::Evm, "evm-escrow-1", "source escrow")
            .await
            .unwrap();
        let states: Vec<SwapState> = record.history.iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![SwapState::Pending, SwapState::EscrowedSrc, SwapState::EscrowedDst]
        );
    }

    #[tokio::test]
    async fn escrow_on_terminal_order_is_kept() {
        let h = harness();
        let id = h.sync.create_order(sample_order(11)).await.unwrap().order_id();
        h.sync
            .update_order_state(&id, SwapState::Cancelled, "maker")
            .await
            .unwrap();

        let record = h
            .sync
            .record_escrow(&id, ChainId::Evm, "evm-escrow-2", "late escrow")
            .await
            .unwrap();
        assert_eq!(record.state, SwapState::Cancelled);
        assert_eq!(record.escrow_ref(ChainId::Evm), Some("evm-escrow-2"));
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let h = harness();
        let err = h
            .sync
            .update_order_state(&OrderId([9u8; 32]), SwapState::EscrowedSrc, "x")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayerError::OrderNotFound { .. }));
        assert!(h.sync.get_order(&OrderId([9u8; 32])).await.is_none());
    }

    #[tokio::test]
    async fn events_wait_for_per_chain_finality() {
        let h = harness();
        let id = h.sync.create_order(sample_order(3)).await.unwrap().order_id();

        let tx = h.evm.record_tx();
        h.evm.advance(2);
        let applied = h
            .sync
            .observe_event(escrow_created(ChainId::Evm, id, tx.clone()))
            .await
            .unwrap();
        assert!(applied.is_none());
        assert_eq!(h.sync.get_state(&id).await, Some(SwapState::Pending));

        h.evm.advance(1);
        let moved = h.sync.poll_finality().await;
        assert_eq!(moved.len(), 1);
        let record = h.sync.get_order(&id).await.unwrap();
        assert_eq!(record.state, SwapState::EscrowedSrc);
        assert_eq!(record.confirmations.get("evm"), Some(&3));
        assert_eq!(record.escrow_ref(ChainId::Evm), Some("evm-escrow"));

        // TON needs five confirmations, not three
        let ton_tx = h.ton.record_tx();
        h.ton.advance(3);
        assert!(h
            .sync
            .observe_event(escrow_created(ChainId::Ton, id, ton_tx))
            .await
            .unwrap()
            .is_none());
        h.ton.advance(2);
        h.sync.poll_finality().await;
        assert_eq!(h.sync.get_state(&id).await, Some(SwapState::EscrowedDst));
    }

    #[tokio::test]
    async fn stalled_events_stay_buffered() {
        let h = harness();
        let id = h.sync.create_order(sample_order(4)).await.unwrap().order_id();
        let tx = h.ton.record_tx();
        h.sync
            .observe_event(escrow_created(ChainId::Ton, id, tx))
            .await
            .unwrap();

        for _ in 0..3 {
            assert!(h.sync.poll_finality().await.is_empty());
        }
        assert_eq!(h.sync.stalled().await.len(), 1);

        h.ton.advance(5);
        assert_eq!(h.sync.poll_finality().await.len(), 1);
        assert!(h.sync.stalled().await.is_empty());
    }

    #[tokio::test]
    async fn repeated_events_are_idempotent() {
        let h = harness();
        let id = h.sync.create_order(sample_order(5)).await.unwrap().order_id();
        let event = escrow_created(ChainId::Evm, id, TxRef::new("evm-tx-1"));

        h.sync.apply_chain_event(&event, 3).await.unwrap();
        h.sync.apply_chain_event(&event, 4).await.unwrap();
        let record = h.sync.get_order(&id).await.unwrap();
        assert_eq!(record.state, SwapState::EscrowedSrc);
        assert_eq!(record.history.len(), 2);
        assert_eq!(record.confirmations.get("evm"), Some(&4));
    }

    #[tokio::test]
    async fn jumps_walk_every_intermediate_state() {
        let h = harness();
        let id = h.sync.create_order(sample_order(6)).await.unwrap().order_id();
        let withdrawn = ChainEvent::EscrowWithdrawn {
            chain: ChainId::Ton,
            order_id: id,
            escrow_ref: "ton-escrow".into(),
            tx_ref: TxRef::new("ton-tx-9"),
            block_number: 9,
        };
        h.sync.apply_chain_event(&withdrawn, 5).await.unwrap();

        let states: Vec<SwapState> = h
            .sync
            .get_order(&id)
            .await
            .unwrap()
            .history
            .iter()
            .map(|t| t.to)
            .collect();
        assert_eq!(
            states,
            vec![
                SwapState::Pending,
                SwapState::EscrowedSrc,
                SwapState::EscrowedDst,
                SwapState::Fulfilled,
                SwapState::Completed
            ]
        );
    }

    #[tokio::test]
    async fn refund_event_expires_first() {
        let h = harness();
        let id = h.sync.create_order(sample_order(7)).await.unwrap().order_id();
        h.sync
            .update_order_state(&id, SwapState::EscrowedSrc, "escrowed")
            .await
            .unwrap();
        let refunded = ChainEvent::EscrowRefunded {
            chain: ChainId::Evm,
            order_id: id,
            escrow_ref: "evm-escrow".into(),
            tx_ref: TxRef::new("evm-tx-4"),
            block_number: 4,
        };
        let record = h.sync.apply_chain_event(&refunded, 3).await.unwrap().unwrap();
        assert_eq!(record.state, SwapState::Refunded);
        assert_eq!(record.history[record.history.len() - 2].to, SwapState::Expired);
    }

    #[tokio::test]
    async fn concurrent_updates_to_one_order_are_serialized() {
        let h = Arc::new(harness());
        let id = h.sync.create_order(sample_order(8)).await.unwrap().order_id();

        let mut handles = Vec::new();
        for i in 0..8 {
            let h = h.clone();
            handles.push(tokio::spawn(async move {
                h.sync
                    .update_order_state(&id, SwapState::EscrowedSrc, &format!("writer {}", i))
                    .await
                    .is_ok()
            }));
        }
        let winners = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(winners, 1);
        assert_eq!(h.sync.get_order(&id).await.unwrap().history.len(), 2);
    }

    #[tokio::test]
    async fn journal_restores_orders() {
        let journal = Arc::new(Journal::in_memory().await.unwrap());
        let chains = Arc::new(ChainManager::new(None, Duration::from_millis(10)));
        let clock = Arc::new(ManualClock::new(NOW));

        let sync = StateSync::new(chains.clone(), clock.clone()).with_journal(journal.clone());
        let id = sync.create_order(sample_order(9)).await.unwrap().order_id();
        sync.update_order_state(&id, SwapState::EscrowedSrc, "escrowed")
            .await
            .unwrap();

        let restarted = StateSync::new(chains, clock).with_journal(journal.clone());
        assert_eq!(restarted.restore().await.unwrap(), 1);
        assert_eq!(restarted.get_state(&id).await, Some(SwapState::EscrowedSrc));
        assert_eq!(journal.history(&id).await.unwrap().len(), 2);
    }
}
