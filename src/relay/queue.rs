//! Message relay and retry queue
//!
//! Delivers validated messages to destination chain adapters at least once
//! while looking idempotent to the rest of the core:
//! - every message passes validation before it is queued
//! - the replay ledger is consulted exactly once per message, before the
//!   first submission; an already-processed message is dropped as delivered
//! - messages for one order form a FIFO lane served by a single worker;
//!   lanes for different orders run concurrently
//! - transient failures back off and retry, permanent ones fail at once

use crate::chain::{ChainManager, PreparedTransaction};
use crate::error::{RelayerError, RelayerResult};
use crate::relay::{CrossChainMessage, MessageType, RetryPolicy, WireMessage};
use crate::security::{MessageValidator, QuorumSlot};
use crate::types::{ChainId, OrderId, TxRef};

use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RelayStatus {
    Queued,
    InFlight,
    /// `tx_ref` is `None` when the message had already been processed
    Delivered { tx_ref: Option<TxRef> },
    Failed { reason: String },
}

impl RelayStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, RelayStatus::Queued | RelayStatus::InFlight)
    }

    fn label(&self) -> &'static str {
        match self {
            RelayStatus::Queued => "queued",
            RelayStatus::InFlight => "in_flight",
            RelayStatus::Delivered { .. } => "delivered",
            RelayStatus::Failed { .. } => "failed",
        }
    }
}

/// A message owned by the relay for its in-flight lifetime
#[derive(Debug, Clone)]
pub struct RelayEntry {
    pub relay_id: Uuid,
    pub message: CrossChainMessage,
    pub destination: ChainId,
    /// Failed submissions so far
    pub attempt: u32,
    pub status: RelayStatus,
}

/// Final result of a delivery, published to subscribers
#[derive(Debug, Clone)]
pub struct RelayOutcome {
    pub relay_id: Uuid,
    pub order_id: Option<OrderId>,
    pub message_type: MessageType,
    pub destination: ChainId,
    pub status: RelayStatus,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub total_messages: usize,
    pub delivered: usize,
    pub failed: usize,
    pub pending: usize,
}

/// Result of recording one relayer's attestation of an inbound message
#[derive(Debug)]
pub enum AttestationOutcome {
    /// Below quorum
    Pending { confirmations: usize },
    /// Quorum reached and this message owns its slot
    Quorum {
        message: CrossChainMessage,
        confirmations: usize,
    },
    /// Already acted upon
    AlreadyProcessed,
}

/// Finished outcomes kept for status lookups after their entry is retired
const RECENT_OUTCOMES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LaneKey {
    Order(OrderId),
    Solo(Uuid),
}

pub struct MessageRelay {
    validator: Arc<MessageValidator>,
    chains: Arc<ChainManager>,
    policy: RetryPolicy,
    /// Queued and in-flight messages only; finished ones are retired
    entries: DashMap<Uuid, RelayEntry>,
    recent: std::sync::Mutex<VecDeque<RelayOutcome>>,
    queued_total: AtomicUsize,
    delivered: AtomicUsize,
    failed: AtomicUsize,
    /// Queued relay ids per lane; a lane exists exactly while its worker runs
    lanes: Mutex<HashMap<LaneKey, VecDeque<Uuid>>>,
    outcomes: broadcast::Sender<RelayOutcome>,
    accepting: AtomicBool,
    halted: RwLock<Option<String>>,
    shutdown: watch::Sender<bool>,
}

impl MessageRelay {
    pub fn new(validator: Arc<MessageValidator>, chains: Arc<ChainManager>, policy: RetryPolicy) -> Self {
        let (outcomes, _) = broadcast::channel(1024);
        let (shutdown, _) = watch::channel(false);
        Self {
            validator,
            chains,
            policy,
            entries: DashMap::new(),
            recent: std::sync::Mutex::new(VecDeque::with_capacity(RECENT_OUTCOMES)),
            queued_total: AtomicUsize::new(0),
            delivered: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            lanes: Mutex::new(HashMap::new()),
            outcomes,
            accepting: AtomicBool::new(true),
            halted: RwLock::new(None),
            shutdown,
        }
    }

    /// Delivery outcomes (delivered or failed)
    pub fn subscribe(&self) -> broadcast::Receiver<RelayOutcome> {
        self.outcomes.subscribe()
    }

    /// Validate and enqueue a message for `destination`
    pub async fn queue_message(
        self: &Arc<Self>,
        message: CrossChainMessage,
        destination: ChainId,
    ) -> RelayerResult<Uuid> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(RelayerError::ShuttingDown);
        }

        let message_type = message.message_type();
        if let Err(e) = self
            .validator
            .validate_message(&message.to_wire())
            .await
            .into_result()
        {
            warn!("Rejected {} message {}: {}", message_type, message.message_id, e);
            crate::metrics::record_message(message_type.as_str(), "rejected");
            return Err(e);
        }
        self.chains.adapter(destination)?;
        self.validator
            .ledger()
            .record_nonce(&message.sender, message.nonce)
            .await;

        let relay_id = Uuid::new_v4();
        let lane = message
            .order_id()
            .map(LaneKey::Order)
            .unwrap_or(LaneKey::Solo(relay_id));

        info!(
            "Queued {} message {} for {} as {}",
            message_type, message.message_id, destination, relay_id
        );
        self.entries.insert(
            relay_id,
            RelayEntry {
                relay_id,
                message,
                destination,
                attempt: 0,
                status: RelayStatus::Queued,
            },
        );
        self.queued_total.fetch_add(1, Ordering::SeqCst);
        crate::metrics::record_message(message_type.as_str(), "queued");

        let mut lanes = self.lanes.lock().await;
        match lanes.get_mut(&lane) {
            Some(queue) => queue.push_back(relay_id),
            None => {
                lanes.insert(lane, VecDeque::from([relay_id]));
                let relay = self.clone();
                tokio::spawn(async move { relay.run_lane(lane).await });
            }
        }

        Ok(relay_id)
    }

    /// Worker for one lane: delivers its messages strictly in queue order
    async fn run_lane(self: Arc<Self>, lane: LaneKey) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                return;
            }

            let next = {
                let lanes = self.lanes.lock().await;
                lanes.get(&lane).and_then(|queue| queue.front().copied())
            };
            let Some(relay_id) = next else {
                self.lanes.lock().await.remove(&lane);
                return;
            };

            if !self.deliver(relay_id, &mut shutdown).await {
                // Interrupted by shutdown; the entry stays queued
                return;
            }

            let mut lanes = self.lanes.lock().await;
            if let Some(queue) = lanes.get_mut(&lane) {
                queue.pop_front();
                if queue.is_empty() {
                    lanes.remove(&lane);
                    return;
                }
            }
        }
    }

    /// Drive one message to a terminal status. Returns false if shutdown
    /// interrupted it.
    async fn deliver(&self, relay_id: Uuid, shutdown: &mut watch::Receiver<bool>) -> bool {
        let Some((message, destination)) = self
            .entries
            .get(&relay_id)
            .map(|entry| (entry.message.clone(), entry.destination))
        else {
            return true;
        };

        let ledger = self.validator.ledger();
        let hash = message.message_hash();
        match ledger
            .register_message_once(hash, self.validator.clock().now())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!("Message {} already processed; dropping", message.message_id);
                self.finish(relay_id, RelayStatus::Delivered { tx_ref: None });
                return true;
            }
            Err(e) => {
                error!("Replay ledger failure, halting relay: {}", e);
                self.halt(e.to_string()).await;
                self.finish(relay_id, RelayStatus::Failed { reason: e.to_string() });
                return true;
            }
        }

        let wire = message.to_wire();
        let mut attempt: u32 = 0;
        loop {
            self.set_status(relay_id, RelayStatus::InFlight, attempt);

            let submit = async {
                let adapter = self.chains.adapter(destination)?;
                self.policy
                    .call(
                        "relay submit",
                        adapter.submit(PreparedTransaction::RelayMessage {
                            message: wire.clone(),
                        }),
                    )
                    .await
            };

            let result = tokio::select! {
                result = submit => result,
                _ = shutdown.changed() => {
                    self.set_status(relay_id, RelayStatus::Queued, attempt);
                    return false;
                }
            };

            match result {
                Ok(tx_ref) => {
                    crate::metrics::record_relay_attempt(destination, "success");
                    info!(
                        "Delivered message {} to {} in {} after {} failed attempts",
                        message.message_id, destination, tx_ref, attempt
                    );
                    self.finish(relay_id, RelayStatus::Delivered { tx_ref: Some(tx_ref) });
                    return true;
                }
                Err(e) => {
                    attempt += 1;
                    crate::metrics::record_relay_attempt(destination, "failure");

                    if !self.policy.should_retry(&e, attempt) {
                        error!(
                            "Delivery of message {} to {} failed after {} attempts: {}",
                            message.message_id, destination, attempt, e
                        );
                        self.set_status(relay_id, RelayStatus::InFlight, attempt);
                        self.finish(relay_id, RelayStatus::Failed { reason: e.to_string() });
                        return true;
                    }

                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        "Delivery of message {} to {} failed (attempt {}/{}): {}; retrying in {:?}",
                        message.message_id, destination, attempt, self.policy.max_retries, e, delay
                    );
                    self.set_status(relay_id, RelayStatus::Queued, attempt);

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => return false,
                    }
                }
            }
        }
    }

    fn set_status(&self, relay_id: Uuid, status: RelayStatus, attempt: u32) {
        if let Some(mut entry) = self.entries.get_mut(&relay_id) {
            entry.status = status;
            entry.attempt = attempt;
        }
    }

    /// Retire a finished entry into the counters and the recent outcomes
    fn finish(&self, relay_id: Uuid, status: RelayStatus) {
        let Some((_, entry)) = self.entries.remove(&relay_id) else {
            return;
        };
        let outcome = RelayOutcome {
            relay_id,
            order_id: entry.message.order_id(),
            message_type: entry.message.message_type(),
            destination: entry.destination,
            status,
            attempts: entry.attempt,
        };

        match outcome.status {
            RelayStatus::Failed { .. } => self.failed.fetch_add(1, Ordering::SeqCst),
            _ => self.delivered.fetch_add(1, Ordering::SeqCst),
        };
        {
            let mut recent = self.recent.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if recent.len() == RECENT_OUTCOMES {
                recent.pop_front();
            }
            recent.push_back(outcome.clone());
        }

        crate::metrics::record_message(outcome.message_type.as_str(), outcome.status.label());
        // No subscribers is fine
        let _ = self.outcomes.send(outcome);
    }

    async fn halt(&self, reason: String) {
        self.accepting.store(false, Ordering::SeqCst);
        *self.halted.write().await = Some(reason);
    }

    /// Set once replay protection can no longer be guaranteed
    pub async fn halt_reason(&self) -> Option<String> {
        self.halted.read().await.clone()
    }

    /// Record one relayer's attestation of an inbound message.
    ///
    /// Quorum is a precondition for acting on a message. When two different
    /// messages compete for the same `(order, type)` slot, the first to reach
    /// quorum wins and the other is rejected.
    pub async fn accept_attestation(
        &self,
        wire: &WireMessage,
        relayer_id: &str,
    ) -> RelayerResult<AttestationOutcome> {
        let ledger = self.validator.ledger();
        let hash = wire.message_hash();
        if ledger.is_processed(&hash).await {
            return Ok(AttestationOutcome::AlreadyProcessed);
        }

        let message = self.validator.parse_message(wire).await?;
        let confirmations = ledger
            .add_confirmation(hash, relayer_id, self.validator.clock().now())
            .await;
        ledger.record_nonce(&message.sender, message.nonce).await;

        if confirmations < ledger.min_confirmations() {
            debug!(
                "Message {} has {}/{} attestations",
                hash,
                confirmations,
                ledger.min_confirmations()
            );
            return Ok(AttestationOutcome::Pending { confirmations });
        }

        let slot = QuorumSlot {
            order_id: message.order_id(),
            message_type: message.message_type(),
        };
        if !ledger.claim_quorum_slot(slot, hash).await {
            return Err(RelayerError::validation(format!(
                "conflicting attestation: another {} message already reached quorum",
                message.message_type()
            )));
        }

        Ok(AttestationOutcome::Quorum {
            message,
            confirmations,
        })
    }

    /// Live status, or the outcome if it finished recently
    pub fn relay_status(&self, relay_id: &Uuid) -> Option<RelayStatus> {
        match self.entries.get(relay_id) {
            Some(entry) => Some(entry.status.clone()),
            None => self.outcome(relay_id).map(|outcome| outcome.status),
        }
    }

    /// A message still queued or in flight
    pub fn entry(&self, relay_id: &Uuid) -> Option<RelayEntry> {
        self.entries.get(relay_id).map(|entry| entry.clone())
    }

    pub fn outcome(&self, relay_id: &Uuid) -> Option<RelayOutcome> {
        let recent = self.recent.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        recent.iter().rev().find(|o| o.relay_id == *relay_id).cloned()
    }

    pub fn get_stats(&self) -> RelayStats {
        RelayStats {
            total_messages: self.queued_total.load(Ordering::SeqCst),
            delivered: self.delivered.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            pending: self.entries.len(),
        }
    }

    /// Wait until nothing is queued or in flight. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.get_stats().pending == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop intake, drain for up to `grace`, then cancel the workers.
    /// Anything still undelivered stays `Queued`.
    pub async fn shutdown(&self, grace: Duration) -> RelayStats {
        self.accepting.store(false, Ordering::SeqCst);
        if !self.wait_idle(grace).await {
            warn!("Relay drain exceeded {:?}; cancelling in-flight deliveries", grace);
        }
        let _ = self.shutdown.send(true);

        // Workers observe the signal at their next await point
        tokio::time::sleep(Duration::from_millis(20)).await;
        for mut entry in self.entries.iter_mut() {
            if entry.status == RelayStatus::InFlight {
                entry.status = RelayStatus::Queued;
            }
        }

        let stats = self.get_stats();
        info!(
            "Relay stopped: {} delivered, {} failed, {} left pending",
            stats.delivered, stats.failed, stats.pending
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{FailureMode, FinalityTracker, SimulatedChain};
    use crate::config::SecurityConfig;
    use crate::relay::{MessageFactory, MessagePayload};
    use crate::security::{Ed25519Signer, SecurityLedger, SigningCapability};
    use crate::types::{ManualClock, Secret};
    use crate::security::generate_hashlock;

    const NOW: u64 = 1_700_000_000;

    struct Harness {
        relay: Arc<MessageRelay>,
        ton: Arc<SimulatedChain>,
        factory: MessageFactory,
        ledger: Arc<SecurityLedger>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(NOW));
        let ledger = Arc::new(SecurityLedger::new(2, 3600));
        let validator = Arc::new(MessageValidator::new(
            SecurityConfig::default(),
            clock.clone(),
            ledger.clone(),
        ));
        let chains = Arc::new(ChainManager::new(None, Duration::from_millis(10)));
        let ton = Arc::new(SimulatedChain::new(ChainId::Ton));
        chains.register(
            ton.clone(),
            Arc::new(FinalityTracker::new(
                ChainId::Ton,
                5,
                3,
                Duration::from_millis(100),
                ton.clone(),
            )),
        );
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(10),
            call_timeout: Duration::from_millis(200),
        };
        let relay = Arc::new(MessageRelay::new(validator, chains, policy));
        let factory = MessageFactory::new(Arc::new(Ed25519Signer::generate()), clock);
        Harness {
            relay,
            ton,
            factory,
            ledger,
        }
    }

    fn refund(order: u8) -> MessagePayload {
        MessagePayload::Refund {
            order_id: OrderId([order; 32]),
            recipient: "0xmaker".into(),
            amount: 1_000u64.into(),
            hashlock: generate_hashlock(&Secret::new([order; 32])),
        }
    }

    #[tokio::test]
    async fn transient_failures_then_success() {
        let h = harness();
        h.ton.fail_next(2, FailureMode::Transient);
        let message = h.factory.build(ChainId::Evm, ChainId::Ton, refund(1)).await.unwrap();
        let hash = message.message_hash();

        let id = h.relay.queue_message(message, ChainId::Ton).await.unwrap();
        assert!(h.relay.wait_idle(Duration::from_secs(2)).await);

        assert_eq!(h.ton.submit_attempts(), 3);
        assert_eq!(h.ton.relayed_messages().len(), 1);
        assert!(matches!(
            h.relay.relay_status(&id),
            Some(RelayStatus::Delivered { tx_ref: Some(_) })
        ));
        assert_eq!(h.relay.outcome(&id).unwrap().attempts, 2);
        assert!(h.relay.entry(&id).is_none());
        assert!(!h.ledger.register_message_once(hash, NOW).await.unwrap());
    }

    #[tokio::test]
    async fn exhausted_retries_fail_and_notify() {
        let h = harness();
        let mut outcomes = h.relay.subscribe();
        h.ton.fail_next(5, FailureMode::Transient);
        let message = h.factory.build(ChainId::Evm, ChainId::Ton, refund(2)).await.unwrap();
        let id = h.relay.queue_message(message, ChainId::Ton).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(2), outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.relay_id, id);
        assert_eq!(outcome.order_id, Some(OrderId([2u8; 32])));
        assert!(matches!(outcome.status, RelayStatus::Failed { .. }));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(h.ton.submit_attempts(), 3);
        assert_eq!(h.relay.get_stats().failed, 1);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let h = harness();
        h.ton.fail_next(1, FailureMode::Permanent);
        let message = h.factory.build(ChainId::Evm, ChainId::Ton, refund(3)).await.unwrap();
        let id = h.relay.queue_message(message, ChainId::Ton).await.unwrap();
        assert!(h.relay.wait_idle(Duration::from_secs(1)).await);

        assert_eq!(h.ton.submit_attempts(), 1);
        assert!(matches!(h.relay.relay_status(&id), Some(RelayStatus::Failed { .. })));
    }

    #[tokio::test]
    async fn invalid_message_is_rejected_before_queueing() {
        let h = harness();
        let mut message = h.factory.build(ChainId::Evm, ChainId::Ton, refund(4)).await.unwrap();
        message.timestamp = NOW - 7200;
        let err = h.relay.queue_message(message, ChainId::Ton).await.unwrap_err();
        assert!(matches!(err, RelayerError::Validation(_)));
        assert_eq!(h.relay.get_stats().total_messages, 0);
    }

    #[tokio::test]
    async fn unknown_destination_is_rejected() {
        let h = harness();
        let message = h.factory.build(ChainId::Ton, ChainId::Evm, refund(4)).await.unwrap();
        let err = h.relay.queue_message(message, ChainId::Evm).await.unwrap_err();
        assert!(matches!(err, RelayerError::ChainNotFound { .. }));
    }

    #[tokio::test]
    async fn already_processed_message_is_dropped() {
        let h = harness();
        let message = h.factory.build(ChainId::Evm, ChainId::Ton, refund(5)).await.unwrap();
        h.ledger
            .register_message_once(message.message_hash(), NOW)
            .await
            .unwrap();

        let id = h.relay.queue_message(message, ChainId::Ton).await.unwrap();
        assert!(h.relay.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(h.ton.submit_attempts(), 0);
        assert_eq!(
            h.relay.relay_status(&id),
            Some(RelayStatus::Delivered { tx_ref: None })
        );
    }

    #[tokio::test]
    async fn same_order_messages_keep_queue_order() {
        let h = harness();
        // First message needs two retries; the second must still land after it
        h.ton.fail_next(2, FailureMode::Transient);
        let first = h.factory.build(ChainId::Evm, ChainId::Ton, refund(6)).await.unwrap();
        let second = h
            .factory
            .build(
                ChainId::Evm,
                ChainId::Ton,
                MessagePayload::Control {
                    command: "audit".into(),
                    order_id: Some(OrderId([6u8; 32])),
                },
            )
            .await
            .unwrap();
        let (first_id, second_id) = (first.message_id.clone(), second.message_id.clone());

        h.relay.queue_message(first, ChainId::Ton).await.unwrap();
        h.relay.queue_message(second, ChainId::Ton).await.unwrap();
        assert!(h.relay.wait_idle(Duration::from_secs(2)).await);

        let delivered: Vec<_> = h
            .ton
            .relayed_messages()
            .into_iter()
            .filter_map(|m| m.message_id)
            .collect();
        assert_eq!(delivered, vec![first_id, second_id]);
    }

    #[tokio::test]
    async fn finished_messages_are_retired_into_counters() {
        let h = harness();
        h.ton.fail_next(1, FailureMode::Permanent);
        let mut ids = Vec::new();
        for n in 0..RECENT_OUTCOMES + 4 {
            let order = 20 + (n % 200) as u8;
            let message = h.factory.build(ChainId::Evm, ChainId::Ton, refund(order)).await.unwrap();
            ids.push(h.relay.queue_message(message, ChainId::Ton).await.unwrap());
        }
        assert!(h.relay.wait_idle(Duration::from_secs(5)).await);

        assert!(h.relay.entries.is_empty());
        let stats = h.relay.get_stats();
        assert_eq!(stats.total_messages, RECENT_OUTCOMES + 4);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.delivered, RECENT_OUTCOMES + 3);
        assert_eq!(stats.pending, 0);

        // Only the most recent outcomes stay queryable
        assert_eq!(h.relay.recent.lock().unwrap().len(), RECENT_OUTCOMES);
        let retired = ids.iter().filter(|id| h.relay.relay_status(id).is_none()).count();
        assert_eq!(retired, 4);
    }

    #[tokio::test]
    async fn shutdown_stops_intake() {
        let h = harness();
        let stats = h.relay.shutdown(Duration::from_millis(50)).await;
        assert_eq!(stats.pending, 0);

        let message = h.factory.build(ChainId::Evm, ChainId::Ton, refund(7)).await.unwrap();
        assert!(matches!(
            h.relay.queue_message(message, ChainId::Ton).await,
            Err(RelayerError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn shutdown_leaves_undelivered_messages_queued() {
        let h = harness();
        h.ton.fail_next(1, FailureMode::Transient);
        let slow = Arc::new(MessageRelay::new(
            h.relay.validator.clone(),
            h.relay.chains.clone(),
            RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_secs(10),
                max_delay: Duration::from_secs(10),
                call_timeout: Duration::from_millis(200),
            },
        ));
        let message = h.factory.build(ChainId::Evm, ChainId::Ton, refund(8)).await.unwrap();
        let id = slow.queue_message(message, ChainId::Ton).await.unwrap();

        let stats = slow.shutdown(Duration::from_millis(50)).await;
        assert_eq!(stats.pending, 1);
        assert_eq!(slow.relay_status(&id), Some(RelayStatus::Queued));
    }

    #[tokio::test]
    async fn quorum_needs_two_relayers_and_first_wins() {
        let h = harness();
        let signer = Ed25519Signer::generate();
        let build = |secret_byte: u8, nonce: u64| {
            let secret = Secret::new([secret_byte; 32]);
            let mut message = CrossChainMessage {
                message_id: format!("in-{}", nonce),
                version: crate::relay::PROTOCOL_VERSION,
                timestamp: NOW,
                nonce,
                sender: signer.signer_id(),
                source_chain: ChainId::Ton,
                dest_chain: ChainId::Evm,
                payload: MessagePayload::Fulfillment {
                    order_id: OrderId([9u8; 32]),
                    hashlock: generate_hashlock(&secret),
                    secret,
                    proof_tx_ref: None,
                },
                proof: None,
                relayer_signature: None,
            };
            let sig = signer.sign_digest(message.message_hash().as_bytes()).unwrap();
            message.relayer_signature = Some(hex::encode(sig));
            message.to_wire()
        };

        let winner = build(1, 1);
        assert!(matches!(
            h.relay.accept_attestation(&winner, "r1").await.unwrap(),
            AttestationOutcome::Pending { confirmations: 1 }
        ));
        assert!(matches!(
            h.relay.accept_attestation(&winner, "r2").await.unwrap(),
            AttestationOutcome::Quorum { confirmations: 2, .. }
        ));

        let rival = build(2, 2);
        h.relay.accept_attestation(&rival, "r1").await.unwrap();
        let err = h.relay.accept_attestation(&rival, "r2").await.unwrap_err();
        assert!(err.to_string().contains("conflicting attestation"));

        h.ledger
            .register_message_once(winner.message_hash(), NOW)
            .await
            .unwrap();
        assert!(matches!(
            h.relay.accept_attestation(&winner, "r3").await.unwrap(),
            AttestationOutcome::AlreadyProcessed
        ));
    }
}
