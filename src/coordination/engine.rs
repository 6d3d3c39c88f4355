//! Order execution engine
//!
//! Drives a swap from signed intent to a terminal state:
//! - same-chain orders settle against a complementary order in one
//!   transaction
//! - cross-chain orders lock the maker's funds on the source chain, tell
//!   the destination chain through the relay, and complete once the
//!   secret is revealed
//! - escrowed orders that outlive their timelock are expired and refunded

use super::orderbook::{BookCounts, BookStatus, OrderBook, SignedOrder};
use crate::chain::{ChainManager, PreparedTransaction};
use crate::config::MatchingConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::relay::{
    CrossChainMessage, MessageFactory, MessagePayload, MessageRelay, MessageType, RelayOutcome, RelayStatus,
    RetryPolicy,
};
use crate::security::{verify_secret, verify_signature, MessageValidator, SigningCapability};
use crate::state::{OrderRecord, StateSync, SwapState};
use crate::types::{
    compute_order_id, Amount, Asset, AtomicSwapSecurityParams, ChainId, CrossChainOrder, DestinationBinding,
    Direction, Hashlock, OrderId, Secret, TxRef,
};

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Maker input for `construct_order`
#[derive(Debug, Clone)]
pub struct OrderParams {
    pub maker: String,
    /// Defaults to the maker
    pub receiver: Option<String>,
    pub source_asset: Asset,
    pub dest_asset: Asset,
    pub source_amount: Amount,
    pub dest_amount: Amount,
    /// Absolute; defaults to the timelock for cross-chain orders and to
    /// now + the minimum timelock otherwise
    pub deadline: Option<u64>,
    /// Recipient and asset on the other chain; makes the order cross-chain
    pub destination: Option<DestinationBinding>,
    /// Required for cross-chain orders
    pub hashlock: Option<Hashlock>,
    /// Seconds from now; defaults to the minimum timelock
    pub timelock_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Completed,
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub order_id: OrderId,
    pub status: ExecutionStatus,
    pub matched_order_id: Option<OrderId>,
    /// Settlement or source escrow transaction
    pub execution_tx_hash: Option<TxRef>,
    /// Hash of the message relayed to the destination chain
    pub cross_chain_tx_hash: Option<String>,
    pub error: Option<String>,
}

impl ExecutionResult {
    fn new(order_id: OrderId, status: ExecutionStatus) -> Self {
        Self {
            order_id,
            status,
            matched_order_id: None,
            execution_tx_hash: None,
            cross_chain_tx_hash: None,
            error: None,
        }
    }

    fn failed(order_id: OrderId, error: &RelayerError) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(order_id, ExecutionStatus::Failed)
        }
    }
}

/// Cross-chain execution waiting for its secret
#[derive(Debug, Clone, Serialize)]
pub struct PendingExecution {
    pub order_id: OrderId,
    pub escrow_tx: TxRef,
    pub relay_id: Option<Uuid>,
    pub started_at: u64,
}

/// Result of `cancel_order_execution`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelOutcome {
    pub order_id: OrderId,
    pub state: SwapState,
    /// Relay entry carrying the refund instruction, if one was needed
    pub refund_relay_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionStats {
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub cancelled: usize,
    pub book: BookCounts,
}

pub struct ExecutionEngine {
    book: OrderBook,
    state: Arc<StateSync>,
    chains: Arc<ChainManager>,
    relay: Arc<MessageRelay>,
    factory: Arc<MessageFactory>,
    validator: Arc<MessageValidator>,
    policy: RetryPolicy,
    matching: MatchingConfig,
    pending: DashMap<OrderId, PendingExecution>,
    /// Orders with a refund in flight
    refunds: DashMap<OrderId, Uuid>,
    /// Keeps nonce order equal to queue order for outbound messages
    outbound: Mutex<()>,
}

impl ExecutionEngine {
    pub fn new(
        state: Arc<StateSync>,
        chains: Arc<ChainManager>,
        relay: Arc<MessageRelay>,
        factory: Arc<MessageFactory>,
        validator: Arc<MessageValidator>,
        policy: RetryPolicy,
        matching: MatchingConfig,
    ) -> Self {
        Self {
            book: OrderBook::new(),
            state,
            chains,
            relay,
            factory,
            validator,
            policy,
            matching,
            pending: DashMap::new(),
            refunds: DashMap::new(),
            outbound: Mutex::new(()),
        }
    }

    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    fn now(&self) -> u64 {
        self.validator.clock().now()
    }

    /// Build an order with a fresh salt and its deterministic id
    pub fn construct_order(&self, params: OrderParams) -> RelayerResult<CrossChainOrder> {
        let now = self.now();
        let mut errors = Vec::new();
        if params.source_amount.is_zero() {
            errors.push("source amount must be positive".to_string());
        }
        if params.dest_amount.is_zero() {
            errors.push("destination amount must be positive".to_string());
        }
        if params.maker.is_empty() {
            errors.push("maker is required".to_string());
        }

        let source_chain = params.source_asset.chain;
        let dest_chain = params
            .destination
            .as_ref()
            .map(|d| d.asset.chain)
            .unwrap_or(params.dest_asset.chain);
        let direction = Direction::derive(source_chain, dest_chain);

        let security = if direction.is_cross_chain() {
            let timelock = now.saturating_add(
                params
                    .timelock_secs
                    .unwrap_or(self.validator.config().min_timelock_secs),
            );
            if let Err(e) = self.validator.validate_timelock(timelock, now) {
                errors.push(e);
            }
            match params.hashlock {
                Some(hashlock) => Some(AtomicSwapSecurityParams {
                    hashlock,
                    timelock,
                    created_at: now,
                }),
                None => {
                    errors.push("cross-chain order requires a hashlock".to_string());
                    None
                }
            }
        } else {
            None
        };

        let deadline = params.deadline.unwrap_or_else(|| {
            security
                .as_ref()
                .map(|s| s.timelock)
                .unwrap_or(now + self.validator.config().min_timelock_secs)
        });
        if deadline <= now {
            errors.push(format!("deadline {} is not in the future", deadline));
        }

        if !errors.is_empty() {
            return Err(RelayerError::Validation(errors));
        }

        let mut order = CrossChainOrder {
            order_id: OrderId([0u8; 32]),
            salt: Uuid::new_v4().to_string(),
            receiver: params.receiver.unwrap_or_else(|| params.maker.clone()),
            maker: params.maker,
            source_asset: params.source_asset,
            dest_asset: params.dest_asset,
            source_amount: params.source_amount,
            dest_amount: params.dest_amount,
            deadline,
            direction,
            destination: params.destination,
            security,
            created_at: now,
        };
        order.order_id = compute_order_id(&order);
        debug!("Constructed {:?} order {}", order.direction, order.order_id);
        Ok(order)
    }

    /// Sign the order id with an external signer; no key material is kept
    pub fn sign_order(&self, order: CrossChainOrder, signer: &dyn SigningCapability) -> RelayerResult<SignedOrder> {
        if compute_order_id(&order) != order.order_id {
            return Err(RelayerError::validation("order id does not match order fields"));
        }
        let signature = signer.sign_digest(order.order_id.as_bytes())?;
        Ok(SignedOrder {
            order,
            signer_id: signer.signer_id(),
            signature: hex::encode(signature),
        })
    }

    pub fn verify_order_signature(&self, signed: &SignedOrder) -> bool {
        let Ok(signature) = hex::decode(&signed.signature) else {
            return false;
        };
        compute_order_id(&signed.order) == signed.order.order_id
            && verify_signature(&signed.signer_id, signed.order.order_id.as_bytes(), &signature)
    }

    /// Register a signed order: visible to matching and tracked at `PENDING`
    pub async fn add_to_order_book(&self, signed: SignedOrder) -> RelayerResult<OrderId> {
        if !self.verify_order_signature(&signed) {
            return Err(RelayerError::Signing(format!(
                "signature on order {} does not verify",
                signed.order.order_id
            )));
        }

        let order = signed.order.clone();
        self.book.insert(signed).await?;
        if let Err(e) = self.state.create_order(order.clone()).await {
            self.book.remove(&order.order_id).await;
            return Err(e);
        }

        info!(
            "Order {} added to book: {} {} -> {} {}",
            order.order_id, order.source_amount, order.source_asset, order.dest_amount, order.dest_asset
        );
        Ok(order.order_id)
    }

    /// Signed same-chain complements within the slippage tolerance,
    /// earliest first. Cross-chain orders have no local complements.
    pub async fn find_matching_orders(&self, order: &CrossChainOrder) -> Vec<CrossChainOrder> {
        if order.direction != Direction::SameChain {
            return Vec::new();
        }
        self.book
            .complements(order, self.matching.max_slippage_bps, self.now())
            .await
    }

    pub async fn execute_order(&self, order_id: &OrderId) -> RelayerResult<ExecutionResult> {
        let entry = self.book.get(order_id).await.ok_or_else(|| RelayerError::OrderNotFound {
            order_id: order_id.to_string(),
        })?;
        if entry.status != BookStatus::Signed {
            return Err(RelayerError::NotExecutable {
                order_id: order_id.to_string(),
                reason: format!("order is {:?}", entry.status),
            });
        }
        let order = entry.signed.order;
        if order.deadline < self.now() {
            return Err(RelayerError::NotExecutable {
                order_id: order_id.to_string(),
                reason: "deadline has passed".to_string(),
            });
        }

        let result = if order.direction.is_cross_chain() {
            self.execute_cross_chain(&order).await?
        } else {
            self.execute_same_chain(&order).await?
        };

        let outcome = match result.status {
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Failed => "failed",
        };
        crate::metrics::record_execution(outcome);
        Ok(result)
    }

    async fn execute_same_chain(&self, order: &CrossChainOrder) -> RelayerResult<ExecutionResult> {
        let order_id = order.order_id;
        let Some(matched) = self.find_matching_orders(order).await.into_iter().next() else {
            debug!("No complement for order {}; leaving it in the book", order_id);
            return Ok(ExecutionResult::new(order_id, ExecutionStatus::Pending));
        };
        let matched_id = matched.order_id;

        self.book.claim_pair(&order_id, &matched_id).await?;
        for id in [&order_id, &matched_id] {
            self.book.set_status(id, BookStatus::Executing).await?;
        }
        info!("Settling order {} against {}", order_id, matched_id);

        let adapter = self.chains.adapter(order.source_chain())?;
        let settle = PreparedTransaction::Settle {
            maker_order: order_id,
            taker_order: matched_id,
        };
        let submitted = self
            .policy
            .retry("settle", || {
                let adapter = adapter.clone();
                let tx = settle.clone();
                async move { adapter.submit(tx).await }
            })
            .await;

        let tx_ref = match submitted {
            Ok(tx_ref) => tx_ref,
            Err(e) => {
                error!("Settlement of {} / {} failed: {}", order_id, matched_id, e);
                for id in [&order_id, &matched_id] {
                    self.book.set_status(id, BookStatus::Failed).await?;
                }
                return Ok(ExecutionResult {
                    matched_order_id: Some(matched_id),
                    ..ExecutionResult::failed(order_id, &e)
                });
            }
        };

        let reason = format!("settled in {}", tx_ref);
        for id in [&order_id, &matched_id] {
            self.state.advance_to(id, SwapState::Completed, &reason).await?;
            self.book.set_status(id, BookStatus::Completed).await?;
        }
        info!("Orders {} and {} settled in {}", order_id, matched_id, tx_ref);

        Ok(ExecutionResult {
            matched_order_id: Some(matched_id),
            execution_tx_hash: Some(tx_ref),
            ..ExecutionResult::new(order_id, ExecutionStatus::Completed)
        })
    }

    async fn execute_cross_chain(&self, order: &CrossChainOrder) -> RelayerResult<ExecutionResult> {
        let order_id = order.order_id;
        let security = order.security.clone().ok_or_else(|| RelayerError::NotExecutable {
            order_id: order_id.to_string(),
            reason: "cross-chain order without hashlock".to_string(),
        })?;
        if !self
            .book
            .transition(&order_id, BookStatus::Signed, BookStatus::Executing)
            .await
        {
            return Err(RelayerError::NotExecutable {
                order_id: order_id.to_string(),
                reason: "order is already executing".to_string(),
            });
        }

        let source = order.source_chain();
        let dest = order.dest_chain();
        let adapter = self.chains.adapter(source)?;
        let create = PreparedTransaction::CreateEscrow {
            order_id,
            asset: order.source_asset.clone(),
            amount: order.source_amount,
            recipient: order.receiver.clone(),
            hashlock: security.hashlock,
            timelock: security.timelock,
        };
        let submitted = self
            .policy
            .retry("create escrow", || {
                let adapter = adapter.clone();
                let tx = create.clone();
                async move { adapter.submit(tx).await }
            })
            .await;

        let escrow_tx = match submitted {
            Ok(tx_ref) => tx_ref,
            Err(e) => {
                error!("Source escrow for {} on {} failed: {}", order_id, source, e);
                self.book.set_status(&order_id, BookStatus::Failed).await?;
                return Ok(ExecutionResult::failed(order_id, &e));
            }
        };

        // From here on funds are locked: every exit keeps the order on a
        // path to refund
        let reason = format!("source escrow on {} in {}", source, escrow_tx);
        match self
            .state
            .record_escrow(&order_id, source, escrow_tx.as_str(), &reason)
            .await
        {
            Ok(record) if record.state.is_escrowed() || record.state == SwapState::Expired => {}
            Ok(record) => {
                error!(
                    "Order {} is {} but its escrow {} is locked on {}; operator attention needed",
                    order_id, record.state, escrow_tx, source
                );
                return self
                    .escrow_unannounced(order_id, escrow_tx, format!("order is {}", record.state))
                    .await;
            }
            Err(e) => {
                error!("Could not record escrow {} for {}: {}", escrow_tx, order_id, e);
                return self.escrow_unannounced(order_id, escrow_tx, e.to_string()).await;
            }
        }

        let recipient = order
            .destination
            .as_ref()
            .map(|d| d.recipient.clone())
            .unwrap_or_else(|| order.receiver.clone());
        let payload = MessagePayload::EscrowCreated {
            order_id,
            recipient,
            amount: order.dest_amount,
            hashlock: security.hashlock,
            timelock: security.timelock,
            created_at: Some(security.created_at),
            source_tx_ref: Some(escrow_tx.clone()),
        };

        let (relay_id, message) = match self.send(source, dest, payload).await {
            Ok(sent) => sent,
            Err(e) => {
                error!(
                    "Could not relay escrow of {} to {}: {}; refund follows at timelock {}",
                    order_id, dest, e, security.timelock
                );
                return self.escrow_unannounced(order_id, escrow_tx, e.to_string()).await;
            }
        };

        self.pending.insert(
            order_id,
            PendingExecution {
                order_id,
                escrow_tx: escrow_tx.clone(),
                relay_id: Some(relay_id),
                started_at: self.now(),
            },
        );
        info!("Order {} escrowed on {} in {}; awaiting secret", order_id, source, escrow_tx);

        Ok(ExecutionResult {
            execution_tx_hash: Some(escrow_tx),
            cross_chain_tx_hash: Some(message.message_hash().to_string()),
            ..ExecutionResult::new(order_id, ExecutionStatus::Pending)
        })
    }

    /// The source escrow exists but the swap cannot go on. The order keeps
    /// its escrow state, so the expiry sweep refunds it at the timelock.
    async fn escrow_unannounced(
        &self,
        order_id: OrderId,
        escrow_tx: TxRef,
        reason: String,
    ) -> RelayerResult<ExecutionResult> {
        self.book.set_status(&order_id, BookStatus::Failed).await?;
        Ok(ExecutionResult {
            execution_tx_hash: Some(escrow_tx),
            error: Some(reason),
            ..ExecutionResult::new(order_id, ExecutionStatus::Failed)
        })
    }

    /// Build, sign and queue one outbound message
    async fn send(
        &self,
        source: ChainId,
        dest: ChainId,
        payload: MessagePayload,
    ) -> RelayerResult<(Uuid, CrossChainMessage)> {
        let _order = self.outbound.lock().await;
        let message = self.factory.build(source, dest, payload).await?;
        let relay_id = self.relay.queue_message(message.clone(), dest).await?;
        Ok((relay_id, message))
    }

    /// Complete a cross-chain order with its revealed secret.
    ///
    /// A wrong secret is `InvalidSecret` and changes nothing. A secret
    /// whose hashlock was already used is `SecretReplay`.
    pub async fn handle_cross_chain_fulfillment(
        &self,
        order_id: &OrderId,
        secret: &Secret,
        proof_tx: Option<TxRef>,
    ) -> RelayerResult<OrderRecord> {
        let record = self.state.get_order(order_id).await.ok_or_else(|| RelayerError::OrderNotFound {
            order_id: order_id.to_string(),
        })?;
        let hashlock = record.order.hashlock().ok_or_else(|| RelayerError::NotExecutable {
            order_id: order_id.to_string(),
            reason: "order has no hashlock".to_string(),
        })?;

        if !verify_secret(secret, &hashlock) {
            warn!("Rejected secret for order {}: hashlock mismatch", order_id);
            return Err(RelayerError::InvalidSecret {
                order_id: order_id.to_string(),
            });
        }
        if !record.state.is_escrowed() {
            return Err(RelayerError::NotExecutable {
                order_id: order_id.to_string(),
                reason: format!("order is {}", record.state),
            });
        }
        if !self.validator.ledger().mark_secret_revealed(hashlock).await {
            error!("Secret for hashlock {} presented twice", hashlock);
            return Err(RelayerError::SecretReplay {
                hashlock: hashlock.to_string(),
            });
        }

        let reason = match &proof_tx {
            Some(tx) => format!("secret revealed in {}", tx),
            None => "secret revealed".to_string(),
        };
        if let Some(tx) = proof_tx {
            self.state.record_fulfillment_proof(order_id, tx).await?;
        }
        let record = self
            .state
            .advance_to(order_id, SwapState::Completed, &reason)
            .await?;

        self.pending.remove(order_id);
        if self.book.status(order_id).await.is_some() {
            self.book.set_status(order_id, BookStatus::Completed).await?;
        }
        crate::metrics::record_execution("completed");
        info!("Order {} completed", order_id);
        Ok(record)
    }

    /// Cancel an order.
    ///
    /// Without an escrow the order is simply `CANCELLED`. An escrowed order
    /// may only be cancelled once its timelock has elapsed and no secret
    /// was revealed; it moves to `EXPIRED` and a refund is relayed to the
    /// source chain. `REFUNDED` follows once the refund is delivered.
    pub async fn cancel_order_execution(&self, order_id: &OrderId) -> RelayerResult<CancelOutcome> {
        let record = self.state.get_order(order_id).await.ok_or_else(|| RelayerError::OrderNotFound {
            order_id: order_id.to_string(),
        })?;
        let not_cancellable = |reason: String| RelayerError::NotCancellable {
            order_id: order_id.to_string(),
            reason,
        };

        if record.state.is_terminal() {
            return Err(not_cancellable(format!("order is already {}", record.state)));
        }
        if record.state == SwapState::Fulfilled || record.fulfillment_tx.is_some() {
            return Err(not_cancellable("secret already revealed".to_string()));
        }

        let source_escrowed = record.escrow_ref(record.order.source_chain()).is_some();
        if record.state == SwapState::Pending && !source_escrowed {
            // The book claim keeps cancel and execute from both winning
            let previous = self.claim_for_cancel(order_id).await.map_err(|status| {
                not_cancellable(format!("order is {:?} in the book", status))
            })?;
            if let Err(e) = self
                .state
                .update_order_state(order_id, SwapState::Cancelled, "cancelled before escrow")
                .await
            {
                if let Some(previous) = previous {
                    self.book
                        .transition(order_id, BookStatus::Cancelled, previous)
                        .await;
                }
                return Err(e);
            }
            crate::metrics::record_execution("cancelled");
            return Ok(CancelOutcome {
                order_id: *order_id,
                state: SwapState::Cancelled,
                refund_relay_id: None,
            });
        }

        let now = self.now();
        let expiry = record.order.expiry();
        if now < expiry {
            return Err(not_cancellable(format!(
                "timelock has not elapsed ({}s left)",
                expiry - now
            )));
        }
        if self.refunds.contains_key(order_id) {
            return Err(not_cancellable("refund already in flight".to_string()));
        }

        if record.state != SwapState::Expired {
            self.state
                .update_order_state(order_id, SwapState::Expired, &format!("timelock {} elapsed", expiry))
                .await?;
        }
        self.pending.remove(order_id);
        self.settle_book_cancelled(order_id).await;

        let refund_relay_id = match record.order.hashlock() {
            Some(hashlock) => {
                let payload = MessagePayload::Refund {
                    order_id: *order_id,
                    recipient: record.order.maker.clone(),
                    amount: record.order.source_amount,
                    hashlock,
                };
                let (relay_id, _) = self
                    .send(record.order.dest_chain(), record.order.source_chain(), payload)
                    .await?;
                self.refunds.insert(*order_id, relay_id);
                info!(
                    "Order {} expired; refund queued to {} as {}",
                    order_id,
                    record.order.source_chain(),
                    relay_id
                );
                Some(relay_id)
            }
            None => {
                warn!("Order {} expired without a hashlock; nothing to refund", order_id);
                None
            }
        };

        crate::metrics::record_execution("cancelled");
        Ok(CancelOutcome {
            order_id: *order_id,
            state: SwapState::Expired,
            refund_relay_id,
        })
    }

    /// Take the book entry from `Signed` or `Failed` to `Cancelled` and
    /// return the status it had. Orders without a book entry have nothing
    /// to claim. Any other status is returned as the error.
    async fn claim_for_cancel(&self, order_id: &OrderId) -> Result<Option<BookStatus>, BookStatus> {
        let Some(status) = self.book.status(order_id).await else {
            return Ok(None);
        };
        for from in [BookStatus::Signed, BookStatus::Failed] {
            if self.book.transition(order_id, from, BookStatus::Cancelled).await {
                return Ok(Some(from));
            }
        }
        Err(self.book.status(order_id).await.unwrap_or(status))
    }

    async fn settle_book_cancelled(&self, order_id: &OrderId) {
        if let Some(status) = self.book.status(order_id).await {
            if !matches!(status, BookStatus::Completed | BookStatus::Cancelled) {
                let _ = self.book.set_status(order_id, BookStatus::Cancelled).await;
            }
        }
    }

    /// Expire every unfulfilled order past its timelock. Returns how many
    /// were cancelled or had a refund queued.
    pub async fn expire_overdue(&self) -> usize {
        let now = self.now();
        let mut expired = 0;
        for record in self.state.snapshot().await {
            let order_id = record.order_id();
            if record.state.is_terminal()
                || record.state == SwapState::Fulfilled
                || record.fulfillment_tx.is_some()
                || now < record.order.expiry()
                || self.refunds.contains_key(&order_id)
            {
                continue;
            }
            match self.cancel_order_execution(&order_id).await {
                Ok(outcome) => {
                    debug!("Expiry sweep moved {} to {}", order_id, outcome.state);
                    expired += 1;
                }
                Err(e) => warn!("Expiry sweep could not cancel {}: {}", order_id, e),
            }
        }
        if expired > 0 {
            info!("Expiry sweep handled {} orders", expired);
        }
        expired
    }

    /// React to a finished delivery
    pub async fn on_relay_outcome(&self, outcome: &RelayOutcome) {
        let Some(order_id) = outcome.order_id else {
            return;
        };

        match (outcome.message_type, &outcome.status) {
            (MessageType::Refund, RelayStatus::Delivered { tx_ref }) => {
                self.refunds.remove(&order_id);
                let reason = match tx_ref {
                    Some(tx) => format!("refund delivered in {}", tx),
                    None => "refund already delivered".to_string(),
                };
                if let Err(e) = self.state.advance_to(&order_id, SwapState::Refunded, &reason).await {
                    error!("Could not mark {} refunded: {}", order_id, e);
                }
            }
            (MessageType::Refund, RelayStatus::Failed { reason }) => {
                self.refunds.remove(&order_id);
                error!(
                    "Refund for order {} failed: {}; the expiry sweep will retry",
                    order_id, reason
                );
            }
            (MessageType::EscrowCreated, RelayStatus::Failed { reason }) => {
                let expired = self
                    .state
                    .get_order(&order_id)
                    .await
                    .map(|r| self.now() >= r.order.expiry())
                    .unwrap_or(false);
                if expired {
                    warn!("Escrow relay for {} failed after expiry ({}); refunding", order_id, reason);
                    if let Err(e) = self.cancel_order_execution(&order_id).await {
                        error!("Refund of {} failed: {}", order_id, e);
                    }
                } else {
                    warn!(
                        "Escrow relay for {} failed ({}); refund follows once the timelock passes",
                        order_id, reason
                    );
                }
            }
            (message_type, status) => {
                debug!("Relay outcome for {}: {} {:?}", order_id, message_type, status);
            }
        }
    }

    /// Act on an inbound message that reached quorum and was registered
    pub async fn handle_relayed_message(&self, message: &CrossChainMessage) -> RelayerResult<()> {
        match &message.payload {
            MessagePayload::Fulfillment {
                order_id,
                secret,
                proof_tx_ref,
                ..
            } => {
                self.handle_cross_chain_fulfillment(order_id, secret, proof_tx_ref.clone())
                    .await?;
            }
            MessagePayload::EscrowCreated {
                order_id,
                source_tx_ref,
                ..
            } => {
                let chain = message.source_chain;
                let escrow_ref = match source_tx_ref {
                    Some(tx) => tx.to_string(),
                    None => format!("relayed:{}", message.message_id),
                };
                let reason = format!("escrow on {} in {}", chain, escrow_ref);
                let record = self.state.get_order(order_id).await.ok_or_else(|| RelayerError::OrderNotFound {
                    order_id: order_id.to_string(),
                })?;
                if chain == record.order.source_chain() {
                    // Someone else locked the source side; never escrow it twice
                    self.book
                        .transition(order_id, BookStatus::Signed, BookStatus::Executing)
                        .await;
                }
                let record = self.state.record_escrow(order_id, chain, &escrow_ref, &reason).await?;
                debug!("Order {} is {} after relayed escrow on {}", order_id, record.state, chain);
            }
            MessagePayload::Refund { order_id, .. } => {
                info!("Counterparty refund reported for order {}", order_id);
            }
            MessagePayload::Control { command, .. } => {
                info!("Control message from {}: {}", message.sender, command);
            }
        }
        Ok(())
    }

    pub fn pending_executions(&self) -> Vec<PendingExecution> {
        let mut pending: Vec<PendingExecution> = self.pending.iter().map(|e| e.value().clone()).collect();
        pending.sort_by_key(|p| (p.started_at, p.order_id));
        pending
    }

    pub async fn get_execution_stats(&self) -> ExecutionStats {
        let book = self.book.counts().await;
        ExecutionStats {
            completed: book.completed,
            failed: book.failed,
            pending: self.pending.len(),
            cancelled: book.cancelled,
            book,
        }
    }

    /// React to relay outcomes and sweep expired orders until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>, sweep_every: Duration) {
        let mut outcomes = self.relay.subscribe();
        let mut sweep = interval(sweep_every);
        info!("Execution engine started");

        loop {
            tokio::select! {
                outcome = outcomes.recv() => match outcome {
                    Ok(outcome) => self.on_relay_outcome(&outcome).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Execution engine missed {} relay outcomes", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = sweep.tick() => {
                    self.expire_overdue().await;
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("Execution engine stopped");
    }
}
