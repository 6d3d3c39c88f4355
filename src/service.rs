//! Scoped lifecycle for the relayer core
//!
//! `start` spins up one ingestion loop per chain, the event router, the
//! finality checker, the execution engine and periodic health checks.
//! `stop` stops intake, drains the relay for the grace period and then
//! cancels whatever is left.

use crate::chain::{ChainAdapter, ChainManager, FinalityTracker, SimulatedChain};
use crate::config::Settings;
use crate::coordination::ExecutionEngine;
use crate::error::{RelayerError, RelayerResult};
use crate::events::ChainEvent;
use crate::relay::{AttestationOutcome, MessageFactory, MessageRelay, RelayStats, RetryPolicy, WireMessage};
use crate::security::{Ed25519Signer, MessageValidator, SecurityLedger, SigningCapability};
use crate::state::{Journal, StateSync};
use crate::types::{Clock, SystemClock};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct RelayerService {
    settings: Settings,
    clock: Arc<dyn Clock>,
    journal: Option<Arc<Journal>>,
    ledger: Arc<SecurityLedger>,
    validator: Arc<MessageValidator>,
    chains: Arc<ChainManager>,
    relay: Arc<MessageRelay>,
    factory: Arc<MessageFactory>,
    state: Arc<StateSync>,
    engine: Arc<ExecutionEngine>,
    signer_id: String,
    started_at: Instant,
    started_at_utc: DateTime<Utc>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Adapters for every enabled chain whose kind is built in
pub fn builtin_adapters(settings: &Settings) -> RelayerResult<Vec<Arc<dyn ChainAdapter>>> {
    let mut adapters: Vec<Arc<dyn ChainAdapter>> = Vec::new();
    for (name, chain) in settings.enabled_chains() {
        match chain.adapter.as_str() {
            "simulated" => {
                info!("Chain {} ({}) uses the simulated adapter", name, chain.chain);
                adapters.push(Arc::new(SimulatedChain::new(chain.chain)));
            }
            other => {
                return Err(RelayerError::Config(format!(
                    "Chain {} uses adapter kind '{}' which is not built in",
                    name, other
                )))
            }
        }
    }
    Ok(adapters)
}

impl RelayerService {
    /// Build the core for `settings` with the built-in adapters
    pub async fn new(settings: Settings) -> RelayerResult<Self> {
        let adapters = builtin_adapters(&settings)?;
        Self::with_adapters(settings, Arc::new(SystemClock), adapters).await
    }

    /// Build the core around externally supplied adapters
    pub async fn with_adapters(
        settings: Settings,
        clock: Arc<dyn Clock>,
        adapters: Vec<Arc<dyn ChainAdapter>>,
    ) -> RelayerResult<Self> {
        let journal = match &settings.database {
            Some(db) => Some(Arc::new(Journal::connect(&db.url, db.max_connections).await?)),
            None => {
                info!("No database configured; state is kept in memory only");
                None
            }
        };

        let mut ledger = SecurityLedger::new(
            settings.security.min_confirmations,
            settings.security.max_message_age_secs,
        );
        if let Some(journal) = &journal {
            ledger = ledger.with_journal(journal.clone());
        }
        let ledger = Arc::new(ledger);
        let validator = Arc::new(MessageValidator::new(
            settings.security.clone(),
            clock.clone(),
            ledger.clone(),
        ));

        let policy = RetryPolicy::from_config(&settings.relayer);
        let chains = Arc::new(ChainManager::new(journal.clone(), settings.relayer.poll_interval()));
        for adapter in adapters {
            let chain = adapter.chain();
            let required = settings
                .get_chain(chain)
                .map(|c| c.required_confirmations)
                .ok_or_else(|| RelayerError::Config(format!("No configuration for chain {}", chain)))?;
            let finality = FinalityTracker::new(
                chain,
                required,
                settings.relayer.finality_max_retries,
                policy.call_timeout,
                adapter.clone(),
            );
            chains.register(adapter, Arc::new(finality));
        }

        let signer: Arc<dyn SigningCapability> = match &settings.relayer.signing_key {
            Some(key) => Arc::new(Ed25519Signer::from_secret_hex(key)?),
            None => {
                warn!("No signing key configured; using an ephemeral key");
                Arc::new(Ed25519Signer::generate())
            }
        };
        let signer_id = signer.signer_id();
        let factory = Arc::new(MessageFactory::new(signer, clock.clone()));

        let relay = Arc::new(MessageRelay::new(validator.clone(), chains.clone(), policy));
        let mut state = StateSync::new(chains.clone(), clock.clone());
        if let Some(journal) = &journal {
            state = state.with_journal(journal.clone());
        }
        let state = Arc::new(state);

        let engine = Arc::new(ExecutionEngine::new(
            state.clone(),
            chains.clone(),
            relay.clone(),
            factory.clone(),
            validator.clone(),
            policy,
            settings.matching.clone(),
        ));

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            settings,
            clock,
            journal,
            ledger,
            validator,
            chains,
            relay,
            factory,
            state,
            engine,
            signer_id,
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Restore persisted state and spawn every loop
    pub async fn start(&self) -> RelayerResult<()> {
        if self.journal.is_some() {
            let hashes = self.ledger.restore().await?;
            let orders = self.state.restore().await?;
            info!("Restored {} processed messages and {} orders", hashes, orders);
        }
        if let Some(nonce) = self.ledger.last_nonce(&self.signer_id).await {
            self.factory.resume_after(nonce).await;
        }

        let mut tasks = self.tasks.lock().await;

        let (events_tx, events_rx) = mpsc::channel(self.settings.relayer.event_channel_capacity);
        tasks.extend(self.chains.start_listeners(events_tx).await);
        tasks.push(self.spawn_event_router(events_rx));
        tasks.push(self.spawn_finality_loop());

        let engine = self.engine.clone();
        let shutdown = self.shutdown.subscribe();
        let sweep_every = self.settings.relayer.poll_interval();
        tasks.push(tokio::spawn(engine.run(shutdown, sweep_every)));

        tasks.push(self.spawn_health_loop());

        info!(
            "Relayer {} started on {} chains",
            self.settings.relayer.instance_id,
            self.chains.connected_chains().len()
        );
        Ok(())
    }

    fn spawn_event_router(&self, mut events: mpsc::Receiver<ChainEvent>) -> JoinHandle<()> {
        let state = self.state.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        match state.observe_event(event).await {
                            Ok(Some(record)) => debug!("Order {} now {}", record.order_id(), record.state),
                            Ok(None) => {}
                            Err(e) if e.is_invariant_violation() => warn!("Event rejected: {}", e),
                            Err(e) => error!("Event handling failed: {}", e),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Event router stopped");
        })
    }

    fn spawn_finality_loop(&self) -> JoinHandle<()> {
        let state = self.state.clone();
        let every = Duration::from_millis(self.settings.relayer.finality_interval_ms);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let applied = state.poll_finality().await;
                        if !applied.is_empty() {
                            debug!("Finality check applied {} events", applied.len());
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    fn spawn_health_loop(&self) -> JoinHandle<()> {
        let chains = self.chains.clone();
        let journal = self.journal.clone();
        let ledger = self.ledger.clone();
        let clock = self.clock.clone();
        let every = Duration::from_secs(self.settings.relayer.health_check_interval_secs);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }

                let mut healthy = true;
                for (chain, head) in chains.health_check().await {
                    if head.is_none() {
                        warn!("Chain {} health check failed", chain);
                        healthy = false;
                    }
                }
                if let Some(journal) = &journal {
                    if let Err(e) = journal.health_check().await {
                        warn!("Database health check failed: {}", e);
                        healthy = false;
                    }
                }
                let evicted = ledger.evict_expired(clock.now()).await;
                if evicted > 0 {
                    debug!("Evicted {} expired ledger entries", evicted);
                }

                if healthy {
                    crate::metrics::record_health_check();
                } else {
                    crate::metrics::record_health_check_failure();
                }
            }
        })
    }

    /// Record an inbound attestation and act on the message once it
    /// reaches quorum. A message is acted upon at most once.
    pub async fn submit_attestation(&self, wire: &WireMessage, relayer_id: &str) -> RelayerResult<AttestationOutcome> {
        let outcome = self.relay.accept_attestation(wire, relayer_id).await?;
        if let AttestationOutcome::Quorum { message, confirmations } = &outcome {
            if !self
                .ledger
                .register_message_once(message.message_hash(), self.clock.now())
                .await?
            {
                return Ok(AttestationOutcome::AlreadyProcessed);
            }
            info!(
                "Acting on {} message {} with {} attestations",
                message.message_type(),
                message.message_id,
                confirmations
            );
            self.engine.handle_relayed_message(message).await?;
        }
        Ok(outcome)
    }

    /// Stop every loop. Deliveries get `shutdown_grace` to finish.
    pub async fn stop(&self) -> RelayStats {
        info!("Stopping relayer {}", self.settings.relayer.instance_id);
        let stats = self.relay.shutdown(self.settings.relayer.shutdown_grace()).await;
        let _ = self.shutdown.send(true);
        self.chains.stop();

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if tokio::time::timeout(Duration::from_millis(100), task).await.is_err() {
                debug!("Background task did not stop in time; it was aborted");
            }
        }
        stats
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at_utc
    }

    pub fn journal(&self) -> Option<&Arc<Journal>> {
        self.journal.as_ref()
    }

    pub fn ledger(&self) -> &Arc<SecurityLedger> {
        &self.ledger
    }

    pub fn validator(&self) -> &Arc<MessageValidator> {
        &self.validator
    }

    pub fn chains(&self) -> &Arc<ChainManager> {
        &self.chains
    }

    pub fn relay(&self) -> &Arc<MessageRelay> {
        &self.relay
    }

    pub fn state(&self) -> &Arc<StateSync> {
        &self.state
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }
}
