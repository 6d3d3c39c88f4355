//! Security ledger: replay protection, relayer attestations, nonces
//!
//! The only shared mutable security state in the process. Every mutation
//! goes through the ledger's write lock; readers take the read lock and
//! see a consistent view.
//!
//! Invariants:
//! - a message hash enters `processed` at most once and is never removed
//! - the attestation count for a message never decreases while it is live
//! - the first message to reach quorum for a `(order, type)` slot wins

use crate::error::{RelayerError, RelayerResult};
use crate::relay::MessageType;
use crate::state::Journal;
use crate::types::{Hashlock, MessageHash, OrderId};

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Attestation slot for first-quorum-wins conflict resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QuorumSlot {
    pub order_id: Option<OrderId>,
    pub message_type: MessageType,
}

#[derive(Default)]
struct LedgerState {
    processed: HashSet<MessageHash>,
    confirmations: HashMap<MessageHash, HashSet<String>>,
    timestamps: HashMap<MessageHash, u64>,
    nonces: HashMap<String, u64>,
    quorum_slots: HashMap<QuorumSlot, MessageHash>,
    revealed: HashSet<Hashlock>,
}

/// Point-in-time ledger counters
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LedgerStats {
    pub processed_messages: usize,
    pub pending_attestations: usize,
    pub tracked_senders: usize,
    pub revealed_secrets: usize,
}

pub struct SecurityLedger {
    state: RwLock<LedgerState>,
    min_confirmations: usize,
    max_message_age: u64,
    journal: Option<Arc<Journal>>,
}

impl SecurityLedger {
    pub fn new(min_confirmations: usize, max_message_age: u64) -> Self {
        Self {
            state: RwLock::new(LedgerState::default()),
            min_confirmations,
            max_message_age,
            journal: None,
        }
    }

    /// Write processed hashes through to a durable journal
    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Reload processed hashes after a restart
    pub async fn restore(&self) -> RelayerResult<usize> {
        let Some(journal) = &self.journal else {
            return Ok(0);
        };
        let hashes = journal
            .processed_hashes()
            .await
            .map_err(|e| RelayerError::LedgerCorrupted(format!("cannot reload journal: {}", e)))?;

        let mut state = self.state.write().await;
        for (hash, at) in hashes {
            state.processed.insert(hash);
            state.timestamps.insert(hash, at);
        }
        info!("Restored {} processed messages from journal", state.processed.len());
        Ok(state.processed.len())
    }

    /// Atomic check-and-set on the replay set.
    ///
    /// Returns `Ok(false)` without side effects when the hash is already
    /// present. A journal write failure is fatal: continuing would let the
    /// message replay after a restart.
    pub async fn register_message_once(&self, hash: MessageHash, now: u64) -> RelayerResult<bool> {
        let mut state = self.state.write().await;
        if state.processed.contains(&hash) {
            debug!("Message {} already processed", hash);
            return Ok(false);
        }

        if let Some(journal) = &self.journal {
            let inserted = journal.record_processed(&hash, now).await.map_err(|e| {
                error!("Failed to journal processed message {}: {}", hash, e);
                RelayerError::LedgerCorrupted(format!("journal write failed for {}: {}", hash, e))
            })?;
            if !inserted {
                error!("Journal already holds {} but the in-memory ledger does not", hash);
                return Err(RelayerError::LedgerCorrupted(format!(
                    "journal and memory disagree on {}",
                    hash
                )));
            }
        }

        state.processed.insert(hash);
        state.timestamps.insert(hash, now);
        Ok(true)
    }

    pub async fn is_processed(&self, hash: &MessageHash) -> bool {
        self.state.read().await.processed.contains(hash)
    }

    /// Record a relayer attestation; returns the distinct-relayer count
    pub async fn add_confirmation(&self, hash: MessageHash, relayer_id: &str, now: u64) -> usize {
        let mut state = self.state.write().await;
        state.timestamps.entry(hash).or_insert(now);
        let relayers = state.confirmations.entry(hash).or_default();
        if relayers.insert(relayer_id.to_string()) {
            debug!(
                "Message {} confirmed by {} ({} total)",
                hash,
                relayer_id,
                relayers.len()
            );
        }
        relayers.len()
    }

    pub async fn confirmation_count(&self, hash: &MessageHash) -> usize {
        self.state
            .read()
            .await
            .confirmations
            .get(hash)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    pub async fn has_quorum(&self, hash: &MessageHash) -> bool {
        self.confirmation_count(hash).await >= self.min_confirmations
    }

    pub fn min_confirmations(&self) -> usize {
        self.min_confirmations
    }

    /// First-quorum-wins. Returns true if `hash` owns the slot (newly or
    /// already), false if a different message reached quorum first.
    pub async fn claim_quorum_slot(&self, slot: QuorumSlot, hash: MessageHash) -> bool {
        let mut state = self.state.write().await;
        match state.quorum_slots.get(&slot) {
            Some(winner) if *winner != hash => {
                warn!(
                    "Conflicting attestation {} for {:?}; {} already reached quorum",
                    hash, slot, winner
                );
                false
            }
            Some(_) => true,
            None => {
                state.quorum_slots.insert(slot, hash);
                true
            }
        }
    }

    pub async fn last_nonce(&self, sender: &str) -> Option<u64> {
        self.state.read().await.nonces.get(sender).copied()
    }

    /// Advance the sender's high-water nonce; never moves it backwards
    pub async fn record_nonce(&self, sender: &str, nonce: u64) {
        let mut state = self.state.write().await;
        let entry = state.nonces.entry(sender.to_string()).or_insert(nonce);
        if nonce > *entry {
            *entry = nonce;
        }
    }

    /// Mark a hashlock's secret as used. Returns false if it already was.
    pub async fn mark_secret_revealed(&self, hashlock: Hashlock) -> bool {
        self.state.write().await.revealed.insert(hashlock)
    }

    pub async fn is_secret_revealed(&self, hashlock: &Hashlock) -> bool {
        self.state.read().await.revealed.contains(hashlock)
    }

    /// Drop age bookkeeping for messages older than the max age. Processed
    /// hashes stay forever; attestations for expired messages go with their
    /// timestamp since the validator no longer admits them.
    pub async fn evict_expired(&self, now: u64) -> usize {
        let cutoff = now.saturating_sub(self.max_message_age);
        let mut state = self.state.write().await;
        let expired: Vec<MessageHash> = state
            .timestamps
            .iter()
            .filter(|(_, at)| **at < cutoff)
            .map(|(hash, _)| *hash)
            .collect();

        for hash in &expired {
            state.timestamps.remove(hash);
            state.confirmations.remove(hash);
        }

        if !expired.is_empty() {
            debug!("Evicted {} expired ledger entries", expired.len());
        }
        expired.len()
    }

    pub async fn stats(&self) -> LedgerStats {
        let state = self.state.read().await;
        LedgerStats {
            processed_messages: state.processed.len(),
            pending_attestations: state
                .confirmations
                .iter()
                .filter(|(hash, relayers)| {
                    !state.processed.contains(*hash) && relayers.len() < self.min_confirmations
                })
                .count(),
            tracked_senders: state.nonces.len(),
            revealed_secrets: state.revealed.len(),
        }
    }
}
