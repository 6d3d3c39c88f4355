//! Nonce management for outbound messages
//!
//! Handles:
//! - Monotonic per-sender nonce allocation
//! - Seeding from the last nonce a sender was seen with

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Per-sender nonce state
struct SenderNonceState {
    /// Next nonce to hand out
    current: u64,
}

/// Allocates nonces across senders
#[derive(Default)]
pub struct NonceManager {
    senders: DashMap<String, Arc<Mutex<SenderNonceState>>>,
}

impl NonceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shard locks are released before the per-sender lock is awaited
    fn slot(&self, sender: &str, initial: u64) -> Arc<Mutex<SenderNonceState>> {
        self.senders
            .entry(sender.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SenderNonceState { current: initial })))
            .clone()
    }

    /// Start a sender after `last_used`; never moves a sender backwards
    pub async fn seed(&self, sender: &str, last_used: u64) {
        let next = last_used.saturating_add(1);
        let slot = self.slot(sender, next);
        let mut state = slot.lock().await;
        if state.current < next {
            state.current = next;
        }
        debug!("Seeded nonce for {}: next {}", sender, state.current);
    }

    /// Get the next nonce for a sender
    pub async fn next(&self, sender: &str) -> u64 {
        let slot = self.slot(sender, 1);
        let mut state = slot.lock().await;
        let nonce = state.current;
        state.current += 1;
        nonce
    }

    /// Next nonce that would be allocated, if the sender is known
    pub async fn peek(&self, sender: &str) -> Option<u64> {
        let slot = self.senders.get(sender).map(|entry| entry.value().clone())?;
        let current = slot.lock().await.current;
        Some(current)
    }
}
