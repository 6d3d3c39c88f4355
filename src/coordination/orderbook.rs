//! Signed order book and same-chain matching

use crate::error::{RelayerError, RelayerResult};
use crate::types::{CrossChainOrder, Direction, OrderId};

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Book status of a signed order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookStatus {
    Signed,
    Matched,
    Executing,
    Completed,
    Cancelled,
    Failed,
}

/// An order together with its maker's signature over the order id
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignedOrder {
    pub order: CrossChainOrder,
    /// Hex public key of the signer
    pub signer_id: String,
    /// Hex signature over the order id bytes
    pub signature: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookEntry {
    pub signed: SignedOrder,
    pub status: BookStatus,
    pub matched_with: Option<OrderId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BookCounts {
    pub signed: usize,
    pub matched: usize,
    pub executing: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub failed: usize,
}

/// Whether `candidate` takes the other side of `order`: same chain,
/// swapped asset pair, and an effective price within `max_slippage_bps`
/// of the price `order` asks for.
///
/// Prices are compared by cross-multiplication, so no division or
/// floating point is involved.
pub fn is_complement(order: &CrossChainOrder, candidate: &CrossChainOrder, max_slippage_bps: u32) -> bool {
    if candidate.order_id == order.order_id
        || order.direction != Direction::SameChain
        || candidate.direction != Direction::SameChain
        || candidate.source_asset != order.dest_asset
        || candidate.dest_asset != order.source_asset
    {
        return false;
    }

    // order asks dest/source; candidate offers source/dest of the same pair
    let asked = order.dest_amount.as_u256().checked_mul(candidate.dest_amount.as_u256());
    let offered = candidate.source_amount.as_u256().checked_mul(order.source_amount.as_u256());
    let (Some(asked), Some(offered)) = (asked, offered) else {
        debug!("Price overflow comparing {} and {}", order.order_id, candidate.order_id);
        return false;
    };

    let diff = if asked > offered { asked - offered } else { offered - asked };
    match (
        diff.checked_mul(U256::from(10_000u64)),
        asked.checked_mul(U256::from(max_slippage_bps)),
    ) {
        (Some(lhs), Some(rhs)) => lhs <= rhs,
        _ => false,
    }
}

/// Orders visible to matching and execution
#[derive(Default)]
pub struct OrderBook {
    entries: RwLock<HashMap<OrderId, BookEntry>>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, signed: SignedOrder) -> RelayerResult<()> {
        let mut entries = self.entries.write().await;
        let order_id = signed.order.order_id;
        if entries.contains_key(&order_id) {
            return Err(RelayerError::DuplicateOrder {
                order_id: order_id.to_string(),
            });
        }
        entries.insert(
            order_id,
            BookEntry {
                signed,
                status: BookStatus::Signed,
                matched_with: None,
            },
        );
        Ok(())
    }

    pub async fn remove(&self, order_id: &OrderId) -> Option<BookEntry> {
        self.entries.write().await.remove(order_id)
    }

    pub async fn get(&self, order_id: &OrderId) -> Option<BookEntry> {
        self.entries.read().await.get(order_id).cloned()
    }

    pub async fn status(&self, order_id: &OrderId) -> Option<BookStatus> {
        self.entries.read().await.get(order_id).map(|e| e.status)
    }

    pub async fn set_status(&self, order_id: &OrderId, status: BookStatus) -> RelayerResult<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(order_id)
            .ok_or_else(|| RelayerError::OrderNotFound {
                order_id: order_id.to_string(),
            })?;
        entry.status = status;
        Ok(())
    }

    /// Move `expected` orders to `status`; returns false if it was not in `expected`
    pub async fn transition(&self, order_id: &OrderId, expected: BookStatus, status: BookStatus) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(order_id) {
            Some(entry) if entry.status == expected => {
                entry.status = status;
                true
            }
            _ => false,
        }
    }

    /// Atomically mark two signed orders as matched with each other
    pub async fn claim_pair(&self, a: &OrderId, b: &OrderId) -> RelayerResult<()> {
        let mut entries = self.entries.write().await;
        for id in [a, b] {
            match entries.get(id).map(|e| e.status) {
                Some(BookStatus::Signed) => {}
                Some(status) => {
                    return Err(RelayerError::NotExecutable {
                        order_id: id.to_string(),
                        reason: format!("order is {:?}", status),
                    })
                }
                None => {
                    return Err(RelayerError::OrderNotFound {
                        order_id: id.to_string(),
                    })
                }
            }
        }
        for (id, other) in [(a, b), (b, a)] {
            if let Some(entry) = entries.get_mut(id) {
                entry.status = BookStatus::Matched;
                entry.matched_with = Some(*other);
            }
        }
        Ok(())
    }

    /// Signed complements of `order`, earliest first
    pub async fn complements(&self, order: &CrossChainOrder, max_slippage_bps: u32, now: u64) -> Vec<CrossChainOrder> {
        let entries = self.entries.read().await;
        let mut found: Vec<CrossChainOrder> = entries
            .values()
            .filter(|e| e.status == BookStatus::Signed)
            .map(|e| &e.signed.order)
            .filter(|candidate| candidate.deadline >= now)
            .filter(|candidate| is_complement(order, candidate, max_slippage_bps))
            .cloned()
            .collect();
        found.sort_by_key(|o| (o.created_at, o.order_id));
        found
    }

    pub async fn counts(&self) -> BookCounts {
        let entries = self.entries.read().await;
        let mut counts = BookCounts::default();
        for entry in entries.values() {
            match entry.status {
                BookStatus::Signed => counts.signed += 1,
                BookStatus::Matched => counts.matched += 1,
                BookStatus::Executing => counts.executing += 1,
                BookStatus::Completed => counts.completed += 1,
                BookStatus::Cancelled => counts.cancelled += 1,
                BookStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}
