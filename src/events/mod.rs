//! Escrow event types and parsing
//!
//! Chain adapters hand the core loosely-typed `RawChainEvent`s; the
//! `EventParser` turns them into the closed `ChainEvent` set the state
//! machine understands.

use crate::error::{RelayerError, RelayerResult};
use crate::types::{Amount, ChainId, Hashlock, OrderId, Secret, TxRef};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event kinds emitted by the escrow contracts
pub mod kinds {
    pub const ESCROW_CREATED: &str = "escrow_created";
    pub const SECRET_REVEALED: &str = "secret_revealed";
    pub const ESCROW_WITHDRAWN: &str = "escrow_withdrawn";
    pub const ESCROW_REFUNDED: &str = "escrow_refunded";
}

/// Event as delivered by a chain adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChainEvent {
    pub chain: ChainId,
    pub kind: String,
    pub tx_ref: TxRef,
    pub block_number: u64,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl RawChainEvent {
    pub fn new(chain: ChainId, kind: &str, tx_ref: TxRef, block_number: u64) -> Self {
        Self {
            chain,
            kind: kind.to_string(),
            tx_ref,
            block_number,
            attributes: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

/// Subscription filter passed to `ChainAdapter::subscribe`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub chain: ChainId,
    /// First block to deliver; earlier events are skipped
    pub from_block: u64,
    /// Event kinds of interest; empty means all
    pub kinds: Vec<String>,
}

impl EventFilter {
    pub fn all(chain: ChainId, from_block: u64) -> Self {
        Self {
            chain,
            from_block,
            kinds: Vec::new(),
        }
    }

    pub fn matches(&self, event: &RawChainEvent) -> bool {
        event.chain == self.chain
            && event.block_number >= self.from_block
            && (self.kinds.is_empty() || self.kinds.iter().any(|k| *k == event.kind))
    }
}

/// Escrow lifecycle events
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChainEvent {
    EscrowCreated {
        chain: ChainId,
        order_id: OrderId,
        escrow_ref: String,
        hashlock: Hashlock,
        timelock: u64,
        amount: Amount,
        tx_ref: TxRef,
        block_number: u64,
    },

    /// Taker withdrew with the preimage; the secret is now public
    SecretRevealed {
        chain: ChainId,
        order_id: OrderId,
        hashlock: Hashlock,
        secret: Secret,
        tx_ref: TxRef,
        block_number: u64,
    },

    EscrowWithdrawn {
        chain: ChainId,
        order_id: OrderId,
        escrow_ref: String,
        tx_ref: TxRef,
        block_number: u64,
    },

    EscrowRefunded {
        chain: ChainId,
        order_id: OrderId,
        escrow_ref: String,
        tx_ref: TxRef,
        block_number: u64,
    },

    Unknown {
        chain: ChainId,
        kind: String,
        tx_ref: TxRef,
        block_number: u64,
    },
}

impl ChainEvent {
    pub fn chain(&self) -> ChainId {
        match self {
            ChainEvent::EscrowCreated { chain, .. }
            | ChainEvent::SecretRevealed { chain, .. }
            | ChainEvent::EscrowWithdrawn { chain, .. }
            | ChainEvent::EscrowRefunded { chain, .. }
            | ChainEvent::Unknown { chain, .. } => *chain,
        }
    }

    /// Get event name for metrics
    pub fn name(&self) -> &'static str {
        match self {
            ChainEvent::EscrowCreated { .. } => kinds::ESCROW_CREATED,
            ChainEvent::SecretRevealed { .. } => kinds::SECRET_REVEALED,
            ChainEvent::EscrowWithdrawn { .. } => kinds::ESCROW_WITHDRAWN,
            ChainEvent::EscrowRefunded { .. } => kinds::ESCROW_REFUNDED,
            ChainEvent::Unknown { .. } => "unknown",
        }
    }

    pub fn tx_ref(&self) -> &TxRef {
        match self {
            ChainEvent::EscrowCreated { tx_ref, .. }
            | ChainEvent::SecretRevealed { tx_ref, .. }
            | ChainEvent::EscrowWithdrawn { tx_ref, .. }
            | ChainEvent::EscrowRefunded { tx_ref, .. }
            | ChainEvent::Unknown { tx_ref, .. } => tx_ref,
        }
    }

    pub fn block_number(&self) -> u64 {
        match self {
            ChainEvent::EscrowCreated { block_number, .. }
            | ChainEvent::SecretRevealed { block_number, .. }
            | ChainEvent::EscrowWithdrawn { block_number, .. }
            | ChainEvent::EscrowRefunded { block_number, .. }
            | ChainEvent::Unknown { block_number, .. } => *block_number,
        }
    }

    pub fn order_id(&self) -> Option<OrderId> {
        match self {
            ChainEvent::EscrowCreated { order_id, .. }
            | ChainEvent::SecretRevealed { order_id, .. }
            | ChainEvent::EscrowWithdrawn { order_id, .. }
            | ChainEvent::EscrowRefunded { order_id, .. } => Some(*order_id),
            ChainEvent::Unknown { .. } => None,
        }
    }

    /// Check if this event can move an order's state
    pub fn requires_action(&self) -> bool {
        !matches!(self, ChainEvent::Unknown { .. })
    }
}

/// Turns raw adapter events into `ChainEvent`s
pub struct EventParser {
    chain: ChainId,
}

impl EventParser {
    pub fn new(chain: ChainId) -> Self {
        Self { chain }
    }

    /// Parse a raw event. Missing or malformed attributes of a known kind
    /// are a validation error; unknown kinds pass through as `Unknown`.
    pub fn parse(&self, raw: &RawChainEvent) -> RelayerResult<ChainEvent> {
        if raw.chain != self.chain {
            return Err(RelayerError::validation(format!(
                "event from {} delivered to {} parser",
                raw.chain, self.chain
            )));
        }

        let mut errors = Vec::new();
        let chain = raw.chain;
        let tx_ref = raw.tx_ref.clone();
        let block_number = raw.block_number;

        let event = match raw.kind.as_str() {
            kinds::ESCROW_CREATED => {
                let order_id = attr_parsed::<OrderId>(raw, "order_id", &mut errors);
                let escrow_ref = attr_str(raw, "escrow_ref", &mut errors);
                let hashlock = attr_parsed::<Hashlock>(raw, "hashlock", &mut errors);
                let timelock = attr_u64(raw, "timelock", &mut errors);
                let amount = attr_parsed::<Amount>(raw, "amount", &mut errors);
                match (order_id, escrow_ref, hashlock, timelock, amount) {
                    (Some(order_id), Some(escrow_ref), Some(hashlock), Some(timelock), Some(amount)) => {
                        Some(ChainEvent::EscrowCreated {
                            chain,
                            order_id,
                            escrow_ref,
                            hashlock,
                            timelock,
                            amount,
                            tx_ref,
                            block_number,
                        })
                    }
                    _ => None,
                }
            }
            kinds::SECRET_REVEALED => {
                let order_id = attr_parsed::<OrderId>(raw, "order_id", &mut errors);
                let hashlock = attr_parsed::<Hashlock>(raw, "hashlock", &mut errors);
                let secret = attr_str(raw, "secret", &mut errors).and_then(|s| {
                    Secret::from_hex(&s)
                        .map_err(|e| errors.push(format!("invalid secret: {}", e)))
                        .ok()
                });
                match (order_id, hashlock, secret) {
                    (Some(order_id), Some(hashlock), Some(secret)) => Some(ChainEvent::SecretRevealed {
                        chain,
                        order_id,
                        hashlock,
                        secret,
                        tx_ref,
                        block_number,
                    }),
                    _ => None,
                }
            }
            kinds::ESCROW_WITHDRAWN | kinds::ESCROW_REFUNDED => {
                let order_id = attr_parsed::<OrderId>(raw, "order_id", &mut errors);
                let escrow_ref = attr_str(raw, "escrow_ref", &mut errors);
                match (order_id, escrow_ref) {
                    (Some(order_id), Some(escrow_ref)) if raw.kind == kinds::ESCROW_WITHDRAWN => {
                        Some(ChainEvent::EscrowWithdrawn {
                            chain,
                            order_id,
                            escrow_ref,
                            tx_ref,
                            block_number,
                        })
                    }
                    (Some(order_id), Some(escrow_ref)) => Some(ChainEvent::EscrowRefunded {
                        chain,
                        order_id,
                        escrow_ref,
                        tx_ref,
                        block_number,
                    }),
                    _ => None,
                }
            }
            other => Some(ChainEvent::Unknown {
                chain,
                kind: other.to_string(),
                tx_ref,
                block_number,
            }),
        };

        match event {
            Some(event) if errors.is_empty() => Ok(event),
            _ => Err(RelayerError::Validation(errors)),
        }
    }
}

fn attr_str(raw: &RawChainEvent, key: &str, errors: &mut Vec<String>) -> Option<String> {
    match raw.attributes.get(key).and_then(Value::as_str) {
        Some(s) => Some(s.to_string()),
        None => {
            errors.push(format!("{} event missing {}", raw.kind, key));
            None
        }
    }
}

fn attr_u64(raw: &RawChainEvent, key: &str, errors: &mut Vec<String>) -> Option<u64> {
    match raw.attributes.get(key).and_then(Value::as_u64) {
        Some(v) => Some(v),
        None => {
            errors.push(format!("{} event missing {}", raw.kind, key));
            None
        }
    }
}

fn attr_parsed<T: std::str::FromStr<Err = String>>(
    raw: &RawChainEvent,
    key: &str,
    errors: &mut Vec<String>,
) -> Option<T> {
    let value = attr_str(raw, key, errors)?;
    value
        .parse::<T>()
        .map_err(|e| errors.push(format!("invalid {}: {}", key, e)))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::generate_hashlock;

    fn created(order: OrderId) -> RawChainEvent {
        RawChainEvent::new(ChainId::Evm, kinds::ESCROW_CREATED, TxRef::new("0x01"), 10)
            .with("order_id", order.to_string())
            .with("escrow_ref", "escrow-1")
            .with("hashlock", Hashlock([2u8; 32]).to_string())
            .with("timelock", 5000u64)
            .with("amount", "1000")
    }

    #[test]
    fn parses_escrow_created() {
        let parser = EventParser::new(ChainId::Evm);
        let order = OrderId([1u8; 32]);
        let event = parser.parse(&created(order)).unwrap();
        assert_eq!(event.name(), "escrow_created");
        assert_eq!(event.order_id(), Some(order));
        assert_eq!(event.block_number(), 10);
        assert!(event.requires_action());
    }

    #[test]
    fn parses_secret_reveal() {
        let parser = EventParser::new(ChainId::Ton);
        let secret = Secret::new([4u8; 32]);
        let raw = RawChainEvent::new(ChainId::Ton, kinds::SECRET_REVEALED, TxRef::new("lt:9"), 3)
            .with("order_id", OrderId([1u8; 32]).to_string())
            .with("hashlock", generate_hashlock(&secret).to_string())
            .with("secret", secret.to_hex());
        match parser.parse(&raw).unwrap() {
            ChainEvent::SecretRevealed { secret: got, .. } => assert_eq!(got, secret),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn missing_attributes_are_reported() {
        let parser = EventParser::new(ChainId::Evm);
        let mut raw = created(OrderId([1u8; 32]));
        raw.attributes.remove("amount");
        raw.attributes.insert("hashlock".into(), "zz".into());
        match parser.parse(&raw) {
            Err(RelayerError::Validation(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_kinds_pass_through() {
        let parser = EventParser::new(ChainId::Evm);
        let raw = RawChainEvent::new(ChainId::Evm, "paused", TxRef::new("0x02"), 1);
        let event = parser.parse(&raw).unwrap();
        assert!(!event.requires_action());
        assert_eq!(event.order_id(), None);
    }

    #[test]
    fn filter_respects_block_and_kind() {
        let raw = created(OrderId([1u8; 32]));
        assert!(EventFilter::all(ChainId::Evm, 10).matches(&raw));
        assert!(!EventFilter::all(ChainId::Evm, 11).matches(&raw));
        assert!(!EventFilter::all(ChainId::Ton, 0).matches(&raw));

        let only_refunds = EventFilter {
            chain: ChainId::Evm,
            from_block: 0,
            kinds: vec![kinds::ESCROW_REFUNDED.to_string()],
        };
        assert!(!only_refunds.matches(&raw));
    }
}
