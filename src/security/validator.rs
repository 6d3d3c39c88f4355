//! Stateless message validation
//!
//! Reads the security ledger (nonces, attestations) but never writes it.
//! Every problem is reported; nothing here throws for bad data.

use crate::config::SecurityConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::relay::{CrossChainMessage, MessageType, WireMessage};
use crate::security::{verify_secret, verify_signature, SecurityLedger};
use crate::types::{Amount, ChainId, Clock, Hashlock, OrderId, Secret};

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

lazy_static! {
    static ref HEX_DIGEST: Regex = Regex::new(r"^(0x)?[0-9a-fA-F]{64}$").unwrap();
}

/// Fields every message carries
const COMMON_FIELDS: &[&str] = &[
    "type",
    "version",
    "messageId",
    "timestamp",
    "nonce",
    "sender",
    "sourceChain",
    "destChain",
    "relayerSignature",
];

/// Schema table: extra required fields per message type
fn required_fields(message_type: MessageType) -> &'static [&'static str] {
    match message_type {
        MessageType::EscrowCreated => &["orderId", "recipient", "amount", "hashlock", "timelock"],
        MessageType::Fulfillment => &["orderId", "hashlock", "secret"],
        MessageType::Refund => &["orderId", "recipient", "amount", "hashlock"],
        MessageType::Control => &["command"],
    }
}

/// Outcome of validating one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
        }
    }

    pub fn into_result(self) -> RelayerResult<()> {
        if self.is_valid {
            Ok(())
        } else {
            Err(RelayerError::Validation(self.errors))
        }
    }
}

pub fn is_hex_digest(value: &str) -> bool {
    HEX_DIGEST.is_match(value)
}

pub struct MessageValidator {
    config: SecurityConfig,
    clock: Arc<dyn Clock>,
    ledger: Arc<SecurityLedger>,
}

impl MessageValidator {
    pub fn new(config: SecurityConfig, clock: Arc<dyn Clock>, ledger: Arc<SecurityLedger>) -> Self {
        Self {
            config,
            clock,
            ledger,
        }
    }

    pub fn ledger(&self) -> &Arc<SecurityLedger> {
        &self.ledger
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Inclusive `[now + min, now + max]` window
    pub fn validate_timelock(&self, timelock: u64, now: u64) -> Result<(), String> {
        let earliest = now.saturating_add(self.config.min_timelock_secs);
        let latest = now.saturating_add(self.config.max_timelock_secs);
        if timelock < earliest {
            return Err(format!(
                "timelock {} is below minimum {} (now + {}s)",
                timelock, earliest, self.config.min_timelock_secs
            ));
        }
        if timelock > latest {
            return Err(format!(
                "timelock {} is above maximum {} (now + {}s)",
                timelock, latest, self.config.max_timelock_secs
            ));
        }
        Ok(())
    }

    /// Timelock of an escrow that already exists: the `[min, max]` window
    /// is measured from the order's creation, and the lock must not have
    /// elapsed yet
    pub fn validate_escrow_timelock(&self, timelock: u64, created_at: u64, now: u64) -> Result<(), String> {
        if created_at > now.saturating_add(self.config.max_clock_skew_secs) {
            return Err(format!("createdAt {} is in the future", created_at));
        }
        if timelock <= now {
            return Err(format!("timelock {} has already elapsed", timelock));
        }
        self.validate_timelock(timelock, created_at)
    }

    pub async fn validate_message(&self, wire: &WireMessage) -> ValidationResult {
        let now = self.clock.now();
        let mut errors = Vec::new();

        if let Some(version) = wire.version {
            if version != self.config.protocol_version {
                errors.push(format!(
                    "unsupported protocol version {} (expected {})",
                    version, self.config.protocol_version
                ));
            }
        }

        let message_type = match wire.message_type.as_deref() {
            Some(raw) => match raw.parse::<MessageType>() {
                Ok(t) => Some(t),
                Err(e) => {
                    errors.push(e);
                    None
                }
            },
            None => None,
        };

        let specific = message_type.map(required_fields).unwrap_or(&[]);
        for field in COMMON_FIELDS.iter().chain(specific.iter()) {
            if !wire.has_field(field) {
                errors.push(format!("missing field: {}", field));
            }
        }

        if let Some(timestamp) = wire.timestamp {
            let oldest = now.saturating_sub(self.config.max_message_age_secs);
            let newest = now.saturating_add(self.config.max_clock_skew_secs);
            if timestamp < oldest {
                errors.push(format!("timestamp {} is older than {}s", timestamp, self.config.max_message_age_secs));
            } else if timestamp > newest {
                errors.push(format!(
                    "timestamp {} is more than {}s in the future",
                    timestamp, self.config.max_clock_skew_secs
                ));
            }
        }

        for (name, value) in [("sourceChain", &wire.source_chain), ("destChain", &wire.dest_chain)] {
            if let Some(raw) = value {
                if let Err(e) = raw.parse::<ChainId>() {
                    errors.push(format!("invalid {}: {}", name, e));
                }
            }
        }

        if let Some(raw) = &wire.order_id {
            if let Err(e) = raw.parse::<OrderId>() {
                errors.push(format!("invalid orderId: {}", e));
            }
        }

        let hashlock = match &wire.hashlock {
            Some(raw) if is_hex_digest(raw) => raw.parse::<Hashlock>().ok(),
            Some(raw) => {
                errors.push(format!("invalid hashlock '{}': expected 64 hex chars", raw));
                None
            }
            None => None,
        };

        if let Some(raw) = &wire.amount {
            if let Err(e) = Amount::parse(raw) {
                errors.push(e);
            }
        }

        if message_type == Some(MessageType::EscrowCreated) {
            if let Some(timelock) = wire.timelock {
                let checked = match wire.created_at {
                    Some(created_at) => self.validate_escrow_timelock(timelock, created_at, now),
                    None => self.validate_timelock(timelock, now),
                };
                if let Err(e) = checked {
                    errors.push(e);
                }
            }
        }

        if let Some(raw) = &wire.secret {
            match Secret::from_hex(raw) {
                Ok(secret) => {
                    if let Some(hashlock) = &hashlock {
                        if !verify_secret(&secret, hashlock) {
                            errors.push("secret does not match hashlock".to_string());
                        }
                    }
                }
                Err(e) => errors.push(format!("invalid secret: {}", e)),
            }
        }

        let hash = wire.message_hash();

        if let (Some(sender), Some(nonce)) = (&wire.sender, wire.nonce) {
            if let Some(last) = self.ledger.last_nonce(sender).await {
                // Further attestations of an already-seen message repeat its nonce
                let attested = self.ledger.confirmation_count(&hash).await > 0;
                if nonce <= last && !attested {
                    errors.push(format!(
                        "nonce {} for sender {} is not above last seen {}",
                        nonce, sender, last
                    ));
                }
            }
        }

        if !self.config.trusted_relayers.is_empty() {
            if let Some(raw) = &wire.relayer_signature {
                let signature = hex::decode(raw.trim_start_matches("0x")).unwrap_or_default();
                let trusted = self
                    .config
                    .trusted_relayers
                    .iter()
                    .any(|key| verify_signature(key, hash.as_bytes(), &signature));
                if !trusted {
                    errors.push("relayer signature does not verify against any trusted relayer".to_string());
                }
            }
        }

        if !errors.is_empty() {
            debug!("Message {} rejected: {:?}", hash, errors);
        }
        ValidationResult::from_errors(errors)
    }

    /// Validate and convert to the typed form
    pub async fn parse_message(&self, wire: &WireMessage) -> RelayerResult<CrossChainMessage> {
        self.validate_message(wire).await.into_result()?;
        CrossChainMessage::from_wire(wire).map_err(RelayerError::Validation)
    }
}
