//! Cross-chain message envelope
//!
//! Two shapes of the same message:
//! - `WireMessage`: what travels between relayers. Every field optional,
//!   unknown fields ignored, stable camelCase names.
//! - `CrossChainMessage`: the closed, typed form the core acts on, with a
//!   per-type `MessagePayload`.
//!
//! Wire messages are only turned into typed ones after validation.

use crate::security::keccak256;
use crate::types::{Amount, ChainId, Hashlock, MessageHash, OrderId, Secret, TxRef};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Wire protocol version spoken by this relayer
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    EscrowCreated,
    Fulfillment,
    Refund,
    Control,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::EscrowCreated => "escrow-created",
            MessageType::Fulfillment => "fulfillment",
            MessageType::Refund => "refund",
            MessageType::Control => "control",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "escrow-created" => Ok(MessageType::EscrowCreated),
            "fulfillment" => Ok(MessageType::Fulfillment),
            "refund" => Ok(MessageType::Refund),
            "control" => Ok(MessageType::Control),
            other => Err(format!("unknown message type: {}", other)),
        }
    }
}

/// Message as it appears on the wire
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_chain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_chain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_tx_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_tx_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hashlock: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timelock: Option<u64>,
    /// When the order behind an escrow was created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relayer_signature: Option<String>,
}

/// Every wire field, in canonical hashing order
pub const WIRE_FIELDS: &[&str] = &[
    "type",
    "version",
    "messageId",
    "timestamp",
    "nonce",
    "orderId",
    "sourceChain",
    "destChain",
    "sourceTxRef",
    "destTxRef",
    "sender",
    "recipient",
    "amount",
    "hashlock",
    "timelock",
    "createdAt",
    "secret",
    "command",
    "proof",
    "relayerSignature",
];

impl WireMessage {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Field value by wire name, rendered as a string
    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "type" => self.message_type.clone(),
            "version" => self.version.map(|v| v.to_string()),
            "messageId" => self.message_id.clone(),
            "timestamp" => self.timestamp.map(|v| v.to_string()),
            "nonce" => self.nonce.map(|v| v.to_string()),
            "orderId" => self.order_id.clone(),
            "sourceChain" => self.source_chain.clone(),
            "destChain" => self.dest_chain.clone(),
            "sourceTxRef" => self.source_tx_ref.clone(),
            "destTxRef" => self.dest_tx_ref.clone(),
            "sender" => self.sender.clone(),
            "recipient" => self.recipient.clone(),
            "amount" => self.amount.clone(),
            "hashlock" => self.hashlock.clone(),
            "timelock" => self.timelock.map(|v| v.to_string()),
            "createdAt" => self.created_at.map(|v| v.to_string()),
            "secret" => self.secret.clone(),
            "command" => self.command.clone(),
            "proof" => self.proof.clone(),
            "relayerSignature" => self.relayer_signature.clone(),
            _ => None,
        }
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).map(|v| !v.is_empty()).unwrap_or(false)
    }

    /// Replay/attestation key: keccak256 over every field except the
    /// relayer signature, so independent relayers attesting the same
    /// message converge on one hash.
    pub fn message_hash(&self) -> MessageHash {
        let mut preimage = Vec::with_capacity(512);
        for name in WIRE_FIELDS.iter().filter(|n| **n != "relayerSignature") {
            preimage.extend_from_slice(name.as_bytes());
            match self.field(name) {
                Some(value) => {
                    preimage.push(1);
                    preimage.extend_from_slice(&(value.len() as u32).to_be_bytes());
                    preimage.extend_from_slice(value.as_bytes());
                }
                None => preimage.push(0),
            }
        }
        MessageHash(keccak256(&preimage))
    }
}

/// Type-specific message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePayload {
    EscrowCreated {
        order_id: OrderId,
        recipient: String,
        amount: Amount,
        hashlock: Hashlock,
        timelock: u64,
        /// Creation time of the order; the timelock window is measured from it
        created_at: Option<u64>,
        source_tx_ref: Option<TxRef>,
    },
    Fulfillment {
        order_id: OrderId,
        hashlock: Hashlock,
        secret: Secret,
        proof_tx_ref: Option<TxRef>,
    },
    Refund {
        order_id: OrderId,
        recipient: String,
        amount: Amount,
        hashlock: Hashlock,
    },
    Control {
        command: String,
        order_id: Option<OrderId>,
    },
}

impl MessagePayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessagePayload::EscrowCreated { .. } => MessageType::EscrowCreated,
            MessagePayload::Fulfillment { .. } => MessageType::Fulfillment,
            MessagePayload::Refund { .. } => MessageType::Refund,
            MessagePayload::Control { .. } => MessageType::Control,
        }
    }

    pub fn order_id(&self) -> Option<OrderId> {
        match self {
            MessagePayload::EscrowCreated { order_id, .. }
            | MessagePayload::Fulfillment { order_id, .. }
            | MessagePayload::Refund { order_id, .. } => Some(*order_id),
            MessagePayload::Control { order_id, .. } => *order_id,
        }
    }
}

/// Validated cross-chain message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossChainMessage {
    pub message_id: String,
    pub version: u32,
    pub timestamp: u64,
    pub nonce: u64,
    pub sender: String,
    pub source_chain: ChainId,
    pub dest_chain: ChainId,
    pub payload: MessagePayload,
    pub proof: Option<String>,
    pub relayer_signature: Option<String>,
}

impl CrossChainMessage {
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    pub fn order_id(&self) -> Option<OrderId> {
        self.payload.order_id()
    }

    pub fn message_hash(&self) -> MessageHash {
        self.to_wire().message_hash()
    }

    pub fn to_wire(&self) -> WireMessage {
        let mut wire = WireMessage {
            message_type: Some(self.message_type().as_str().to_string()),
            version: Some(self.version),
            message_id: Some(self.message_id.clone()),
            timestamp: Some(self.timestamp),
            nonce: Some(self.nonce),
            source_chain: Some(self.source_chain.to_string()),
            dest_chain: Some(self.dest_chain.to_string()),
            sender: Some(self.sender.clone()),
            proof: self.proof.clone(),
            relayer_signature: self.relayer_signature.clone(),
            ..WireMessage::default()
        };

        match &self.payload {
            MessagePayload::EscrowCreated {
                order_id,
                recipient,
                amount,
                hashlock,
                timelock,
                created_at,
                source_tx_ref,
            } => {
                wire.order_id = Some(order_id.to_string());
                wire.recipient = Some(recipient.clone());
                wire.amount = Some(amount.to_string());
                wire.hashlock = Some(hashlock.to_string());
                wire.timelock = Some(*timelock);
                wire.created_at = *created_at;
                wire.source_tx_ref = source_tx_ref.as_ref().map(|t| t.to_string());
            }
            MessagePayload::Fulfillment {
                order_id,
                hashlock,
                secret,
                proof_tx_ref,
            } => {
                wire.order_id = Some(order_id.to_string());
                wire.hashlock = Some(hashlock.to_string());
                wire.secret = Some(secret.to_hex());
                wire.dest_tx_ref = proof_tx_ref.as_ref().map(|t| t.to_string());
            }
            MessagePayload::Refund {
                order_id,
                recipient,
                amount,
                hashlock,
            } => {
                wire.order_id = Some(order_id.to_string());
                wire.recipient = Some(recipient.clone());
                wire.amount = Some(amount.to_string());
                wire.hashlock = Some(hashlock.to_string());
            }
            MessagePayload::Control { command, order_id } => {
                wire.command = Some(command.clone());
                wire.order_id = order_id.map(|id| id.to_string());
            }
        }

        wire
    }

    /// Build the typed form. Collects every problem instead of stopping
    /// at the first one.
    pub fn from_wire(wire: &WireMessage) -> Result<Self, Vec<String>> {
        let mut errors = Vec::new();

        fn required<T>(errors: &mut Vec<String>, name: &str, value: Option<T>) -> Option<T> {
            if value.is_none() {
                errors.push(format!("missing field: {}", name));
            }
            value
        }

        fn parsed<T: FromStr<Err = String>>(
            errors: &mut Vec<String>,
            name: &str,
            value: Option<&String>,
        ) -> Option<T> {
            match value {
                None => {
                    errors.push(format!("missing field: {}", name));
                    None
                }
                Some(raw) => match raw.parse::<T>() {
                    Ok(v) => Some(v),
                    Err(e) => {
                        errors.push(format!("invalid {}: {}", name, e));
                        None
                    }
                },
            }
        }

        let message_type: Option<MessageType> =
            parsed(&mut errors, "type", wire.message_type.as_ref());
        let version = required(&mut errors, "version", wire.version);
        let message_id = required(&mut errors, "messageId", wire.message_id.clone());
        let timestamp = required(&mut errors, "timestamp", wire.timestamp);
        let nonce = required(&mut errors, "nonce", wire.nonce);
        let sender = required(&mut errors, "sender", wire.sender.clone());
        let source_chain: Option<ChainId> =
            parsed(&mut errors, "sourceChain", wire.source_chain.as_ref());
        let dest_chain: Option<ChainId> = parsed(&mut errors, "destChain", wire.dest_chain.as_ref());

        let payload = match message_type {
            Some(MessageType::EscrowCreated) => {
                let order_id = parsed(&mut errors, "orderId", wire.order_id.as_ref());
                let recipient = required(&mut errors, "recipient", wire.recipient.clone());
                let amount = parsed(&mut errors, "amount", wire.amount.as_ref());
                let hashlock = parsed(&mut errors, "hashlock", wire.hashlock.as_ref());
                let timelock = required(&mut errors, "timelock", wire.timelock);
                match (order_id, recipient, amount, hashlock, timelock) {
                    (Some(order_id), Some(recipient), Some(amount), Some(hashlock), Some(timelock)) => {
                        Some(MessagePayload::EscrowCreated {
                            order_id,
                            recipient,
                            amount,
                            hashlock,
                            timelock,
                            created_at: wire.created_at,
                            source_tx_ref: wire.source_tx_ref.clone().map(TxRef),
                        })
                    }
                    _ => None,
                }
            }
            Some(MessageType::Fulfillment) => {
                let order_id = parsed(&mut errors, "orderId", wire.order_id.as_ref());
                let hashlock = parsed(&mut errors, "hashlock", wire.hashlock.as_ref());
                let secret = match wire.secret.as_ref() {
                    None => {
                        errors.push("missing field: secret".to_string());
                        None
                    }
                    Some(raw) => match Secret::from_hex(raw) {
                        Ok(s) => Some(s),
                        Err(e) => {
                            errors.push(format!("invalid secret: {}", e));
                            None
                        }
                    },
                };
                match (order_id, hashlock, secret) {
                    (Some(order_id), Some(hashlock), Some(secret)) => Some(MessagePayload::Fulfillment {
                        order_id,
                        hashlock,
                        secret,
                        proof_tx_ref: wire.dest_tx_ref.clone().map(TxRef),
                    }),
                    _ => None,
                }
            }
            Some(MessageType::Refund) => {
                let order_id = parsed(&mut errors, "orderId", wire.order_id.as_ref());
                let recipient = required(&mut errors, "recipient", wire.recipient.clone());
                let amount = parsed(&mut errors, "amount", wire.amount.as_ref());
                let hashlock = parsed(&mut errors, "hashlock", wire.hashlock.as_ref());
                match (order_id, recipient, amount, hashlock) {
                    (Some(order_id), Some(recipient), Some(amount), Some(hashlock)) => {
                        Some(MessagePayload::Refund {
                            order_id,
                            recipient,
                            amount,
                            hashlock,
                        })
                    }
                    _ => None,
                }
            }
            Some(MessageType::Control) => {
                let command = required(&mut errors, "command", wire.command.clone());
                let order_id = match wire.order_id.as_ref() {
                    None => None,
                    Some(raw) => match raw.parse::<OrderId>() {
                        Ok(id) => Some(id),
                        Err(e) => {
                            errors.push(format!("invalid orderId: {}", e));
                            None
                        }
                    },
                };
                command.map(|command| MessagePayload::Control { command, order_id })
            }
            None => None,
        };

        match (
            payload,
            version,
            message_id,
            timestamp,
            nonce,
            sender,
            source_chain,
            dest_chain,
        ) {
            (
                Some(payload),
                Some(version),
                Some(message_id),
                Some(timestamp),
                Some(nonce),
                Some(sender),
                Some(source_chain),
                Some(dest_chain),
            ) if errors.is_empty() => Ok(Self {
                message_id,
                version,
                timestamp,
                nonce,
                sender,
                source_chain,
                dest_chain,
                payload,
                proof: wire.proof.clone(),
                relayer_signature: wire.relayer_signature.clone(),
            }),
            _ => Err(errors),
        }
    }
}
