//! Relay module - cross-chain message delivery
//!
//! This module provides:
//! - The wire and typed message forms
//! - Signed message construction with per-sender nonces
//! - Retry policy for chain calls
//! - The delivery queue and attestation intake

pub mod backoff;
pub mod factory;
pub mod message;
pub mod nonce;
pub mod queue;

pub use backoff::RetryPolicy;
pub use factory::MessageFactory;
pub use message::{CrossChainMessage, MessagePayload, MessageType, WireMessage, PROTOCOL_VERSION};
pub use nonce::NonceManager;
pub use queue::{AttestationOutcome, MessageRelay, RelayEntry, RelayOutcome, RelayStats, RelayStatus};
