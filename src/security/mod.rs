//! Security & validation
//!
//! Hashlock commitments, message validation, the replay/attestation ledger
//! and relayer signatures.

pub mod hashlock;
pub mod ledger;
pub mod signer;
pub mod validator;

pub use hashlock::{generate_hashlock, keccak256, verify_secret};
pub use ledger::{LedgerStats, QuorumSlot, SecurityLedger};
pub use signer::{verify_signature, Ed25519Signer, SigningCapability};
pub use validator::{is_hex_digest, MessageValidator, ValidationResult};
