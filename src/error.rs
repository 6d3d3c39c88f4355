//! Error types for the HTLC relayer

use crate::types::ChainId;
use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Transient chain error on {chain}: {message}")]
    TransientChain { chain: ChainId, message: String },

    #[error("Permanent chain error on {chain}: {message}")]
    PermanentChain { chain: ChainId, message: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Chain {chain} not found")]
    ChainNotFound { chain: ChainId },

    #[error("Order {order_id} already exists")]
    DuplicateOrder { order_id: String },

    #[error("Order {order_id} not found")]
    OrderNotFound { order_id: String },

    #[error("Invalid state transition for order {order_id} from {from} to {to}")]
    InvalidStateTransition {
        order_id: String,
        from: String,
        to: String,
    },

    #[error("Secret does not match hashlock for order {order_id}")]
    InvalidSecret { order_id: String },

    #[error("Secret for hashlock {hashlock} was already used")]
    SecretReplay { hashlock: String },

    #[error("Order {order_id} cannot be cancelled: {reason}")]
    NotCancellable { order_id: String, reason: String },

    #[error("Order {order_id} cannot be executed: {reason}")]
    NotExecutable { order_id: String, reason: String },

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Security ledger corrupted: {0}")]
    LedgerCorrupted(String),

    #[error("Relay is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::TransientChain { .. } | RelayerError::Timeout { .. }
        )
    }

    /// Errors that must stop the process rather than degrade
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayerError::LedgerCorrupted(_) | RelayerError::Config(_)
        )
    }

    /// Check if error is a violated swap invariant
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            RelayerError::DuplicateOrder { .. }
                | RelayerError::InvalidStateTransition { .. }
                | RelayerError::InvalidSecret { .. }
                | RelayerError::SecretReplay { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::LedgerCorrupted(_)
                | RelayerError::PermanentChain { .. }
                | RelayerError::SecretReplay { .. }
        )
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        RelayerError::Validation(vec![message.into()])
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;
