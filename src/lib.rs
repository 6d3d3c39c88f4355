//! HTLC relayer core
//!
//! Coordinates hashlock/timelock atomic swaps between an account-based
//! chain and a message-based chain: validates and relays cross-chain
//! messages, tracks order state from chain events under finality rules,
//! and executes same-chain and cross-chain orders.

pub mod api;
pub mod chain;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod metrics;
pub mod relay;
pub mod security;
pub mod service;
pub mod state;
pub mod types;

pub use error::{RelayerError, RelayerResult};
pub use service::RelayerService;
