//! Order execution for same-chain and cross-chain swaps
//!
//! The execution engine:
//! 1. Builds, signs and books maker orders
//! 2. Settles same-chain orders against complementary ones
//! 3. Escrows cross-chain orders and relays the escrow to the destination
//! 4. Completes orders on secret reveal and refunds them after expiry

pub mod engine;
pub mod orderbook;

pub use engine::{
    CancelOutcome, ExecutionEngine, ExecutionResult, ExecutionStats, ExecutionStatus, OrderParams, PendingExecution,
};
pub use orderbook::{is_complement, BookCounts, BookEntry, BookStatus, OrderBook, SignedOrder};
