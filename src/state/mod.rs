//! Order state with optional SQLite persistence
//!
//! Handles:
//! - The swap lifecycle state machine
//! - Per-order records, finality-gated event application
//! - Journal of processed messages, order snapshots and block checkpoints

pub mod machine;
pub mod store;
pub mod sync;

pub use machine::SwapState;
pub use store::Journal;
pub use sync::{OrderRecord, StateSync, StateTransition};
