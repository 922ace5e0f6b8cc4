//! Cross-domain withdrawal tracking.
//!
//! The bridge itself is external: it accepts a withdrawal intent keyed by
//! transaction id and eventually reports success or failure.

pub mod withdrawals;

pub use withdrawals::{BridgeOutcome, WithdrawalIntent, WithdrawalState, WithdrawalTracker};
