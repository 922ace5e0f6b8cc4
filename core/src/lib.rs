//! Shielded pool transaction engine.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       ShieldedPool                               │
//! │     deposit / transfer / withdraw / sync / resolve / checkpoint  │
//! └───────────────┬─────────────────────────────────┬───────────────┘
//!                 │                                 │
//!                 v                                 v
//! ┌───────────────────────────────┐   ┌─────────────────────────────┐
//! │      TransactionBuilder       │   │     WithdrawalTracker       │
//! │  select -> outputs -> bundle  │   │  cross-domain intents       │
//! │  -> package -> outcome        │   └─────────────────────────────┘
//! └──────┬──────────────┬─────────┘
//!        │              │
//!        v              v
//! ┌─────────────┐ ┌─────────────────────────────┐
//! │ SharedState │ │ Ledger / ProofBackend       │
//! │ tree (RwLock│ │ (external collaborators;    │
//! │ nullifiers) │ │  MockLedger, MockProver)    │
//! └─────────────┘ └─────────────────────────────┘
//! ```
//!
//! Note, key, tree and encryption primitives live in `shieldpool-privacy`.

pub mod bridge;
pub mod error;
pub mod ledger;
pub mod pool;
pub mod prover;
pub mod storage;
pub mod transaction;

pub use bridge::{BridgeOutcome, WithdrawalIntent, WithdrawalState, WithdrawalTracker};
pub use error::{PoolError, Result};
pub use ledger::{CommitmentRecord, Ledger, LedgerEvent, MockLedger, TxHandle, TxOutcome};
pub use pool::{ShieldedPool, TxReceipt};
pub use prover::{MockProver, ProofBackend};
pub use storage::{NullifierTracker, SharedState, WalletCheckpoint};
pub use transaction::{
    CircuitArity, ExtData, ExternalAddress, OutputSpec, PublicFlow, TransactionBuilder,
    TransactionRequest, TxId, TxState,
};

#[cfg(test)]
mod tests;
