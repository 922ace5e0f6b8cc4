//! Ledger collaborator.
//!
//! The engine never owns the authoritative pool state. It reads roots,
//! commitments and nullifier flags from a [`Ledger`] and submits payloads to
//! it; outcomes are observed by polling.

pub mod mock;

use std::future::Future;

use serde::{Deserialize, Serialize};

use shieldpool_privacy::{Commitment, EncryptedNote, Nullifier};

use crate::error::Result;
use crate::transaction::{SubmissionPayload, TxId};

pub use mock::MockLedger;

/// One leaf of the ledger's commitment log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentRecord {
    pub commitment: Commitment,
    pub index: u64,
    pub encrypted_output: EncryptedNote,
}

/// State change emitted by a confirmed transaction, in ledger order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    Committed { commitment: Commitment, index: u64 },
    NullifierSpent { nullifier: Nullifier },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOutcome {
    Confirmed { events: Vec<LedgerEvent> },
    Reverted { reason: String },
}

/// Receipt for a submitted payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxHandle {
    pub tx_id: TxId,
}

/// Authoritative pool state and transaction sink
pub trait Ledger: Send + Sync {
    /// Most recent accumulator root
    fn last_root(&self) -> impl Future<Output = Result<[u8; 32]>> + Send;

    /// Commitment log entries at index `cursor` and above, in order
    fn commitments_since(
        &self,
        cursor: u64,
    ) -> impl Future<Output = Result<Vec<CommitmentRecord>>> + Send;

    fn is_nullifier_spent(&self, nullifier: &Nullifier)
    -> impl Future<Output = Result<bool>> + Send;

    /// Hand a payload to the ledger. An `Err` means it was never accepted.
    fn submit(&self, payload: &SubmissionPayload) -> impl Future<Output = Result<TxHandle>> + Send;

    /// Outcome of a submitted transaction, `None` while undecided
    fn outcome(&self, handle: &TxHandle) -> impl Future<Output = Result<Option<TxOutcome>>> + Send;
}
