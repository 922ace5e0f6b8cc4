//! Pool engine errors.

use thiserror::Error;

use shieldpool_privacy::PrivacyError;

use crate::transaction::TxId;

/// Errors raised while composing, proving, submitting or tracking
/// transactions.
///
/// Recoverable: `InsufficientFunds`, `ConfirmationTimeout` (the transaction
/// stays submitted) and `PrivacyError::DecryptionFailed` (note not ours).
/// Transaction-aborting: `RootMismatch`, `TreeFull`, `SignalMismatch`.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Privacy(#[from] PrivacyError),

    /// No selection of spendable notes covers the spend
    #[error("insufficient funds: spend needs {needed}, spendable notes cover {available}")]
    InsufficientFunds { needed: u128, available: u128 },

    /// Nullifier already recorded as spent
    #[error("double spend: nullifier 0x{} is already spent", hex::encode(.nullifier))]
    DoubleSpend { nullifier: [u8; 32] },

    /// Nullifier locked by another in-flight transaction
    #[error("nullifier 0x{} is pending in another transaction", hex::encode(.nullifier))]
    NullifierPending { nullifier: [u8; 32] },

    /// Proof signals differ from the assembled bundle
    #[error("public signal mismatch at position {position}: proof does not match bundle")]
    SignalMismatch { position: usize },

    /// Ledger rejected or reverted the transaction
    #[error("submission failed: {0}")]
    SubmissionFailed(String),

    /// Outcome not observed before the deadline; transaction stays submitted
    #[error("confirmation timeout for tx {tx}: outcome unknown, transaction remains submitted")]
    ConfirmationTimeout { tx: TxId },

    /// Operation not allowed in the builder's current state
    #[error("cannot {operation} in state {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("too many inputs: {count} exceeds circuit maximum {max}")]
    TooManyInputs { count: usize, max: usize },

    #[error("too many outputs: {count} exceeds circuit maximum {max}")]
    TooManyOutputs { count: usize, max: usize },

    #[error("deposit of {amount} exceeds pool limit {max}")]
    DepositLimitExceeded { amount: u128, max: u64 },

    #[error("withdrawal of {amount} is below the cross-domain minimum {min}")]
    WithdrawalBelowMinimum { amount: u128, min: u64 },

    /// Two outputs of one transaction share a blinding factor
    #[error("blinding reused by output note 0x{}", hex::encode(.commitment))]
    BlindingReused { commitment: [u8; 32] },

    #[error("withdrawal requires an external recipient")]
    MissingRecipient,

    #[error("invalid external address {0}")]
    InvalidExternalAddress(String),

    /// Ledger reported a leaf index the local tree cannot place
    #[error("unexpected leaf index {got}: local tree expects {expected}")]
    UnexpectedLeafIndex { expected: u64, got: u64 },

    #[error("unknown transaction {0}")]
    UnknownTransaction(TxId),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("prover error: {0}")]
    Prover(String),

    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PoolError {
    /// Errors that indicate divergence or tampering; never retry with the
    /// same inputs.
    pub fn is_aborting(&self) -> bool {
        matches!(
            self,
            PoolError::Privacy(PrivacyError::RootMismatch { .. })
                | PoolError::Privacy(PrivacyError::TreeFull { .. })
                | PoolError::SignalMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privacy_errors_convert() {
        let err: PoolError = PrivacyError::TreeFull { capacity: 8 }.into();
        assert!(err.is_aborting());
        assert_eq!(err.to_string(), "commitment tree full: capacity 8 reached");
    }

    #[test]
    fn test_messages_name_hashes() {
        let err = PoolError::DoubleSpend {
            nullifier: [0x11; 32],
        };
        assert!(err.to_string().contains(&"11".repeat(32)));
        assert!(!err.is_aborting());

        let err = PoolError::SignalMismatch { position: 3 };
        assert!(err.is_aborting());
        assert!(err.to_string().contains("position 3"));
    }
}
