//! Privacy primitive errors.

use thiserror::Error;

/// Errors produced by key derivation, note construction, the commitment
/// tree and note encryption.
///
/// Hashes are rendered in hex; amounts and blinding factors never appear.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrivacyError {
    /// Amount is negative or does not fit the note value range
    #[error("invalid amount: note values must lie in 0..=u64::MAX")]
    InvalidAmount,

    /// Secret key is zero or not a canonical field element
    #[error("invalid key: secret must be a non-zero canonical field element")]
    InvalidKey,

    /// Blinding factor is not a canonical field element
    #[error("invalid blinding: must be a canonical field element")]
    InvalidBlinding,

    /// Secret key does not derive the note's owner public key
    #[error("wrong owner: secret key does not control note 0x{}", hex::encode(.commitment))]
    WrongOwner { commitment: [u8; 32] },

    /// Nullifier requested before the note was assigned a tree index
    #[error("note 0x{} is not included in the commitment tree", hex::encode(.commitment))]
    NoteNotIncluded { commitment: [u8; 32] },

    /// Path requested for a leaf that was never inserted
    #[error("leaf index {index} out of range (tree holds {len} leaves)")]
    IndexOutOfRange { index: u64, len: u64 },

    /// Tree already holds 2^height leaves
    #[error("commitment tree full: capacity {capacity} reached")]
    TreeFull { capacity: u64 },

    /// Tree height outside the supported range
    #[error("invalid tree height {0}: must be between 1 and 32")]
    InvalidTreeHeight(usize),

    /// Local tree disagrees with the authoritative history
    #[error(
        "merkle root mismatch: local 0x{} vs ledger 0x{}",
        hex::encode(.local),
        hex::encode(.external)
    )]
    RootMismatch {
        local: [u8; 32],
        external: [u8; 32],
    },

    /// Shielded address has the wrong length, bad hex, or a bad key
    #[error("invalid shielded address: {0}")]
    InvalidAddress(&'static str),

    /// Note plaintext could not be sealed
    #[error("note encryption failed")]
    EncryptionFailed,

    /// Ciphertext not addressed to this key, or tampered
    #[error("note decryption failed")]
    DecryptionFailed,
}

/// Result alias for privacy operations
pub type Result<T> = std::result::Result<T, PrivacyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_hashes() {
        let err = PrivacyError::NoteNotIncluded {
            commitment: [0xab; 32],
        };
        assert_eq!(
            err.to_string(),
            format!(
                "note 0x{} is not included in the commitment tree",
                "ab".repeat(32)
            )
        );

        let err = PrivacyError::RootMismatch {
            local: [1u8; 32],
            external: [2u8; 32],
        };
        let msg = err.to_string();
        assert!(msg.contains(&"01".repeat(32)));
        assert!(msg.contains(&"02".repeat(32)));
    }

    #[test]
    fn test_error_equality() {
        assert_eq!(PrivacyError::TreeFull { capacity: 4 }, PrivacyError::TreeFull { capacity: 4 });
        assert_ne!(PrivacyError::InvalidKey, PrivacyError::InvalidAmount);
    }
}
