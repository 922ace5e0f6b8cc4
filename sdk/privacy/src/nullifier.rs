//! Nullifiers
//!
//! ```text
//! signature = Poseidon(secret_key, commitment, index)
//! Nullifier = Poseidon(commitment, index, signature)
//! ```
//!
//! Binding the tree index makes two otherwise identical notes at different
//! positions yield different nullifiers. Only the owner can produce the
//! signature, so only the owner can compute the nullifier.
//!
//! Once a nullifier is published, the corresponding note cannot be spent again.

use std::fmt;

use ark_bls12_381::Fr;
use serde::{Deserialize, Serialize};

use crate::commitment::Commitment;
use crate::keys::Signature;
use crate::poseidon::{bytes_to_field, field_to_bytes, hash_fields};

/// A nullifier (32 bytes) - unique tag for a spent note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Nullifier(pub [u8; 32]);

impl Nullifier {
    /// Derive from a note commitment, its tree index and the owner's signature
    pub fn derive(commitment: &Commitment, index: u64, signature: &Signature) -> Self {
        let result = hash_fields(&[
            commitment.to_field(),
            Fr::from(index),
            bytes_to_field(&signature.0),
        ]);
        Self::from_field(result)
    }

    /// Create from field element
    pub fn from_field(f: Fr) -> Self {
        Self(field_to_bytes(&f))
    }

    /// Convert to field element
    pub fn to_field(&self) -> Fr {
        bytes_to_field(&self.0)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl AsRef<[u8]> for Nullifier {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Nullifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}
