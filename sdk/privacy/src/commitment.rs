//! Note Commitments
//!
//! ```text
//! Commitment = Poseidon(amount, public_key, blinding)
//! ```
//!
//! Hides the note contents while binding the owner and the amount. The
//! commitment is also the note's identity: two notes are the same note
//! exactly when their commitments are equal.

use std::fmt;

use ark_bls12_381::Fr;
use serde::{Deserialize, Serialize};

use crate::keys::PublicKey;
use crate::note::Blinding;
use crate::poseidon::{bytes_to_field, field_to_bytes, hash_fields};

/// A note commitment (32 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Commitment(pub [u8; 32]);

impl Commitment {
    /// Commit to a note's contents
    pub fn compute(amount: u64, public_key: &PublicKey, blinding: &Blinding) -> Self {
        let result = hash_fields(&[
            Fr::from(amount),
            bytes_to_field(public_key.as_bytes()),
            bytes_to_field(blinding.as_bytes()),
        ]);
        Self::from_field(result)
    }

    /// Create commitment from field element
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

impl AsRef<[u8]> for Commitment {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}
