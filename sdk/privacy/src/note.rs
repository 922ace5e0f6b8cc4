//! Shielded Notes
//!
//! A Note represents value held privately in the pool.
//!
//! ```text
//! Note = {
//!     amount: u64,          // Amount in base units
//!     public_key: [u8; 32], // Owner's public key, Poseidon(sk)
//!     blinding: [u8; 32],   // Random field element hiding the commitment
//!     index: Option<u64>,   // Leaf index in the commitment tree (set on inclusion)
//! }
//! ```
//!
//! Lifecycle: created unspent as a transaction output, spendable once its
//! commitment is included (index assigned), spent once its nullifier is
//! recorded by the ledger.

use std::hash::{Hash, Hasher};

use ark_bls12_381::Fr;
use ark_std::UniformRand;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::commitment::Commitment;
use crate::error::{PrivacyError, Result};
use crate::keys::{PublicKey, SecretKey, sign};
use crate::nullifier::Nullifier;
use crate::poseidon::{canonical_field, field_to_bytes};

/// Note value with overflow protection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NoteValue(pub u64);

impl NoteValue {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(u64::MAX);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Checked addition
    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self)
    }

    /// Checked subtraction
    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self)
    }
}

/// Blinding factor: a canonical field element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Blinding([u8; 32]);

impl Blinding {
    /// Draw a fresh blinding uniformly from the field
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(field_to_bytes(&Fr::rand(rng)))
    }

    /// Validate raw bytes as a blinding factor
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self> {
        canonical_field(&bytes)
            .map(|_| Self(bytes))
            .ok_or(PrivacyError::InvalidBlinding)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// A shielded note representing privately held value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    /// The amount held in this note
    pub amount: NoteValue,
    /// Owner's public key (who can spend this note)
    pub public_key: PublicKey,
    /// Random blinding factor for hiding the commitment
    pub blinding: Blinding,
    /// Leaf index in the commitment tree (None until included)
    pub index: Option<u64>,
}

impl Note {
    /// Validated constructor
    ///
    /// Rejects negative amounts and amounts outside the `u64` note range
    /// with `InvalidAmount`. Draws a fresh blinding when none is given.
    pub fn construct<R: RngCore + CryptoRng>(
        amount: i128,
        public_key: PublicKey,
        blinding: Option<Blinding>,
        rng: &mut R,
    ) -> Result<Self> {
        let amount = u64::try_from(amount).map_err(|_| PrivacyError::InvalidAmount)?;
        let blinding = blinding.unwrap_or_else(|| Blinding::random(rng));

        Ok(Self {
            amount: NoteValue(amount),
            public_key,
            blinding,
            index: None,
        })
    }

    /// Zero-amount placeholder used to pad a transaction to circuit arity
    pub fn zero<R: RngCore + CryptoRng>(public_key: PublicKey, rng: &mut R) -> Self {
        Self {
            amount: NoteValue::ZERO,
            public_key,
            blinding: Blinding::random(rng),
            index: None,
        }
    }

    /// Compute the commitment for this note
    pub fn commitment(&self) -> Commitment {
        Commitment::compute(self.amount.0, &self.public_key, &self.blinding)
    }

    /// Derive the nullifier for spending this note
    ///
    /// Requires the note to be included and `secret_key` to own it.
    pub fn nullifier(&self, secret_key: &SecretKey) -> Result<Nullifier> {
        let commitment = self.commitment();
        let index = self.index.ok_or(PrivacyError::NoteNotIncluded {
            commitment: commitment.0,
        })?;
        self.nullifier_at(index, secret_key)
    }

    /// Nullifier at an explicit index
    ///
    /// Used for padding inputs, which the circuit treats as sitting at index 0.
    pub fn nullifier_at(&self, index: u64, secret_key: &SecretKey) -> Result<Nullifier> {
        let commitment = self.commitment();
        if secret_key.public_key() != self.public_key {
            return Err(PrivacyError::WrongOwner {
                commitment: commitment.0,
            });
        }

        let signature = sign(secret_key, &commitment, index);
        Ok(Nullifier::derive(&commitment, index, &signature))
    }

    /// Set the tree index (called after inclusion)
    pub fn with_index(mut self, index: u64) -> Self {
        self.index = Some(index);
        self
    }

    /// Check if this note has been included in the tree
    pub fn is_included(&self) -> bool {
        self.index.is_some()
    }

    pub fn is_zero(&self) -> bool {
        self.amount == NoteValue::ZERO
    }
}

impl PartialEq for Note {
    fn eq(&self, other: &Self) -> bool {
        self.commitment() == other.commitment()
    }
}

impl Eq for Note {}

impl Hash for Note {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.commitment().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Keypair;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_note_commitment() {
        let mut rng = StdRng::seed_from_u64(1);
        let owner = Keypair::generate(&mut rng);
        let note = Note::construct(1000, owner.public_key(), None, &mut rng).unwrap();

        assert_eq!(note.commitment(), note.commitment(), "commitment should be deterministic");
    }

    #[test]
    fn test_construct_rejects_out_of_range_amounts() {
        let mut rng = StdRng::seed_from_u64(2);
        let owner = Keypair::generate(&mut rng).public_key();

        assert_eq!(
            Note::construct(-1, owner, None, &mut rng).unwrap_err(),
            PrivacyError::InvalidAmount
        );
        assert_eq!(
            Note::construct(i128::from(u64::MAX) + 1, owner, None, &mut rng).unwrap_err(),
            PrivacyError::InvalidAmount
        );
        assert!(Note::construct(i128::from(u64::MAX), owner, None, &mut rng).is_ok());
        assert!(Note::construct(0, owner, None, &mut rng).unwrap().is_zero());
    }

    #[test]
    fn test_blinding_must_be_canonical() {
        assert_eq!(
            Blinding::from_bytes([0xff; 32]).unwrap_err(),
            PrivacyError::InvalidBlinding
        );
        assert!(Blinding::from_bytes([7u8; 32]).is_ok());
    }

    #[test]
    fn test_note_nullifier_requires_index() {
        let mut rng = StdRng::seed_from_u64(3);
        let owner = Keypair::generate(&mut rng);
        let note = Note::construct(1000, owner.public_key(), None, &mut rng).unwrap();

        let err = note.nullifier(owner.secret_key()).unwrap_err();
        assert_eq!(
            err,
            PrivacyError::NoteNotIncluded {
                commitment: note.commitment().0
            }
        );

        let included = note.with_index(42);
        assert!(included.is_included());
        assert!(included.nullifier(owner.secret_key()).is_ok());
    }

    #[test]
    fn test_nullifier_wrong_owner() {
        let mut rng = StdRng::seed_from_u64(4);
        let owner = Keypair::generate(&mut rng);
        let thief = Keypair::generate(&mut rng);
        let note = Note::construct(5, owner.public_key(), None, &mut rng)
            .unwrap()
            .with_index(0);

        assert!(matches!(
            note.nullifier(thief.secret_key()),
            Err(PrivacyError::WrongOwner { .. })
        ));
    }

    #[test]
    fn test_identical_notes_at_distinct_indices() {
        let mut rng = StdRng::seed_from_u64(5);
        let owner = Keypair::generate(&mut rng);
        let blinding = Blinding::random(&mut rng);
        let note = Note::construct(80, owner.public_key(), Some(blinding), &mut rng).unwrap();

        let a = note.clone().with_index(3).nullifier(owner.secret_key()).unwrap();
        let b = note.with_index(4).nullifier(owner.secret_key()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_equality_is_by_commitment() {
        let mut rng = StdRng::seed_from_u64(6);
        let owner = Keypair::generate(&mut rng);
        let blinding = Blinding::random(&mut rng);
        let a = Note::construct(10, owner.public_key(), Some(blinding), &mut rng).unwrap();
        let b = a.clone().with_index(9);
        let c = Note::construct(10, owner.public_key(), None, &mut rng).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_note_serde_keeps_index() {
        let mut rng = StdRng::seed_from_u64(8);
        let owner = Keypair::generate(&mut rng);
        let note = Note::construct(31, owner.public_key(), None, &mut rng)
            .unwrap()
            .with_index(12);

        let json = serde_json::to_string(&note).unwrap();
        let restored: Note = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, note);
        assert_eq!(restored.index, Some(12));
        assert_eq!(restored.amount, NoteValue(31));
    }

    #[test]
    fn test_note_value_checked_ops() {
        let v1 = NoteValue::new(100);
        let v2 = NoteValue::new(50);

        assert_eq!(v1.checked_add(v2), Some(NoteValue::new(150)));
        assert_eq!(v1.checked_sub(v2), Some(NoteValue::new(50)));
        assert_eq!(v2.checked_sub(v1), None);
        assert_eq!(NoteValue::MAX.checked_add(NoteValue::new(1)), None);
    }
}
