//! Key Agreement
//!
//! Deterministic key derivation from a single secret scalar.
//!
//! ```text
//! secret_key (sk)        random non-zero field element
//!   ├── public_key       Poseidon(sk)           owns notes
//!   ├── encryption key   X25519(BLAKE3-KDF(sk)) receives note ciphertexts
//!   └── signature        Poseidon(sk, commitment, index)
//! ```
//!
//! A [`ShieldedAddress`] is the public view: the owning public key plus,
//! optionally, the X25519 key that note ciphertexts are sealed to.

use std::fmt;
use std::str::FromStr;

use ark_bls12_381::Fr;
use ark_ff::Zero;
use ark_std::UniformRand;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::commitment::Commitment;
use crate::error::{PrivacyError, Result};
use crate::poseidon::{bytes_to_field, canonical_field, field_to_bytes, hash_fields};

/// KDF context for the note encryption secret
const ENCRYPTION_KEY_CONTEXT: &str = "shieldpool 2024 note encryption secret";

/// Encoded address length: public key || encryption key
pub const ADDRESS_LEN: usize = 64;

/// Spending secret - a non-zero canonical field element
///
/// Never printed: `Debug` is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    /// Draw a secret uniformly from the non-zero scalar field
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        loop {
            let f = Fr::rand(rng);
            if !f.is_zero() {
                return Self(field_to_bytes(&f));
            }
        }
    }

    /// Validate raw bytes as a secret key
    ///
    /// Fails with `InvalidKey` for zero or out-of-field values.
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self> {
        match canonical_field(&bytes) {
            Some(f) if !f.is_zero() => Ok(Self(bytes)),
            _ => Err(PrivacyError::InvalidKey),
        }
    }

    /// Raw bytes (handle with care)
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub(crate) fn to_field(&self) -> Fr {
        bytes_to_field(&self.0)
    }

    /// Derive the owning public key: Poseidon(sk)
    pub fn public_key(&self) -> PublicKey {
        PublicKey(field_to_bytes(&hash_fields(&[self.to_field()])))
    }

    fn encryption_secret(&self) -> StaticSecret {
        let derived = blake3::derive_key(ENCRYPTION_KEY_CONTEXT, &self.0);
        StaticSecret::from(derived)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

/// Note owner public key (a field element)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    /// Validate raw bytes as a public key
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self> {
        canonical_field(&bytes)
            .map(|_| Self(bytes))
            .ok_or(PrivacyError::InvalidKey)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// X25519 public key that note ciphertexts are sealed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncryptionKey(pub [u8; 32]);

impl EncryptionKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Spend authorization tag bound into the nullifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(pub [u8; 32]);

/// Sign a (commitment, index) pair: Poseidon(sk, commitment, index)
pub fn sign(secret_key: &SecretKey, commitment: &Commitment, index: u64) -> Signature {
    let result = hash_fields(&[
        secret_key.to_field(),
        commitment.to_field(),
        Fr::from(index),
    ]);
    Signature(field_to_bytes(&result))
}

/// A shielded identity: secret, owning key and encryption key
pub struct Keypair {
    secret_key: SecretKey,
    public_key: PublicKey,
    encryption_secret: StaticSecret,
    encryption_key: EncryptionKey,
}

impl Keypair {
    /// Generate a fresh identity
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self::from_secret(SecretKey::random(rng))
    }

    /// Restore an identity from its secret
    pub fn from_secret(secret_key: SecretKey) -> Self {
        let public_key = secret_key.public_key();
        let encryption_secret = secret_key.encryption_secret();
        let encryption_key = EncryptionKey(X25519PublicKey::from(&encryption_secret).to_bytes());

        Self {
            secret_key,
            public_key,
            encryption_secret,
            encryption_key,
        }
    }

    /// Restore from raw secret bytes, rejecting malformed secrets
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Result<Self> {
        SecretKey::from_bytes(bytes).map(Self::from_secret)
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn encryption_key(&self) -> EncryptionKey {
        self.encryption_key
    }

    pub(crate) fn encryption_secret(&self) -> &StaticSecret {
        &self.encryption_secret
    }

    /// The shareable address for this identity
    pub fn address(&self) -> ShieldedAddress {
        ShieldedAddress {
            public_key: self.public_key,
            encryption_key: Some(self.encryption_key),
        }
    }

    /// Sign a note position with this identity's secret
    pub fn sign(&self, commitment: &Commitment, index: u64) -> Signature {
        sign(&self.secret_key, commitment, index)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key)
            .field("encryption_key", &self.encryption_key)
            .finish_non_exhaustive()
    }
}

/// Recipient address
///
/// ```text
/// bytes 0..32   owner public key (field element, little-endian)
/// bytes 32..64  X25519 encryption key, all zero when absent
/// ```
///
/// Text form is `0x` followed by 128 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShieldedAddress {
    pub public_key: PublicKey,
    pub encryption_key: Option<EncryptionKey>,
}

impl ShieldedAddress {
    /// Address without an encryption key (cannot receive ciphertexts)
    pub fn from_public_key(public_key: PublicKey) -> Self {
        Self {
            public_key,
            encryption_key: None,
        }
    }

    /// Fixed-width binary encoding
    pub fn to_bytes(&self) -> [u8; ADDRESS_LEN] {
        let mut out = [0u8; ADDRESS_LEN];
        out[..32].copy_from_slice(&self.public_key.0);
        if let Some(key) = &self.encryption_key {
            out[32..].copy_from_slice(&key.0);
        }
        out
    }

    /// Decode the fixed-width binary form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ADDRESS_LEN {
            return Err(PrivacyError::InvalidAddress("expected 64 bytes"));
        }

        let mut pk = [0u8; 32];
        pk.copy_from_slice(&bytes[..32]);
        let public_key = PublicKey::from_bytes(pk)
            .map_err(|_| PrivacyError::InvalidAddress("public key is not a field element"))?;

        let mut ek = [0u8; 32];
        ek.copy_from_slice(&bytes[32..]);
        let encryption_key = (ek != [0u8; 32]).then_some(EncryptionKey(ek));

        Ok(Self {
            public_key,
            encryption_key,
        })
    }

    /// Text encoding
    pub fn encode(&self) -> String {
        format!("0x{}", hex::encode(self.to_bytes()))
    }
}

impl fmt::Display for ShieldedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for ShieldedAddress {
    type Err = PrivacyError;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        let bytes =
            hex::decode(digits).map_err(|_| PrivacyError::InvalidAddress("not valid hex"))?;
        Self::from_bytes(&bytes)
    }
}
