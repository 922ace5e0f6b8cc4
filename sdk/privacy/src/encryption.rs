//! Note Encryption
//!
//! Encrypts note data for the recipient using ECDH + ChaCha20-Poly1305.
//!
//! ```text
//! Flow:
//! 1. Sender generates ephemeral keypair (epk, esk)
//! 2. Shared secret = ECDH(esk, recipient encryption key)
//! 3. Symmetric key = BLAKE3-KDF(shared_secret || epk)
//! 4. Ciphertext = ChaCha20-Poly1305(key, nonce, amount || blinding)
//! 5. Output = epk || nonce || ciphertext+tag
//! ```
//!
//! The owner public key is not part of the plaintext: a recipient scanning
//! the log rebuilds the note under its own key and keeps it only when the
//! recomputed commitment matches the published one.

use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit},
};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};

use crate::commitment::Commitment;
use crate::error::{PrivacyError, Result};
use crate::keys::{EncryptionKey, Keypair};
use crate::note::{Blinding, Note, NoteValue};

const NOTE_KEY_CONTEXT: &str = "shieldpool 2024 note encryption v1";

/// amount (8) || blinding (32)
const PLAINTEXT_LEN: usize = 8 + 32;

/// An encrypted note (published alongside its commitment)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedNote {
    /// Ephemeral public key for ECDH
    pub ephemeral_pk: [u8; 32],
    /// Nonce for ChaCha20-Poly1305
    pub nonce: [u8; 12],
    /// Encrypted note data with authentication tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedNote {
    /// Size of encrypted note (fixed overhead)
    pub const OVERHEAD: usize = 32 + 12 + 16; // epk + nonce + tag

    /// Total encoded length of a note ciphertext
    pub const ENCODED_LEN: usize = Self::OVERHEAD + PLAINTEXT_LEN;

    /// Flat wire encoding: epk || nonce || ciphertext
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(32 + 12 + self.ciphertext.len());
        bytes.extend_from_slice(&self.ephemeral_pk);
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Parse the flat wire encoding
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::OVERHEAD {
            return Err(PrivacyError::DecryptionFailed);
        }

        let mut ephemeral_pk = [0u8; 32];
        ephemeral_pk.copy_from_slice(&bytes[..32]);
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&bytes[32..44]);

        Ok(Self {
            ephemeral_pk,
            nonce,
            ciphertext: bytes[44..].to_vec(),
        })
    }
}

/// Encrypt a note's amount and blinding for a recipient
pub fn encrypt_note<R: RngCore + CryptoRng>(
    note: &Note,
    recipient: &EncryptionKey,
    rng: &mut R,
) -> Result<EncryptedNote> {
    let ephemeral_secret = EphemeralSecret::random_from_rng(&mut *rng);
    let ephemeral_pk = X25519PublicKey::from(&ephemeral_secret);

    let recipient_key = X25519PublicKey::from(recipient.0);
    let shared_secret = ephemeral_secret.diffie_hellman(&recipient_key);

    let key = derive_note_key(shared_secret.as_bytes(), ephemeral_pk.as_bytes());

    let mut nonce_bytes = [0u8; 12];
    rng.fill_bytes(&mut nonce_bytes);

    let cipher =
        ChaCha20Poly1305::new_from_slice(&key).map_err(|_| PrivacyError::EncryptionFailed)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), serialize_plaintext(note).as_slice())
        .map_err(|_| PrivacyError::EncryptionFailed)?;

    Ok(EncryptedNote {
        ephemeral_pk: *ephemeral_pk.as_bytes(),
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Decrypt a note addressed to `keypair`
///
/// The returned note is owned by `keypair` and carries no index.
pub fn decrypt_note(encrypted: &EncryptedNote, keypair: &Keypair) -> Result<Note> {
    let ephemeral_pk = X25519PublicKey::from(encrypted.ephemeral_pk);
    let shared_secret = keypair.encryption_secret().diffie_hellman(&ephemeral_pk);

    let key = derive_note_key(shared_secret.as_bytes(), &encrypted.ephemeral_pk);

    let cipher =
        ChaCha20Poly1305::new_from_slice(&key).map_err(|_| PrivacyError::DecryptionFailed)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&encrypted.nonce), encrypted.ciphertext.as_slice())
        .map_err(|_| PrivacyError::DecryptionFailed)?;

    let (amount, blinding) = deserialize_plaintext(&plaintext)?;

    Ok(Note {
        amount,
        public_key: keypair.public_key(),
        blinding,
        index: None,
    })
}

/// Try to decrypt a note (scan mode - for wallet scanning)
///
/// Returns the note, indexed at `index`, if decryption succeeds and the
/// recomputed commitment matches `expected`.
pub fn try_decrypt_note(
    encrypted: &EncryptedNote,
    keypair: &Keypair,
    expected: &Commitment,
    index: u64,
) -> Option<Note> {
    let note = decrypt_note(encrypted, keypair).ok()?;
    (note.commitment() == *expected).then(|| note.with_index(index))
}

/// Derive the symmetric key from the shared secret
fn derive_note_key(shared_secret: &[u8], ephemeral_pk: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(NOTE_KEY_CONTEXT);
    hasher.update(shared_secret);
    hasher.update(ephemeral_pk);
    *hasher.finalize().as_bytes()
}

fn serialize_plaintext(note: &Note) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(PLAINTEXT_LEN);
    bytes.extend_from_slice(&note.amount.0.to_le_bytes());
    bytes.extend_from_slice(note.blinding.as_bytes());
    bytes
}

fn deserialize_plaintext(bytes: &[u8]) -> Result<(NoteValue, Blinding)> {
    if bytes.len() != PLAINTEXT_LEN {
        return Err(PrivacyError::DecryptionFailed);
    }

    let mut amount = [0u8; 8];
    amount.copy_from_slice(&bytes[..8]);
    let mut blinding = [0u8; 32];
    blinding.copy_from_slice(&bytes[8..]);

    let blinding = Blinding::from_bytes(blinding).map_err(|_| PrivacyError::DecryptionFailed)?;
    Ok((NoteValue(u64::from_le_bytes(amount)), blinding))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn setup() -> (StdRng, Keypair, Note) {
        let mut rng = StdRng::seed_from_u64(11);
        let recipient = Keypair::generate(&mut rng);
        let note = Note::construct(1000, recipient.public_key(), None, &mut rng).unwrap();
        (rng, recipient, note)
    }

    #[test]
    fn test_encrypt_decrypt_note() {
        let (mut rng, recipient, note) = setup();

        let encrypted = encrypt_note(&note, &recipient.encryption_key(), &mut rng).unwrap();
        assert_eq!(encrypted.to_bytes().len(), EncryptedNote::ENCODED_LEN);

        let decrypted = decrypt_note(&encrypted, &recipient).unwrap();
        assert_eq!(decrypted.amount, note.amount);
        assert_eq!(decrypted.blinding, note.blinding);
        assert_eq!(decrypted.commitment(), note.commitment());
    }

    #[test]
    fn test_wrong_key_fails() {
        let (mut rng, recipient, note) = setup();
        let stranger = Keypair::generate(&mut rng);

        let encrypted = encrypt_note(&note, &recipient.encryption_key(), &mut rng).unwrap();

        assert_eq!(
            decrypt_note(&encrypted, &stranger).unwrap_err(),
            PrivacyError::DecryptionFailed
        );
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let (mut rng, recipient, note) = setup();

        let mut encrypted = encrypt_note(&note, &recipient.encryption_key(), &mut rng).unwrap();
        encrypted.ciphertext[0] ^= 1;

        assert!(decrypt_note(&encrypted, &recipient).is_err());
    }

    #[test]
    fn test_wire_roundtrip() {
        let (mut rng, recipient, note) = setup();
        let encrypted = encrypt_note(&note, &recipient.encryption_key(), &mut rng).unwrap();

        let parsed = EncryptedNote::from_bytes(&encrypted.to_bytes()).unwrap();
        assert_eq!(parsed, encrypted);
        assert!(EncryptedNote::from_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_commitment_verification() {
        let (mut rng, recipient, note) = setup();
        let commitment = note.commitment();

        let encrypted = encrypt_note(&note, &recipient.encryption_key(), &mut rng).unwrap();

        let found = try_decrypt_note(&encrypted, &recipient, &commitment, 7).unwrap();
        assert_eq!(found.index, Some(7));

        assert!(try_decrypt_note(&encrypted, &recipient, &Commitment([0u8; 32]), 7).is_none());
    }
}
