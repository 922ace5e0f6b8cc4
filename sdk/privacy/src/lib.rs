//! Shielded Pool Privacy SDK
//!
//! Note-based privacy primitives for a shielded value pool.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Shielded Transaction                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌───────────────────────┐ │
//! │  │  Nullifiers  │  │ Commitments  │  │   Encrypted Outputs   │ │
//! │  │  (spent)     │  │  (new notes) │  │   (for recipients)    │ │
//! │  └──────────────┘  └──────────────┘  └───────────────────────┘ │
//! │         │                 │                     │               │
//! │         ▼                 ▼                     ▼               │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │              ZK Proof (external backend)                 │   │
//! │  │  • Inputs are included under a known root                │   │
//! │  │  • Valid nullifier derivation                            │   │
//! │  │  • Σ inputs + publicAmount = Σ outputs                   │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All hashing is Poseidon over BLS12-381 Fr (see [`poseidon`]).

pub mod commitment;
pub mod encryption;
pub mod error;
pub mod keys;
pub mod merkle;
pub mod note;
pub mod nullifier;
pub mod poseidon;

pub use commitment::Commitment;
pub use encryption::{EncryptedNote, decrypt_note, encrypt_note, try_decrypt_note};
pub use error::{PrivacyError, Result};
pub use keys::{EncryptionKey, Keypair, PublicKey, SecretKey, ShieldedAddress, Signature, sign};
pub use merkle::{
    DEFAULT_TREE_HEIGHT, MAX_TREE_HEIGHT, MerklePath, MerkleTree, RootHistory, hash_pair,
};
pub use note::{Blinding, Note, NoteValue};
pub use nullifier::Nullifier;
