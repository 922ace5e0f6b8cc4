//! Poseidon Hash
//!
//! Every hash in the pool (public keys, commitments, signatures,
//! nullifiers, tree nodes) is a Poseidon sponge over the BLS12-381
//! scalar field with one shared parameter set.
//!
//! ```text
//! Field: BLS12-381 Fr (255 bits)
//! Rate: 2, Capacity: 1
//! Rounds: 8 full, 57 partial, alpha = 5
//! ```
//!
//! Field elements cross crate boundaries as 32-byte little-endian
//! canonical encodings.

use std::sync::OnceLock;

use ark_bls12_381::Fr;
use ark_crypto_primitives::sponge::{
    CryptographicSponge,
    poseidon::{PoseidonConfig, PoseidonSponge, find_poseidon_ark_and_mds},
};
use ark_ff::{BigInteger, PrimeField};

static POSEIDON_CONFIG: OnceLock<PoseidonConfig<Fr>> = OnceLock::new();

/// Shared Poseidon parameters, generated on first use
pub fn poseidon_config() -> &'static PoseidonConfig<Fr> {
    POSEIDON_CONFIG.get_or_init(|| {
        let prime_bits: u64 = 255;
        let rate: usize = 2;
        let capacity: usize = 1;
        let full_rounds: u64 = 8;
        let partial_rounds: u64 = 57;
        let alpha: u64 = 5;
        let skip_matrices: u64 = 0;

        let (ark, mds) = find_poseidon_ark_and_mds::<Fr>(
            prime_bits,
            rate,
            full_rounds,
            partial_rounds,
            skip_matrices,
        );

        PoseidonConfig::new(
            full_rounds as usize,
            partial_rounds as usize,
            alpha,
            mds,
            ark,
            rate,
            capacity,
        )
    })
}

/// Poseidon over an ordered list of field elements
pub fn hash_fields(inputs: &[Fr]) -> Fr {
    let mut sponge = PoseidonSponge::new(poseidon_config());
    for input in inputs {
        sponge.absorb(input);
    }
    sponge.squeeze_field_elements::<Fr>(1)[0]
}

/// Poseidon over 32-byte encodings, returning a 32-byte encoding
pub fn hash_bytes(inputs: &[&[u8; 32]]) -> [u8; 32] {
    let fields: Vec<Fr> = inputs.iter().map(|b| bytes_to_field(b)).collect();
    field_to_bytes(&hash_fields(&fields))
}

/// Little-endian 32-byte encoding of a field element
pub fn field_to_bytes(f: &Fr) -> [u8; 32] {
    let bytes = f.into_bigint().to_bytes_le();
    let mut arr = [0u8; 32];
    arr[..bytes.len()].copy_from_slice(&bytes);
    arr
}

/// Decode 32 bytes, reducing modulo the field order
pub fn bytes_to_field(bytes: &[u8; 32]) -> Fr {
    Fr::from_le_bytes_mod_order(bytes)
}

/// Decode 32 bytes only if they already encode a field element
pub fn canonical_field(bytes: &[u8; 32]) -> Option<Fr> {
    let f = Fr::from_le_bytes_mod_order(bytes);
    (field_to_bytes(&f) == *bytes).then_some(f)
}

/// Embed a signed integer, wrapping negatives around the modulus
pub fn signed_to_field(value: i128) -> Fr {
    let magnitude = Fr::from(value.unsigned_abs());
    if value < 0 { -magnitude } else { magnitude }
}

/// Reduce an arbitrary 32-byte digest into a canonical field encoding
pub fn reduce_digest(digest: &[u8; 32]) -> [u8; 32] {
    field_to_bytes(&bytes_to_field(digest))
}
