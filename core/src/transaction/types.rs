//! Transaction data types: requests, external data, proof inputs and the
//! submission payload.
//!
//! ```text
//! public signals (in order):
//!   root | publicAmount | extDataHash | nullifier[0..Nin] | commitment[0..Nout]
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use shieldpool_privacy::poseidon::reduce_digest;
use shieldpool_privacy::{
    Blinding, Commitment, EncryptedNote, MerklePath, Note, Nullifier, SecretKey, ShieldedAddress,
};

use crate::error::{PoolError, Result};

const EXT_DATA_CONTEXT: &str = "shieldpool 2024 ext data hash";
const TX_ID_CONTEXT: &str = "shieldpool 2024 transaction id";

/// Transaction identifier, derived from the public signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(pub [u8; 32]);

impl TxId {
    pub fn from_signals(signals: &[[u8; 32]]) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key(TX_ID_CONTEXT);
        for signal in signals {
            hasher.update(signal);
        }
        Self(*hasher.finalize().as_bytes())
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Address outside the pool (20 bytes)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalAddress(pub [u8; 20]);

impl ExternalAddress {
    pub const ZERO: Self = Self([0u8; 20]);

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for ExternalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for ExternalAddress {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        let mut out = [0u8; 20];
        hex::decode_to_slice(digits, &mut out)
            .map_err(|e| PoolError::InvalidExternalAddress(format!("{s}: {e}")))?;
        Ok(Self(out))
    }
}

/// Fixed circuit shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitArity {
    /// 2 inputs, 2 outputs
    Transaction2,
    /// 16 inputs, 2 outputs
    Transaction16,
}

impl CircuitArity {
    pub const MAX_INPUTS: usize = 16;
    pub const OUTPUTS: usize = 2;

    /// Smallest circuit that fits `inputs` real inputs
    pub fn for_inputs(inputs: usize) -> Result<Self> {
        match inputs {
            0..=2 => Ok(Self::Transaction2),
            3..=16 => Ok(Self::Transaction16),
            count => Err(PoolError::TooManyInputs {
                count,
                max: Self::MAX_INPUTS,
            }),
        }
    }

    pub fn inputs(&self) -> usize {
        match self {
            Self::Transaction2 => 2,
            Self::Transaction16 => 16,
        }
    }

    pub fn outputs(&self) -> usize {
        Self::OUTPUTS
    }

    /// Number of public signals the circuit exposes
    pub fn signal_count(&self) -> usize {
        3 + self.inputs() + self.outputs()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Transaction2 => "transaction2",
            Self::Transaction16 => "transaction16",
        }
    }
}

impl fmt::Display for CircuitArity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A requested output: amount, recipient, optional fixed blinding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSpec {
    pub amount: u64,
    pub recipient: ShieldedAddress,
    pub blinding: Option<Blinding>,
}

impl OutputSpec {
    pub fn new(amount: u64, recipient: ShieldedAddress) -> Self {
        Self {
            amount,
            recipient,
            blinding: None,
        }
    }

    pub fn with_blinding(mut self, blinding: Blinding) -> Self {
        self.blinding = Some(blinding);
        self
    }
}

/// Value crossing the pool boundary
///
/// `public_amount` is positive when value leaves the pool (withdrawal) and
/// negative when it enters (deposit).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicFlow {
    pub public_amount: i128,
    pub recipient: Option<ExternalAddress>,
    pub is_external_withdrawal: bool,
    pub relayer: Option<ExternalAddress>,
    pub fee: u64,
    pub l1_fee: u64,
}

impl PublicFlow {
    pub fn deposit(amount: u64) -> Self {
        Self {
            public_amount: -i128::from(amount),
            ..Self::default()
        }
    }

    pub fn transfer() -> Self {
        Self::default()
    }

    pub fn withdraw(amount: u64, recipient: ExternalAddress, is_external_withdrawal: bool) -> Self {
        Self {
            public_amount: i128::from(amount),
            recipient: Some(recipient),
            is_external_withdrawal,
            ..Self::default()
        }
    }

    /// Pay `fee` to a relayer
    pub fn with_relayer(mut self, relayer: ExternalAddress, fee: u64) -> Self {
        self.relayer = Some(relayer);
        self.fee = fee;
        self
    }

    /// Fee for the bridge-side unwrapper of a cross-domain withdrawal
    pub fn with_l1_fee(mut self, l1_fee: u64) -> Self {
        self.l1_fee = l1_fee;
        self
    }

    pub fn is_deposit(&self) -> bool {
        self.public_amount < 0
    }

    pub fn is_withdrawal(&self) -> bool {
        self.public_amount > 0
    }

    /// Value the spent notes must cover beyond the outputs
    pub fn outflow(&self) -> i128 {
        self.public_amount + i128::from(self.fee)
    }
}

/// A composed transaction
///
/// Conservation: `sum(inputs) == sum(outputs) + public_amount + fee`.
/// Padding notes are included once the builder has fixed the arity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub inputs: Vec<Note>,
    pub outputs: Vec<Note>,
    /// Parallel to `outputs`; the address each ciphertext is sealed to
    pub recipients: Vec<ShieldedAddress>,
    pub flow: PublicFlow,
}

impl TransactionRequest {
    pub fn input_sum(&self) -> u128 {
        self.inputs.iter().map(|n| u128::from(n.amount.0)).sum()
    }

    pub fn output_sum(&self) -> u128 {
        self.outputs.iter().map(|n| u128::from(n.amount.0)).sum()
    }

    pub fn check_conservation(&self) -> Result<()> {
        let needed = self.output_sum() as i128 + self.flow.outflow();
        let available = self.input_sum() as i128;
        if needed != available {
            return Err(PoolError::InsufficientFunds {
                needed: needed.max(0) as u128,
                available: available as u128,
            });
        }
        Ok(())
    }
}

/// Data bound into the proof through its hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtData {
    pub recipient: ExternalAddress,
    /// Net value entering the pool: `sum(outputs) - sum(inputs) + fee`
    pub ext_amount: i128,
    pub relayer: ExternalAddress,
    pub fee: u64,
    pub encrypted_outputs: Vec<EncryptedNote>,
    pub is_l1_withdrawal: bool,
    pub l1_fee: u64,
}

impl ExtData {
    /// BLAKE3 over the canonical encoding, reduced into the field
    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_derive_key(EXT_DATA_CONTEXT);
        hasher.update(&self.recipient.0);
        hasher.update(&self.ext_amount.to_le_bytes());
        hasher.update(&self.relayer.0);
        hasher.update(&self.fee.to_le_bytes());
        hasher.update(&(self.encrypted_outputs.len() as u32).to_le_bytes());
        for output in &self.encrypted_outputs {
            let bytes = output.to_bytes();
            hasher.update(&(bytes.len() as u32).to_le_bytes());
            hasher.update(&bytes);
        }
        hasher.update(&[u8::from(self.is_l1_withdrawal)]);
        hasher.update(&self.l1_fee.to_le_bytes());
        reduce_digest(hasher.finalize().as_bytes())
    }

    /// Value the circuit sees: `ext_amount - fee`
    pub fn circuit_amount(&self) -> i128 {
        self.ext_amount - i128::from(self.fee)
    }
}

/// Values disclosed on-chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicInputs {
    pub root: [u8; 32],
    /// `sum(outputs) - sum(inputs)` in the field
    pub public_amount: [u8; 32],
    pub ext_data_hash: [u8; 32],
    pub input_nullifiers: Vec<Nullifier>,
    pub output_commitments: Vec<Commitment>,
}

impl PublicInputs {
    pub fn signals(&self) -> Vec<[u8; 32]> {
        let mut signals =
            Vec::with_capacity(3 + self.input_nullifiers.len() + self.output_commitments.len());
        signals.push(self.root);
        signals.push(self.public_amount);
        signals.push(self.ext_data_hash);
        signals.extend(self.input_nullifiers.iter().map(|nf| nf.0));
        signals.extend(self.output_commitments.iter().map(|c| c.0));
        signals
    }
}

/// One spent note and its membership path
#[derive(Debug, Clone)]
pub struct SpendWitness {
    pub note: Note,
    pub path: MerklePath,
}

/// Values kept secret
#[derive(Debug, Clone)]
pub struct PrivateInputs {
    pub secret_key: SecretKey,
    pub inputs: Vec<SpendWitness>,
    pub outputs: Vec<Note>,
}

/// Everything handed to the proof backend
#[derive(Debug, Clone)]
pub struct ProofBundle {
    pub circuit: CircuitArity,
    pub public: PublicInputs,
    pub private: PrivateInputs,
    pub ext_data: ExtData,
}

/// Opaque proof bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof(#[serde(with = "hex::serde")] pub Vec<u8>);

/// What the proof backend returns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofOutput {
    pub proof: Proof,
    pub public_signals: Vec<[u8; 32]>,
}

/// Calldata for the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionPayload {
    pub tx_id: TxId,
    pub circuit: CircuitArity,
    pub proof: Proof,
    pub public: PublicInputs,
    pub ext_data: ExtData,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext_data() -> ExtData {
        ExtData {
            recipient: ExternalAddress([1u8; 20]),
            ext_amount: -50,
            relayer: ExternalAddress::ZERO,
            fee: 0,
            encrypted_outputs: vec![],
            is_l1_withdrawal: false,
            l1_fee: 0,
        }
    }

    #[test]
    fn test_arity_selection() {
        assert_eq!(CircuitArity::for_inputs(0).unwrap(), CircuitArity::Transaction2);
        assert_eq!(CircuitArity::for_inputs(2).unwrap(), CircuitArity::Transaction2);
        assert_eq!(CircuitArity::for_inputs(3).unwrap(), CircuitArity::Transaction16);
        assert_eq!(CircuitArity::for_inputs(16).unwrap().inputs(), 16);
        assert!(matches!(
            CircuitArity::for_inputs(17),
            Err(PoolError::TooManyInputs { count: 17, max: 16 })
        ));
        assert_eq!(CircuitArity::Transaction2.signal_count(), 7);
    }

    #[test]
    fn test_ext_data_hash_binds_fields() {
        let base = ext_data();
        let hash = base.hash();
        assert_eq!(hash, ext_data().hash());

        let mut other = ext_data();
        other.recipient = ExternalAddress([2u8; 20]);
        assert_ne!(other.hash(), hash);

        let mut other = ext_data();
        other.is_l1_withdrawal = true;
        assert_ne!(other.hash(), hash);

        let mut other = ext_data();
        other.l1_fee = 1;
        assert_ne!(other.hash(), hash);
    }

    #[test]
    fn test_signal_order() {
        let public = PublicInputs {
            root: [1u8; 32],
            public_amount: [2u8; 32],
            ext_data_hash: [3u8; 32],
            input_nullifiers: vec![Nullifier([4u8; 32]), Nullifier([5u8; 32])],
            output_commitments: vec![Commitment([6u8; 32]), Commitment([7u8; 32])],
        };

        let signals = public.signals();
        assert_eq!(signals.len(), 7);
        for (i, signal) in signals.iter().enumerate() {
            assert_eq!(signal[0], i as u8 + 1);
        }
        assert_ne!(TxId::from_signals(&signals), TxId::from_signals(&signals[1..]));
    }

    #[test]
    fn test_external_address_parse() {
        let addr: ExternalAddress = "0x0101010101010101010101010101010101010101".parse().unwrap();
        assert_eq!(addr, ExternalAddress([1u8; 20]));
        assert!("0x1234".parse::<ExternalAddress>().is_err());
        assert!(ExternalAddress::ZERO.is_zero());
    }

    #[test]
    fn test_flow_signs() {
        assert_eq!(PublicFlow::deposit(80).public_amount, -80);
        assert!(PublicFlow::deposit(80).is_deposit());

        let withdraw = PublicFlow::withdraw(50, ExternalAddress([9u8; 20]), false)
            .with_relayer(ExternalAddress([8u8; 20]), 3);
        assert!(withdraw.is_withdrawal());
        assert_eq!(withdraw.outflow(), 53);
    }
}
