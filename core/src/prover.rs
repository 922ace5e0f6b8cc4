//! Proof Backend
//!
//! The engine only prepares inputs; turning them into a proof is the job of
//! an external backend behind [`ProofBackend`].
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Transaction Proof                            │
//! │                                                                  │
//! │  Public Inputs:                                                  │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ • root            (accumulator root the inputs live under) │ │
//! │  │ • publicAmount    (sum(out) - sum(in), field encoded)      │ │
//! │  │ • extDataHash     (binds recipient, fees, ciphertexts)     │ │
//! │  │ • inputNullifiers                                          │ │
//! │  │ • outputCommitments                                        │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! │                                                                  │
//! │  Private Witness:                                                │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ • spending key                                             │ │
//! │  │ • input notes with Merkle paths                            │ │
//! │  │ • output notes                                             │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::future::Future;
use std::time::Duration;

use log::debug;

use shieldpool_privacy::poseidon::{field_to_bytes, signed_to_field};

use crate::error::{PoolError, Result};
use crate::transaction::{CircuitArity, PrivateInputs, Proof, ProofOutput, PublicInputs};

/// Size of a mock proof (a real Groth16 proof over BLS12-381 is ~192 bytes)
pub const MOCK_PROOF_LEN: usize = 256;

const MOCK_PROOF_CONTEXT: &str = "shieldpool 2024 mock proof";

// ============================================================================
// Prover Trait
// ============================================================================

/// Trait for ZK proof generation
pub trait ProofBackend: Send + Sync {
    /// Prove `circuit` over the given inputs. Slow and allowed to fail.
    fn prove(
        &self,
        circuit: CircuitArity,
        private: &PrivateInputs,
        public: &PublicInputs,
    ) -> impl Future<Output = Result<ProofOutput>> + Send;
}

// ============================================================================
// Mock Prover
// ============================================================================

/// Mock prover - checks the witness the way the circuit would, then emits a
/// hash of the public signals as the "proof"
pub struct MockProver {
    /// Simulated proving time in ms
    prove_time_ms: u64,
    /// Corrupt this signal position in the returned signals
    tamper_signal: Option<usize>,
}

impl MockProver {
    pub fn new() -> Self {
        Self {
            prove_time_ms: 0,
            tamper_signal: None,
        }
    }

    /// Create with custom proving time (for testing)
    pub fn with_prove_time(ms: u64) -> Self {
        Self {
            prove_time_ms: ms,
            tamper_signal: None,
        }
    }

    /// A prover whose returned signals disagree with its inputs at `position`
    pub fn tampering(position: usize) -> Self {
        Self {
            prove_time_ms: 0,
            tamper_signal: Some(position),
        }
    }

    /// Check the constraints the transaction circuit enforces
    fn check_witness(
        circuit: CircuitArity,
        private: &PrivateInputs,
        public: &PublicInputs,
    ) -> Result<()> {
        if private.inputs.len() != circuit.inputs()
            || public.input_nullifiers.len() != circuit.inputs()
        {
            return Err(PoolError::Prover(format!(
                "{circuit} expects {} inputs",
                circuit.inputs()
            )));
        }
        if private.outputs.len() != circuit.outputs()
            || public.output_commitments.len() != circuit.outputs()
        {
            return Err(PoolError::Prover(format!(
                "{circuit} expects {} outputs",
                circuit.outputs()
            )));
        }

        for (witness, nullifier) in private.inputs.iter().zip(&public.input_nullifiers) {
            let commitment = witness.note.commitment();
            let derived = witness
                .note
                .nullifier_at(witness.path.index, &private.secret_key)?;
            if derived != *nullifier {
                return Err(PoolError::Prover(format!(
                    "nullifier {nullifier} does not match input {commitment}"
                )));
            }
            // zero-amount inputs skip the membership check
            if !witness.note.is_zero() && !witness.path.verify(&commitment, &public.root) {
                return Err(PoolError::Prover(format!(
                    "input {commitment} is not under root 0x{}",
                    hex::encode(public.root)
                )));
            }
        }

        for (note, commitment) in private.outputs.iter().zip(&public.output_commitments) {
            if note.commitment() != *commitment {
                return Err(PoolError::Prover(format!(
                    "output commitment {commitment} does not match its note"
                )));
            }
        }

        let sum_in: i128 = private.inputs.iter().map(|w| i128::from(w.note.amount.0)).sum();
        let sum_out: i128 = private.outputs.iter().map(|n| i128::from(n.amount.0)).sum();
        if field_to_bytes(&signed_to_field(sum_out - sum_in)) != public.public_amount {
            return Err(PoolError::Prover(
                "sum(inputs) + publicAmount != sum(outputs)".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for MockProver {
    fn default() -> Self {
        Self::new()
    }
}

/// Mock proof bytes for `circuit` over `signals`
pub fn mock_proof(circuit: CircuitArity, signals: &[[u8; 32]]) -> Proof {
    let mut hasher = blake3::Hasher::new_derive_key(MOCK_PROOF_CONTEXT);
    hasher.update(circuit.name().as_bytes());
    for signal in signals {
        hasher.update(signal);
    }

    let mut proof_bytes = Vec::with_capacity(MOCK_PROOF_LEN);
    proof_bytes.extend_from_slice(hasher.finalize().as_bytes());
    proof_bytes.resize(MOCK_PROOF_LEN, 0); // Padding
    Proof(proof_bytes)
}

/// Verify a mock proof against the signals the verifier recomputed
pub fn verify_mock_proof(circuit: CircuitArity, proof: &Proof, signals: &[[u8; 32]]) -> bool {
    signals.len() == circuit.signal_count() && *proof == mock_proof(circuit, signals)
}

impl ProofBackend for MockProver {
    async fn prove(
        &self,
        circuit: CircuitArity,
        private: &PrivateInputs,
        public: &PublicInputs,
    ) -> Result<ProofOutput> {
        if self.prove_time_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.prove_time_ms)).await;
        }

        Self::check_witness(circuit, private, public)?;

        let signals = public.signals();
        let proof = mock_proof(circuit, &signals);
        debug!("Proved {circuit} over {} signals", signals.len());

        let mut public_signals = signals;
        if let Some(signal) = self
            .tamper_signal
            .and_then(|position| public_signals.get_mut(position))
        {
            signal[0] ^= 0xff;
        }

        Ok(ProofOutput {
            proof,
            public_signals,
        })
    }
}
