//! Transaction composition.

pub mod builder;
pub mod types;

pub use builder::{SubmittedTx, TransactionBuilder, TxState};
pub use types::{
    CircuitArity, ExtData, ExternalAddress, OutputSpec, PrivateInputs, Proof, ProofBundle,
    ProofOutput, PublicFlow, PublicInputs, SpendWitness, SubmissionPayload, TransactionRequest,
    TxId,
};
