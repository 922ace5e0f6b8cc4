//! Transaction Builder
//!
//! Drives one transaction from note selection to an observed outcome.
//!
//! ```text
//!   Composing ──build_outputs──> InputsLocked ──assemble_proof_inputs──> ProofReady
//!       ^                             │                                      │
//!       │                          abandon                                package
//!     retry                           v                                      v
//!       │                         Abandoned                             Submitted
//!       │                                                          ┌─────────┴────────┐
//!       └──────────────────── Reverted <──on_reverted──            on_confirmed ──> Confirmed
//! ```
//!
//! A builder is driven by one caller at a time (`&mut self`). Many builders
//! share one [`SharedState`]; real inputs are locked in the nullifier tracker
//! under the builder's id from `InputsLocked` until an outcome is known.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, warn};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use shieldpool_config::{BlindingPolicy, PoolConfig};
use shieldpool_privacy::poseidon::{field_to_bytes, signed_to_field};
use shieldpool_privacy::{
    Keypair, MerklePath, Note, Nullifier, PrivacyError, ShieldedAddress, encrypt_note,
};

use super::types::{
    CircuitArity, ExtData, ExternalAddress, OutputSpec, PrivateInputs, ProofBundle, ProofOutput,
    PublicFlow, PublicInputs, SpendWitness, SubmissionPayload, TransactionRequest, TxId,
};
use crate::error::{PoolError, Result};
use crate::ledger::{Ledger, LedgerEvent};
use crate::storage::nullifiers::HolderId;
use crate::storage::shielded_state::SharedState;

/// Holder ids start at 1; 0 is reserved for marks restored from a checkpoint
static NEXT_BUILDER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxState {
    Composing,
    InputsLocked,
    ProofReady,
    Submitted,
    Confirmed,
    Reverted,
    Abandoned,
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxState::Composing => "composing",
            TxState::InputsLocked => "inputs-locked",
            TxState::ProofReady => "proof-ready",
            TxState::Submitted => "submitted",
            TxState::Confirmed => "confirmed",
            TxState::Reverted => "reverted",
            TxState::Abandoned => "abandoned",
        };
        f.write_str(name)
    }
}

pub struct TransactionBuilder {
    id: HolderId,
    state: TxState,
    keypair: Arc<Keypair>,
    shared: SharedState,
    config: Arc<PoolConfig>,
    /// Real (non-padding) inputs, kept across a retry
    inputs: Vec<Note>,
    /// Nullifiers of `inputs`; these are the pending marks this builder owns
    locked: Vec<Nullifier>,
    circuit: Option<CircuitArity>,
    request: Option<TransactionRequest>,
    /// Every input nullifier in circuit order, padding included
    input_nullifiers: Vec<Nullifier>,
    ext_data: Option<ExtData>,
    bundle: Option<ProofBundle>,
    payload: Option<SubmissionPayload>,
    output_indices: Vec<u64>,
}

/// What a checkpoint keeps of a submitted builder so its outcome can still
/// be applied after a restart
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmittedTx {
    request: TransactionRequest,
    inputs: Vec<Note>,
    locked: Vec<Nullifier>,
    input_nullifiers: Vec<Nullifier>,
    payload: SubmissionPayload,
}

impl SubmittedTx {
    pub fn tx_id(&self) -> TxId {
        self.payload.tx_id
    }

    /// Nullifiers held pending until the outcome is known
    pub fn locked(&self) -> &[Nullifier] {
        &self.locked
    }
}

impl TransactionBuilder {
    pub fn new(keypair: Arc<Keypair>, shared: SharedState, config: Arc<PoolConfig>) -> Self {
        Self {
            id: NEXT_BUILDER_ID.fetch_add(1, Ordering::Relaxed),
            state: TxState::Composing,
            keypair,
            shared,
            config,
            inputs: Vec::new(),
            locked: Vec::new(),
            circuit: None,
            request: None,
            input_nullifiers: Vec::new(),
            ext_data: None,
            bundle: None,
            payload: None,
            output_indices: Vec::new(),
        }
    }

    pub fn id(&self) -> HolderId {
        self.id
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn inputs(&self) -> &[Note] {
        &self.inputs
    }

    /// Nullifiers of the real inputs
    pub fn nullifiers(&self) -> &[Nullifier] {
        &self.locked
    }

    pub fn circuit(&self) -> Option<CircuitArity> {
        self.circuit
    }

    pub fn request(&self) -> Option<&TransactionRequest> {
        self.request.as_ref()
    }

    pub fn bundle(&self) -> Option<&ProofBundle> {
        self.bundle.as_ref()
    }

    pub fn payload(&self) -> Option<&SubmissionPayload> {
        self.payload.as_ref()
    }

    pub fn tx_id(&self) -> Option<TxId> {
        self.payload.as_ref().map(|p| p.tx_id)
    }

    /// Leaf indices assigned to the outputs, in output order
    pub fn output_indices(&self) -> &[u64] {
        &self.output_indices
    }

    /// Snapshot of a builder awaiting its outcome
    pub fn submitted(&self) -> Option<SubmittedTx> {
        if self.state != TxState::Submitted {
            return None;
        }
        Some(SubmittedTx {
            request: self.request.clone()?,
            inputs: self.inputs.clone(),
            locked: self.locked.clone(),
            input_nullifiers: self.input_nullifiers.clone(),
            payload: self.payload.clone()?,
        })
    }

    /// Rebuild a submitted builder from a checkpoint
    ///
    /// The pending marks `from` placed on the inputs are handed to the new
    /// builder, which can then confirm or revert like the original.
    pub async fn resume(
        keypair: Arc<Keypair>,
        shared: SharedState,
        config: Arc<PoolConfig>,
        tx: SubmittedTx,
        from: HolderId,
    ) -> Result<Self> {
        let mut builder = Self::new(keypair, shared, config);
        builder
            .shared
            .nullifiers()
            .write()
            .await
            .reassign(&tx.locked, from, builder.id)?;

        builder.circuit = Some(tx.payload.circuit);
        builder.ext_data = Some(tx.payload.ext_data.clone());
        builder.inputs = tx.inputs;
        builder.locked = tx.locked;
        builder.input_nullifiers = tx.input_nullifiers;
        builder.request = Some(tx.request);
        builder.payload = Some(tx.payload);
        builder.state = TxState::Submitted;

        info!(
            "Builder {} resumed tx {:?} holding {} inputs",
            builder.id,
            builder.tx_id(),
            builder.locked.len()
        );
        Ok(builder)
    }

    fn expect_state(&self, expected: TxState, operation: &'static str) -> Result<()> {
        if self.state != expected {
            return Err(PoolError::InvalidState {
                operation,
                state: self.state.to_string(),
            });
        }
        Ok(())
    }

    fn owned_address(&self) -> ShieldedAddress {
        self.keypair.address()
    }

    // ========================================================================
    // Composing
    // ========================================================================

    /// Choose inputs covering `target`, largest notes first
    ///
    /// Candidates that are spent, pending, not yet included, not owned by
    /// this keypair, or zero-valued are skipped. At most
    /// [`CircuitArity::MAX_INPUTS`] notes are taken.
    pub async fn select_inputs(&mut self, candidates: &[Note], target: u128) -> Result<Vec<Note>> {
        self.expect_state(TxState::Composing, "select inputs")?;

        let secret_key = self.keypair.secret_key();
        let mut seen = HashSet::new();
        let mut spendable: Vec<Note> = {
            let tracker = self.shared.nullifiers().read().await;
            candidates
                .iter()
                .filter(|note| !note.is_zero() && seen.insert(note.commitment()))
                .filter(|note| match note.nullifier(secret_key) {
                    Ok(nf) => !tracker.is_unavailable(&nf),
                    Err(_) => false,
                })
                .cloned()
                .collect()
        };

        spendable.sort_by(|a, b| {
            b.amount
                .0
                .cmp(&a.amount.0)
                .then_with(|| a.index.cmp(&b.index))
        });

        let mut selected = Vec::new();
        let mut covered: u128 = 0;
        for note in spendable.into_iter().take(CircuitArity::MAX_INPUTS) {
            if covered >= target {
                break;
            }
            covered += u128::from(note.amount.0);
            selected.push(note);
        }

        if covered < target {
            return Err(PoolError::InsufficientFunds {
                needed: target,
                available: covered,
            });
        }

        debug!(
            "Builder {} selected {} inputs covering {}",
            self.id,
            selected.len(),
            target
        );
        self.inputs = selected.clone();
        Ok(selected)
    }

    /// Spend exactly `inputs`
    pub async fn use_inputs(&mut self, inputs: Vec<Note>) -> Result<()> {
        self.expect_state(TxState::Composing, "use inputs")?;
        CircuitArity::for_inputs(inputs.len())?;

        let secret_key = self.keypair.secret_key();
        let tracker = self.shared.nullifiers().read().await;
        let mut seen = HashSet::new();
        for note in &inputs {
            let nullifier = note.nullifier(secret_key)?;
            if !seen.insert(nullifier) {
                return Err(PoolError::DoubleSpend {
                    nullifier: nullifier.0,
                });
            }
            if tracker.is_spent(&nullifier) {
                return Err(PoolError::DoubleSpend {
                    nullifier: nullifier.0,
                });
            }
            if tracker.is_pending(&nullifier) {
                return Err(PoolError::NullifierPending {
                    nullifier: nullifier.0,
                });
            }
        }
        drop(tracker);

        self.inputs = inputs;
        Ok(())
    }

    fn check_limits(&self, flow: &PublicFlow) -> Result<()> {
        let limits = &self.config.limits;
        if flow.is_deposit() {
            let amount = flow.public_amount.unsigned_abs();
            if amount > u128::from(limits.max_deposit_amount) {
                return Err(PoolError::DepositLimitExceeded {
                    amount,
                    max: limits.max_deposit_amount,
                });
            }
        }
        if flow.is_withdrawal() {
            match flow.recipient {
                Some(recipient) if !recipient.is_zero() => {}
                _ => return Err(PoolError::MissingRecipient),
            }
            let amount = flow.public_amount.unsigned_abs();
            if flow.is_external_withdrawal && amount < u128::from(limits.min_withdrawal_amount) {
                return Err(PoolError::WithdrawalBelowMinimum {
                    amount,
                    min: limits.min_withdrawal_amount,
                });
            }
        }
        Ok(())
    }

    /// Create output notes, pad both sides to the circuit arity and lock
    /// the real inputs
    ///
    /// Input value not claimed by `outputs` and `flow` goes to a change note
    /// owned by this keypair. Padding notes are zero-valued and self-owned.
    pub async fn build_outputs<R>(
        &mut self,
        outputs: &[OutputSpec],
        flow: PublicFlow,
        rng: &mut R,
    ) -> Result<&TransactionRequest>
    where
        R: RngCore + CryptoRng + Send,
    {
        self.expect_state(TxState::Composing, "build outputs")?;
        self.check_limits(&flow)?;

        let input_sum: u128 = self.inputs.iter().map(|n| u128::from(n.amount.0)).sum();
        let requested: u128 = outputs.iter().map(|o| u128::from(o.amount)).sum();
        let needed = requested as i128 + flow.outflow();
        if needed < 0 {
            // value entering the pool must all land in outputs
            return Err(PoolError::Privacy(PrivacyError::InvalidAmount));
        }
        if (input_sum as i128) < needed {
            return Err(PoolError::InsufficientFunds {
                needed: needed as u128,
                available: input_sum,
            });
        }
        let change = input_sum as i128 - needed;

        let owner = self.owned_address();
        let mut notes = Vec::with_capacity(CircuitArity::OUTPUTS);
        let mut recipients = Vec::with_capacity(CircuitArity::OUTPUTS);
        for spec in outputs {
            notes.push(Note::construct(
                i128::from(spec.amount),
                spec.recipient.public_key,
                spec.blinding,
                rng,
            )?);
            recipients.push(spec.recipient);
        }
        if change > 0 {
            notes.push(Note::construct(change, owner.public_key, None, rng)?);
            recipients.push(owner);
        }
        if notes.len() > CircuitArity::OUTPUTS {
            return Err(PoolError::TooManyOutputs {
                count: notes.len(),
                max: CircuitArity::OUTPUTS,
            });
        }
        while notes.len() < CircuitArity::OUTPUTS {
            notes.push(Note::zero(owner.public_key, rng));
            recipients.push(owner);
        }

        if self.config.privacy.blinding_policy == BlindingPolicy::Unique {
            let mut blindings = HashSet::new();
            if let Some(dup) = notes.iter().find(|n| !blindings.insert(n.blinding)) {
                return Err(PoolError::BlindingReused {
                    commitment: dup.commitment().0,
                });
            }
        }

        let circuit = CircuitArity::for_inputs(self.inputs.len())?;
        let mut inputs = self.inputs.clone();
        while inputs.len() < circuit.inputs() {
            inputs.push(Note::zero(owner.public_key, rng));
        }

        let mut encrypted_outputs = Vec::with_capacity(notes.len());
        for (note, recipient) in notes.iter().zip(&recipients) {
            let key = recipient
                .encryption_key
                .ok_or(PrivacyError::InvalidAddress("recipient has no encryption key"))?;
            encrypted_outputs.push(encrypt_note(note, &key, rng)?);
        }

        let secret_key = self.keypair.secret_key();
        let real = self.inputs.len();
        let mut input_nullifiers = Vec::with_capacity(inputs.len());
        for (i, note) in inputs.iter().enumerate() {
            let nullifier = if i < real {
                note.nullifier(secret_key)?
            } else {
                note.nullifier_at(0, secret_key)?
            };
            input_nullifiers.push(nullifier);
        }

        let ext_data = ExtData {
            recipient: flow.recipient.unwrap_or(ExternalAddress::ZERO),
            ext_amount: -flow.public_amount,
            relayer: flow.relayer.unwrap_or(ExternalAddress::ZERO),
            fee: flow.fee,
            encrypted_outputs,
            is_l1_withdrawal: flow.is_external_withdrawal,
            l1_fee: flow.l1_fee,
        };
        let request = TransactionRequest {
            inputs,
            outputs: notes,
            recipients,
            flow,
        };
        request.check_conservation()?;

        let locked = input_nullifiers[..real].to_vec();
        self.shared
            .nullifiers()
            .write()
            .await
            .mark_pending_all(&locked, self.id)?;

        info!(
            "Builder {} locked {} inputs for {}",
            self.id,
            locked.len(),
            circuit
        );
        self.locked = locked;
        self.input_nullifiers = input_nullifiers;
        self.circuit = Some(circuit);
        self.ext_data = Some(ext_data);
        self.state = TxState::InputsLocked;
        Ok(self.request.insert(request))
    }

    // ========================================================================
    // Proving
    // ========================================================================

    /// Gather paths and public values for the proof backend
    ///
    /// Fails with `RootMismatch` if the local tree does not match the
    /// ledger's last root; nothing is handed to a prover in that case.
    pub async fn assemble_proof_inputs<L: Ledger>(&mut self, ledger: &L) -> Result<&ProofBundle> {
        self.expect_state(TxState::InputsLocked, "assemble proof inputs")?;
        let (Some(request), Some(ext_data), Some(circuit)) =
            (self.request.as_ref(), self.ext_data.as_ref(), self.circuit)
        else {
            return Err(PoolError::InvalidState {
                operation: "assemble proof inputs",
                state: self.state.to_string(),
            });
        };

        let ledger_root = ledger.last_root().await?;

        let real = self.inputs.len();
        let indices: Vec<u64> = request.inputs[..real]
            .iter()
            .map(|note| {
                note.index.ok_or(PrivacyError::NoteNotIncluded {
                    commitment: note.commitment().0,
                })
            })
            .collect::<std::result::Result<_, _>>()?;

        let height = self.shared.height().await;
        let (root, paths) = self.shared.snapshot_paths(&indices).await?;
        if root != ledger_root {
            warn!(
                "Builder {}: local root 0x{} is behind ledger root 0x{}",
                self.id,
                hex::encode(root),
                hex::encode(ledger_root)
            );
            return Err(PrivacyError::RootMismatch {
                local: root,
                external: ledger_root,
            }
            .into());
        }

        let mut witnesses = Vec::with_capacity(request.inputs.len());
        for (note, path) in request.inputs[..real].iter().zip(paths) {
            let commitment = note.commitment();
            if !path.verify(&commitment, &root) {
                return Err(PrivacyError::NoteNotIncluded {
                    commitment: commitment.0,
                }
                .into());
            }
            witnesses.push(SpendWitness {
                note: note.clone(),
                path,
            });
        }
        for note in &request.inputs[real..] {
            witnesses.push(SpendWitness {
                note: note.clone(),
                path: MerklePath::zero(height),
            });
        }

        let public = PublicInputs {
            root,
            public_amount: field_to_bytes(&signed_to_field(ext_data.circuit_amount())),
            ext_data_hash: ext_data.hash(),
            input_nullifiers: self.input_nullifiers.clone(),
            output_commitments: request.outputs.iter().map(Note::commitment).collect(),
        };
        let private = PrivateInputs {
            secret_key: self.keypair.secret_key().clone(),
            inputs: witnesses,
            outputs: request.outputs.clone(),
        };

        debug!(
            "Builder {} assembled {} bundle at root 0x{}",
            self.id,
            circuit,
            hex::encode(root)
        );
        self.state = TxState::ProofReady;
        Ok(self.bundle.insert(ProofBundle {
            circuit,
            public,
            private,
            ext_data: ext_data.clone(),
        }))
    }

    /// Bind a proof to the assembled bundle
    ///
    /// The returned signals must equal the bundle's, position by position.
    pub fn package(&mut self, output: ProofOutput) -> Result<&SubmissionPayload> {
        self.expect_state(TxState::ProofReady, "package proof")?;
        let Some(bundle) = self.bundle.as_ref() else {
            return Err(PoolError::InvalidState {
                operation: "package proof",
                state: self.state.to_string(),
            });
        };

        let expected = bundle.public.signals();
        let mismatch = expected
            .iter()
            .zip(&output.public_signals)
            .position(|(a, b)| a != b)
            .or_else(|| {
                (expected.len() != output.public_signals.len())
                    .then(|| expected.len().min(output.public_signals.len()))
            });
        if let Some(position) = mismatch {
            warn!("Builder {}: proof signal {} does not match bundle", self.id, position);
            return Err(PoolError::SignalMismatch { position });
        }

        let payload = SubmissionPayload {
            tx_id: TxId::from_signals(&expected),
            circuit: bundle.circuit,
            proof: output.proof,
            public: bundle.public.clone(),
            ext_data: bundle.ext_data.clone(),
        };

        info!("Builder {} packaged tx {}", self.id, payload.tx_id);
        self.state = TxState::Submitted;
        Ok(self.payload.insert(payload))
    }

    // ========================================================================
    // Outcomes
    // ========================================================================

    /// Apply a confirmed outcome
    ///
    /// Input nullifiers become confirmed first, then output commitments are
    /// placed at the indices the ledger reported. Commitments the local tree
    /// already holds (from a sync) are checked, not re-inserted.
    pub async fn on_confirmed(&mut self, events: &[LedgerEvent]) -> Result<()> {
        if self.state == TxState::Confirmed {
            return Ok(());
        }
        self.expect_state(TxState::Submitted, "confirm")?;

        {
            let mut tracker = self.shared.nullifiers().write().await;
            for nullifier in &self.input_nullifiers {
                tracker.mark_confirmed(*nullifier);
            }
            for event in events {
                if let LedgerEvent::NullifierSpent { nullifier } = event {
                    tracker.mark_confirmed(*nullifier);
                }
            }
        }

        {
            let mut tree = self.shared.tree().write().await;
            for event in events {
                if let LedgerEvent::Committed { commitment, index } = event {
                    let len = tree.len();
                    if *index == len {
                        tree.insert(commitment)?;
                    } else if *index > len || tree.get(*index) != Some(*commitment) {
                        return Err(PoolError::UnexpectedLeafIndex {
                            expected: len,
                            got: *index,
                        });
                    }
                }
            }
        }

        if let Some(request) = &self.request {
            self.output_indices = request
                .outputs
                .iter()
                .filter_map(|note| {
                    let commitment = note.commitment();
                    events.iter().find_map(|event| match event {
                        LedgerEvent::Committed {
                            commitment: c,
                            index,
                        } if *c == commitment => Some(*index),
                        _ => None,
                    })
                })
                .collect();
        }

        if let Some(tx_id) = self.tx_id() {
            info!(
                "Builder {} confirmed tx {} ({} outputs placed)",
                self.id,
                tx_id,
                self.output_indices.len()
            );
        }
        self.state = TxState::Confirmed;
        Ok(())
    }

    /// Apply a revert or a failed submission
    ///
    /// Releases this builder's pending marks so the inputs are spendable
    /// again. Calling it twice has no further effect.
    pub async fn on_reverted(&mut self) -> Result<()> {
        match self.state {
            TxState::Reverted => return Ok(()),
            TxState::Submitted => {}
            _ => {
                return Err(PoolError::InvalidState {
                    operation: "revert",
                    state: self.state.to_string(),
                });
            }
        }

        let released = self
            .shared
            .nullifiers()
            .write()
            .await
            .release_all(&self.locked, self.id);
        info!("Builder {} reverted, released {} inputs", self.id, released);
        self.state = TxState::Reverted;
        Ok(())
    }

    /// Give up before submission, releasing any pending marks
    ///
    /// Idempotent. Not possible once the payload has been submitted.
    pub async fn abandon(&mut self) -> Result<()> {
        match self.state {
            TxState::Abandoned => return Ok(()),
            TxState::Submitted | TxState::Confirmed => {
                return Err(PoolError::InvalidState {
                    operation: "abandon",
                    state: self.state.to_string(),
                });
            }
            _ => {}
        }

        let released = self
            .shared
            .nullifiers()
            .write()
            .await
            .release_all(&self.locked, self.id);
        debug!("Builder {} abandoned, released {} inputs", self.id, released);
        self.state = TxState::Abandoned;
        Ok(())
    }

    /// Return a reverted builder to `Composing` with the same inputs
    pub fn retry(&mut self) -> Result<()> {
        self.expect_state(TxState::Reverted, "retry")?;
        self.locked.clear();
        self.circuit = None;
        self.request = None;
        self.input_nullifiers.clear();
        self.ext_data = None;
        self.bundle = None;
        self.payload = None;
        self.state = TxState::Composing;
        Ok(())
    }
}

/// A builder dropped between locking its inputs and submission (a cancelled
/// future, a panic while proving) releases its pending marks.
impl Drop for TransactionBuilder {
    fn drop(&mut self) {
        if !matches!(self.state, TxState::InputsLocked | TxState::ProofReady)
            || self.locked.is_empty()
        {
            return;
        }

        let id = self.id;
        let locked = std::mem::take(&mut self.locked);
        let tracker = self.shared.nullifiers().clone();
        if let Ok(mut guard) = tracker.try_write() {
            let released = guard.release_all(&locked, id);
            debug!("Builder {} dropped, released {} inputs", id, released);
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let released = tracker.write().await.release_all(&locked, id);
                    debug!("Builder {} dropped, released {} inputs", id, released);
                });
            }
            Err(_) => warn!(
                "Builder {} dropped outside a runtime; {} inputs stay locked",
                id,
                locked.len()
            ),
        }
    }
}

impl fmt::Debug for TransactionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionBuilder")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("inputs", &self.inputs.len())
            .field("tx_id", &self.tx_id())
            .finish_non_exhaustive()
    }
}
