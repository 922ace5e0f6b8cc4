//! Shielded Pool
//!
//! The operation surface over the builder:
//!
//! ```text
//!   deposit / transfer / withdraw
//!            │
//!            v
//!   ┌─────────────── compose lock ───────────────┐
//!   sync ─> select ─> build_outputs ─> assemble ─┴─> prove ─> package
//!                                                                 │
//!              park in-flight, ledger.submit <────────────────────┘
//!                              │
//!             poll outcome (confirmation deadline)
//!              ├─ Confirmed ─> on_confirmed, sync + scan, checkpoint
//!              ├─ Reverted  ─> on_reverted, prune spent inputs, SubmissionFailed
//!              └─ timeout   ─> builder stays in-flight until resolve()
//! ```
//!
//! A builder dropped before submission releases its inputs on drop, so a
//! cancelled call never strands them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rand::rngs::OsRng;
use tokio::sync::Mutex;

use shieldpool_config::PoolConfig;
use shieldpool_privacy::{
    Commitment, Keypair, Note, Nullifier, PrivacyError, ShieldedAddress, try_decrypt_note,
};

use crate::bridge::{BridgeOutcome, WithdrawalIntent, WithdrawalTracker};
use crate::error::{PoolError, Result};
use crate::ledger::{CommitmentRecord, Ledger, TxHandle, TxOutcome};
use crate::prover::ProofBackend;
use crate::storage::nullifiers::{NullifierStatus, RESTORED_HOLDER};
use crate::storage::{SharedState, WalletCheckpoint};
use crate::transaction::{
    ExternalAddress, OutputSpec, PublicFlow, SubmittedTx, TransactionBuilder, TxId, TxState,
};

/// Re-syncs allowed when a sibling transaction lands between our sync and
/// proof assembly
const ROOT_RESYNCS: usize = 3;

/// Result of a confirmed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_id: TxId,
    /// Nullifiers of the real inputs
    pub nullifiers: Vec<Nullifier>,
    /// Output commitments, padding included
    pub commitments: Vec<Commitment>,
    /// Leaf index of each output
    pub output_indices: Vec<u64>,
}

pub struct ShieldedPool<L: Ledger, P: ProofBackend> {
    ledger: Arc<L>,
    prover: Arc<P>,
    keypair: Arc<Keypair>,
    shared: SharedState,
    config: Arc<PoolConfig>,
    /// Notes discovered for this keypair, spent ones pruned on confirmation
    notes: Mutex<Vec<Note>>,
    /// Submitted builders whose outcome is not known yet
    in_flight: Mutex<HashMap<TxId, TransactionBuilder>>,
    withdrawals: Mutex<WithdrawalTracker>,
    /// Held from the pre-compose sync until the proof inputs are assembled,
    /// so note selection and root agreement are not interleaved within one
    /// pool. Proving runs outside it.
    compose: Mutex<()>,
}

impl<L: Ledger, P: ProofBackend> ShieldedPool<L, P> {
    pub fn new(ledger: Arc<L>, prover: Arc<P>, keypair: Keypair, config: PoolConfig) -> Result<Self> {
        let shared = SharedState::new(config.tree.height)?;
        Ok(Self::with_state(ledger, prover, keypair, config, shared))
    }

    fn with_state(
        ledger: Arc<L>,
        prover: Arc<P>,
        keypair: Keypair,
        config: PoolConfig,
        shared: SharedState,
    ) -> Self {
        Self {
            ledger,
            prover,
            keypair: Arc::new(keypair),
            shared,
            config: Arc::new(config),
            notes: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
            withdrawals: Mutex::new(WithdrawalTracker::new()),
            compose: Mutex::new(()),
        }
    }

    /// Resume from a checkpoint
    ///
    /// The restored tree is brought up to the ledger's last root by replaying
    /// newer commitments; `RootMismatch` if the checkpoint has diverged.
    /// Submitted transactions come back in-flight with their inputs still
    /// locked, to be settled by [`resolve`](Self::resolve). Any other
    /// nullifier that was pending is resolved against the ledger: spent ones
    /// become confirmed, the rest are released. Owned notes spent after the
    /// checkpoint was taken are pruned.
    pub async fn restore(
        ledger: Arc<L>,
        prover: Arc<P>,
        keypair: Keypair,
        config: PoolConfig,
        checkpoint: WalletCheckpoint,
    ) -> Result<Self> {
        let shared = checkpoint.restore_state()?;
        let pool = Self::with_state(ledger, prover, keypair, config, shared);

        *pool.notes.lock().await = checkpoint.owned_notes;
        {
            let mut withdrawals = pool.withdrawals.lock().await;
            for intent in checkpoint.withdrawals {
                withdrawals.add(intent);
            }
        }

        {
            let mut in_flight = pool.in_flight.lock().await;
            for tx in checkpoint.in_flight {
                let tx_id = tx.tx_id();
                let builder = TransactionBuilder::resume(
                    pool.keypair.clone(),
                    pool.shared.clone(),
                    pool.config.clone(),
                    tx,
                    RESTORED_HOLDER,
                )
                .await?;
                in_flight.insert(tx_id, builder);
            }
        }

        for nullifier in &checkpoint.pending_nullifiers {
            let status = pool.shared.nullifiers().read().await.status(nullifier);
            if status != Some(NullifierStatus::Pending(RESTORED_HOLDER)) {
                continue;
            }
            let spent = pool.ledger.is_nullifier_spent(nullifier).await?;
            let mut tracker = pool.shared.nullifiers().write().await;
            if spent {
                tracker.mark_confirmed(*nullifier);
            } else {
                tracker.release(nullifier, RESTORED_HOLDER);
            }
        }

        pool.sync().await?;
        pool.refresh_spent().await?;
        info!(
            "Restored pool at {} leaves (root 0x{}), {} in flight",
            pool.shared.commitment_count().await,
            hex::encode(pool.shared.root().await),
            pool.in_flight.lock().await.len()
        );
        Ok(pool)
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn address(&self) -> ShieldedAddress {
        self.keypair.address()
    }

    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// A fresh builder over this pool's state
    pub fn builder(&self) -> TransactionBuilder {
        TransactionBuilder::new(self.keypair.clone(), self.shared.clone(), self.config.clone())
    }

    // ========================================================================
    // Note discovery
    // ========================================================================

    /// Mirror new ledger commitments and scan them for owned notes
    ///
    /// Returns how many new notes were found.
    pub async fn sync(&self) -> Result<usize> {
        let records = self.shared.sync(&*self.ledger).await?;
        Ok(self.scan(&records).await?.len())
    }

    /// Trial-decrypt `records`, keeping notes addressed to this keypair
    ///
    /// Ciphertexts that fail to decrypt belong to someone else and are
    /// skipped. Spent status of found notes is refreshed from the ledger.
    pub async fn scan(&self, records: &[CommitmentRecord]) -> Result<Vec<Note>> {
        let found: Vec<Note> = records
            .iter()
            .filter_map(|r| {
                try_decrypt_note(&r.encrypted_output, &self.keypair, &r.commitment, r.index)
            })
            .filter(|note| !note.is_zero())
            .collect();

        let mut fresh = Vec::new();
        for note in found {
            let nullifier = note.nullifier(self.keypair.secret_key())?;
            if self.ledger.is_nullifier_spent(&nullifier).await? {
                self.shared
                    .nullifiers()
                    .write()
                    .await
                    .mark_confirmed(nullifier);
                continue;
            }
            fresh.push(note);
        }

        let added = self.add_notes(fresh).await;
        if !added.is_empty() {
            info!("Discovered {} notes", added.len());
        }
        Ok(added)
    }

    /// Ask the ledger about every owned note, dropping the spent ones
    ///
    /// Catches spends this pool never saw confirmed: another wallet holding
    /// the same keys, or a spend made after the checkpoint we restored from.
    pub async fn refresh_spent(&self) -> Result<usize> {
        let owned = self.notes.lock().await.clone();
        self.prune_spent(&owned).await
    }

    async fn prune_spent(&self, notes: &[Note]) -> Result<usize> {
        let mut spent = Vec::new();
        for note in notes {
            let nullifier = note.nullifier(self.keypair.secret_key())?;
            if self.ledger.is_nullifier_spent(&nullifier).await? {
                spent.push((note.commitment(), nullifier));
            }
        }
        if spent.is_empty() {
            return Ok(0);
        }

        {
            let mut tracker = self.shared.nullifiers().write().await;
            for (_, nullifier) in &spent {
                tracker.mark_confirmed(*nullifier);
            }
        }
        self.notes
            .lock()
            .await
            .retain(|note| !spent.iter().any(|(c, _)| *c == note.commitment()));

        info!("Pruned {} notes already spent on the ledger", spent.len());
        Ok(spent.len())
    }

    async fn add_notes(&self, notes: Vec<Note>) -> Vec<Note> {
        let mut owned = self.notes.lock().await;
        let mut added = Vec::new();
        for note in notes {
            if !owned.contains(&note) {
                owned.push(note.clone());
                added.push(note);
            }
        }
        added
    }

    /// Notes that can be selected right now
    pub async fn notes(&self) -> Vec<Note> {
        let owned = self.notes.lock().await.clone();
        let tracker = self.shared.nullifiers().read().await;
        owned
            .into_iter()
            .filter(|note| match note.nullifier(self.keypair.secret_key()) {
                Ok(nf) => !tracker.is_unavailable(&nf),
                Err(_) => false,
            })
            .collect()
    }

    /// Sum of spendable notes
    pub async fn balance(&self) -> u128 {
        self.notes()
            .await
            .iter()
            .map(|n| u128::from(n.amount.0))
            .sum()
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Move `amount` from outside into a note owned by this keypair
    pub async fn deposit(&self, amount: u64) -> Result<TxReceipt> {
        self.execute(
            Vec::new(),
            vec![OutputSpec::new(amount, self.address())],
            PublicFlow::deposit(amount),
        )
        .await
    }

    /// Shielded transfer; empty `inputs` selects notes automatically
    pub async fn transfer(&self, inputs: Vec<Note>, outputs: Vec<OutputSpec>) -> Result<TxReceipt> {
        self.execute(inputs, outputs, PublicFlow::transfer()).await
    }

    /// Release `amount` to `recipient`; empty `inputs` selects automatically
    pub async fn withdraw(
        &self,
        inputs: Vec<Note>,
        amount: u64,
        recipient: ExternalAddress,
        is_external_withdrawal: bool,
    ) -> Result<TxReceipt> {
        self.execute(
            inputs,
            Vec::new(),
            PublicFlow::withdraw(amount, recipient, is_external_withdrawal),
        )
        .await
    }

    /// Compose, prove, submit and await one transaction
    pub async fn execute(
        &self,
        inputs: Vec<Note>,
        outputs: Vec<OutputSpec>,
        flow: PublicFlow,
    ) -> Result<TxReceipt> {
        let mut builder = self.builder();
        if let Err(e) = self.prepare(&mut builder, inputs, &outputs, flow).await {
            if let Err(abandon_err) = builder.abandon().await {
                warn!("Builder {} could not be abandoned: {}", builder.id(), abandon_err);
            }
            return Err(e);
        }
        let handle = self.submit(builder).await?;

        let deadline = Duration::from_millis(self.config.timeouts.confirmation_timeout_ms);
        match tokio::time::timeout(deadline, self.poll_outcome(&handle)).await {
            Ok(Ok(outcome)) => {
                let Some(builder) = self.in_flight.lock().await.remove(&handle.tx_id) else {
                    // settled by a concurrent resolve()
                    return Err(PoolError::UnknownTransaction(handle.tx_id));
                };
                self.apply_outcome(builder, outcome).await
            }
            // outcome unknown; the builder stays in-flight
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!("No outcome for tx {} within {:?}", handle.tx_id, deadline);
                Err(PoolError::ConfirmationTimeout { tx: handle.tx_id })
            }
        }
    }

    /// Park the builder in-flight and hand its payload to the ledger
    ///
    /// Parking comes first so a caller cancelled mid-submission still leaves
    /// the transaction resolvable. A rejected submission reverts the builder.
    async fn submit(&self, builder: TransactionBuilder) -> Result<TxHandle> {
        let Some(payload) = builder.payload().cloned() else {
            return Err(PoolError::InvalidState {
                operation: "submit",
                state: builder.state().to_string(),
            });
        };
        self.in_flight.lock().await.insert(payload.tx_id, builder);

        match self.ledger.submit(&payload).await {
            Ok(handle) => {
                info!("Submitted tx {} ({})", handle.tx_id, payload.circuit);
                Ok(handle)
            }
            Err(e) => {
                warn!("Submission of tx {} failed: {}", payload.tx_id, e);
                let parked = self.in_flight.lock().await.remove(&payload.tx_id);
                if let Some(mut builder) = parked {
                    builder.on_reverted().await?;
                    self.recheck_inputs(&builder).await;
                }
                Err(match e {
                    PoolError::SubmissionFailed(_) => e,
                    other => PoolError::SubmissionFailed(other.to_string()),
                })
            }
        }
    }

    /// After a revert, learn which of the released inputs the ledger has
    /// already spent so they are not selected again
    async fn recheck_inputs(&self, builder: &TransactionBuilder) {
        if let Err(e) = self.prune_spent(builder.inputs()).await {
            warn!("Builder {}: could not recheck inputs: {}", builder.id(), e);
        }
    }

    /// Drive `builder` from `Composing` to `Submitted`
    async fn prepare(
        &self,
        builder: &mut TransactionBuilder,
        inputs: Vec<Note>,
        outputs: &[OutputSpec],
        flow: PublicFlow,
    ) -> Result<()> {
        let bundle = {
            let _compose = self.compose.lock().await;
            self.sync().await?;
            if inputs.is_empty() {
                let requested: u128 = outputs.iter().map(|o| u128::from(o.amount)).sum();
                let target = requested as i128 + flow.outflow();
                if target > 0 {
                    let candidates = self.notes.lock().await.clone();
                    builder.select_inputs(&candidates, target as u128).await?;
                }
            } else {
                self.check_unspent(&inputs).await?;
                builder.use_inputs(inputs).await?;
            }

            builder.build_outputs(outputs, flow, &mut OsRng).await?;

            let mut resyncs = 0;
            loop {
                match builder.assemble_proof_inputs(&*self.ledger).await {
                    Ok(bundle) => break bundle.clone(),
                    Err(PoolError::Privacy(PrivacyError::RootMismatch { .. }))
                        if resyncs < ROOT_RESYNCS =>
                    {
                        resyncs += 1;
                        debug!("Builder {}: ledger moved, re-syncing", builder.id());
                        self.sync().await?;
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let proof = self
            .prover
            .prove(bundle.circuit, &bundle.private, &bundle.public)
            .await?;
        builder.package(proof)?;
        Ok(())
    }

    /// Ask the ledger about explicitly chosen inputs
    async fn check_unspent(&self, inputs: &[Note]) -> Result<()> {
        for note in inputs {
            let nullifier = note.nullifier(self.keypair.secret_key())?;
            if self.ledger.is_nullifier_spent(&nullifier).await? {
                self.shared
                    .nullifiers()
                    .write()
                    .await
                    .mark_confirmed(nullifier);
                return Err(PoolError::DoubleSpend {
                    nullifier: nullifier.0,
                });
            }
        }
        Ok(())
    }

    async fn poll_outcome(&self, handle: &TxHandle) -> Result<TxOutcome> {
        let interval = Duration::from_millis(self.config.timeouts.poll_interval_ms.max(1));
        loop {
            if let Some(outcome) = self.ledger.outcome(handle).await? {
                return Ok(outcome);
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn apply_outcome(
        &self,
        mut builder: TransactionBuilder,
        outcome: TxOutcome,
    ) -> Result<TxReceipt> {
        let tx_id = builder.tx_id().ok_or(PoolError::InvalidState {
            operation: "apply outcome",
            state: builder.state().to_string(),
        })?;

        let events = match outcome {
            TxOutcome::Confirmed { events } => events,
            TxOutcome::Reverted { reason } => {
                builder.on_reverted().await?;
                self.recheck_inputs(&builder).await;
                return Err(PoolError::SubmissionFailed(format!(
                    "tx {tx_id} reverted: {reason}"
                )));
            }
        };

        // mirror the ledger first so our outputs' ciphertexts are scanned
        let synced = self.sync().await;
        builder.on_confirmed(&events).await?;
        synced?;

        let spent: Vec<Commitment> = builder.inputs().iter().map(Note::commitment).collect();
        self.notes
            .lock()
            .await
            .retain(|note| !spent.contains(&note.commitment()));

        let mut receipt = TxReceipt {
            tx_id,
            nullifiers: builder.nullifiers().to_vec(),
            commitments: Vec::new(),
            output_indices: builder.output_indices().to_vec(),
        };

        if let Some(request) = builder.request() {
            receipt.commitments = request.outputs.iter().map(Note::commitment).collect();

            let own_pk = self.keypair.public_key();
            let own_outputs: Vec<Note> = request
                .outputs
                .iter()
                .zip(builder.output_indices())
                .filter(|(note, _)| note.public_key == own_pk && !note.is_zero())
                .map(|(note, index)| note.clone().with_index(*index))
                .collect();
            self.add_notes(own_outputs).await;

            let flow = &request.flow;
            if flow.is_external_withdrawal {
                let intent = WithdrawalIntent::new(
                    tx_id,
                    flow.recipient.unwrap_or(ExternalAddress::ZERO),
                    flow.public_amount.unsigned_abs(),
                    flow.l1_fee,
                );
                self.withdrawals.lock().await.add(intent);
            }
        }

        if let Some(path) = self.config.storage.checkpoint_path.as_deref() {
            self.save_checkpoint(Path::new(path)).await?;
        }

        info!("Tx {} confirmed", tx_id);
        Ok(receipt)
    }

    // ========================================================================
    // In-flight resolution
    // ========================================================================

    /// Transactions submitted whose outcome has not been observed
    pub async fn in_flight(&self) -> Vec<TxId> {
        self.in_flight.lock().await.keys().copied().collect()
    }

    /// Poll once for the outcome of a timed-out transaction
    ///
    /// `Ok(None)` while the ledger has not decided; the transaction stays
    /// submitted.
    pub async fn resolve(&self, tx_id: &TxId) -> Result<Option<TxReceipt>> {
        if !self.in_flight.lock().await.contains_key(tx_id) {
            return Err(PoolError::UnknownTransaction(*tx_id));
        }

        let handle = TxHandle { tx_id: *tx_id };
        let Some(outcome) = self.ledger.outcome(&handle).await? else {
            debug!("Tx {} still undecided", tx_id);
            return Ok(None);
        };

        let Some(builder) = self.in_flight.lock().await.remove(tx_id) else {
            return Err(PoolError::UnknownTransaction(*tx_id));
        };
        debug_assert_eq!(builder.state(), TxState::Submitted);
        self.apply_outcome(builder, outcome).await.map(Some)
    }

    // ========================================================================
    // Cross-domain withdrawals
    // ========================================================================

    /// Record the bridge's report for a cross-domain withdrawal
    pub async fn on_bridge_outcome(&self, tx_id: &TxId, outcome: BridgeOutcome) -> Result<()> {
        self.withdrawals.lock().await.apply(tx_id, outcome)
    }

    pub async fn withdrawal(&self, tx_id: &TxId) -> Option<WithdrawalIntent> {
        self.withdrawals.lock().await.get(tx_id).cloned()
    }

    pub async fn pending_withdrawals(&self) -> Vec<WithdrawalIntent> {
        self.withdrawals
            .lock()
            .await
            .pending()
            .into_iter()
            .cloned()
            .collect()
    }

    // ========================================================================
    // Checkpoints
    // ========================================================================

    pub async fn checkpoint(&self) -> WalletCheckpoint {
        let notes = self.notes.lock().await.clone();
        let withdrawals = self.withdrawals.lock().await.intents();
        let in_flight: Vec<SubmittedTx> = self
            .in_flight
            .lock()
            .await
            .values()
            .filter_map(TransactionBuilder::submitted)
            .collect();
        WalletCheckpoint::capture(&self.shared, notes, withdrawals, in_flight).await
    }

    pub async fn save_checkpoint(&self, path: &Path) -> Result<()> {
        self.checkpoint().await.save(path)
    }
}
