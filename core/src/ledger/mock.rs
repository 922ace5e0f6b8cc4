//! In-memory ledger
//!
//! Plays the on-chain pool contract for tests and local runs:
//! - Note commitment Merkle tree and recent-root history
//! - Nullifier set for double-spend prevention
//! - Commitment log with encrypted outputs for note discovery
//! - External balances credited by withdrawals and relayer fees
//!
//! Submissions are checked the way the contract checks them (known root,
//! fresh nullifiers, ext data hash, public amount, proof) and either
//! confirm or revert. Switches allow tests to fail, revert or hold the next
//! submission.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};
use tokio::sync::Mutex;

use shieldpool_config::PoolConfig;
use shieldpool_privacy::poseidon::{field_to_bytes, signed_to_field};
use shieldpool_privacy::{Commitment, EncryptedNote, MerkleTree, Nullifier, RootHistory};

use super::{CommitmentRecord, Ledger, LedgerEvent, TxHandle, TxOutcome};
use crate::error::{PoolError, Result};
use crate::prover::verify_mock_proof;
use crate::transaction::{ExternalAddress, SubmissionPayload, TxId};

struct PoolState {
    /// Note commitment tree
    tree: MerkleTree,
    /// Recent valid roots
    root_history: RootHistory,
    /// Set of spent nullifiers
    nullifiers: HashSet<Nullifier>,
    /// Commitment log in insertion order
    records: Vec<CommitmentRecord>,
    /// Value paid out of the pool per external address
    balances: HashMap<ExternalAddress, u128>,
    /// Decided submissions
    outcomes: HashMap<TxId, TxOutcome>,
    /// Accepted but undecided submissions
    held: Vec<SubmissionPayload>,
}

pub struct MockLedger {
    state: Mutex<PoolState>,
    max_deposit_amount: u64,
    fail_next_submit: AtomicBool,
    revert_next: AtomicBool,
    hold: AtomicBool,
}

impl MockLedger {
    /// Create an empty pool shaped by `config`
    pub fn new(config: &PoolConfig) -> Result<Self> {
        let tree = MerkleTree::new(config.tree.height)?;
        let mut root_history = RootHistory::new(config.tree.root_history_size);
        root_history.push(tree.root());

        Ok(Self {
            state: Mutex::new(PoolState {
                tree,
                root_history,
                nullifiers: HashSet::new(),
                records: Vec::new(),
                balances: HashMap::new(),
                outcomes: HashMap::new(),
                held: Vec::new(),
            }),
            max_deposit_amount: config.limits.max_deposit_amount,
            fail_next_submit: AtomicBool::new(false),
            revert_next: AtomicBool::new(false),
            hold: AtomicBool::new(false),
        })
    }

    /// Reject the next submission outright
    pub fn fail_next_submit(&self) {
        self.fail_next_submit.store(true, Ordering::SeqCst);
    }

    /// Accept the next submission, then revert it
    pub fn revert_next(&self) {
        self.revert_next.store(true, Ordering::SeqCst);
    }

    /// While holding, submissions are accepted but stay undecided
    pub fn set_hold(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
    }

    /// Decide every held submission; returns how many were processed
    pub async fn release_held(&self) -> usize {
        let mut state = self.state.lock().await;
        let held = std::mem::take(&mut state.held);
        let count = held.len();
        for payload in held {
            let outcome = Self::process(&mut state, &payload, self.max_deposit_amount);
            state.outcomes.insert(payload.tx_id, outcome);
        }
        count
    }

    /// Append a commitment that did not come through `submit`
    pub async fn inject_commitment(&self, commitment: Commitment) -> Result<u64> {
        let placeholder = EncryptedNote {
            ephemeral_pk: [0u8; 32],
            nonce: [0u8; 12],
            ciphertext: Vec::new(),
        };
        self.inject_record(commitment, placeholder).await
    }

    /// Append a commitment with its ciphertext, as another user's deposit would
    pub async fn inject_record(
        &self,
        commitment: Commitment,
        encrypted_output: EncryptedNote,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let index = state.tree.insert(&commitment)?;
        let root = state.tree.root();
        state.root_history.push(root);
        state.records.push(CommitmentRecord {
            commitment,
            index,
            encrypted_output,
        });
        Ok(index)
    }

    /// Value credited to `address` by withdrawals and fees
    pub async fn balance_of(&self, address: &ExternalAddress) -> u128 {
        let state = self.state.lock().await;
        state.balances.get(address).copied().unwrap_or(0)
    }

    pub async fn commitment_count(&self) -> u64 {
        self.state.lock().await.tree.len()
    }

    /// Contract-side checks; an `Err` carries the revert reason
    fn check(
        state: &PoolState,
        payload: &SubmissionPayload,
        max_deposit_amount: u64,
    ) -> std::result::Result<(), &'static str> {
        let public = &payload.public;
        let ext = &payload.ext_data;

        if !state.root_history.is_valid(&public.root) {
            return Err("Invalid merkle root");
        }
        let mut seen = HashSet::new();
        for nullifier in &public.input_nullifiers {
            if state.nullifiers.contains(nullifier) || !seen.insert(nullifier) {
                return Err("Input is already spent");
            }
        }
        if ext.hash() != public.ext_data_hash {
            return Err("Incorrect external data hash");
        }
        if field_to_bytes(&signed_to_field(ext.circuit_amount())) != public.public_amount {
            return Err("Invalid public amount");
        }
        if !verify_mock_proof(payload.circuit, &payload.proof, &public.signals()) {
            return Err("Invalid transaction proof");
        }
        if ext.ext_amount > i128::from(max_deposit_amount) {
            return Err("amount is larger than maximumDepositAmount");
        }
        let outputs = public.output_commitments.len() as u64;
        if state.tree.len() + outputs > state.tree.capacity() {
            return Err("Merkle tree is full. No more leaves can be added");
        }
        Ok(())
    }

    fn process(state: &mut PoolState, payload: &SubmissionPayload, max_deposit_amount: u64) -> TxOutcome {
        if let Err(reason) = Self::check(state, payload, max_deposit_amount) {
            warn!("Ledger reverted tx {}: {}", payload.tx_id, reason);
            return TxOutcome::Reverted {
                reason: reason.to_string(),
            };
        }

        let public = &payload.public;
        let ext = &payload.ext_data;
        let mut events = Vec::new();

        for nullifier in &public.input_nullifiers {
            state.nullifiers.insert(*nullifier);
            events.push(LedgerEvent::NullifierSpent {
                nullifier: *nullifier,
            });
        }

        for (i, commitment) in public.output_commitments.iter().enumerate() {
            // capacity was checked above
            let Ok(index) = state.tree.insert(commitment) else {
                break;
            };
            let encrypted_output = ext
                .encrypted_outputs
                .get(i)
                .cloned()
                .unwrap_or_else(|| EncryptedNote {
                    ephemeral_pk: [0u8; 32],
                    nonce: [0u8; 12],
                    ciphertext: Vec::new(),
                });
            state.records.push(CommitmentRecord {
                commitment: *commitment,
                index,
                encrypted_output,
            });
            events.push(LedgerEvent::Committed {
                commitment: *commitment,
                index,
            });
        }
        let root = state.tree.root();
        state.root_history.push(root);

        if ext.ext_amount < 0 {
            let paid = ext.ext_amount.unsigned_abs();
            let to_recipient = if ext.is_l1_withdrawal {
                paid.saturating_sub(u128::from(ext.l1_fee))
            } else {
                paid
            };
            *state.balances.entry(ext.recipient).or_default() += to_recipient;
        }
        if ext.fee > 0 {
            *state.balances.entry(ext.relayer).or_default() += u128::from(ext.fee);
        }

        info!(
            "Ledger confirmed tx {}: {} nullifiers, {} commitments, root 0x{}",
            payload.tx_id,
            public.input_nullifiers.len(),
            public.output_commitments.len(),
            hex::encode(root)
        );
        TxOutcome::Confirmed { events }
    }
}

impl Ledger for MockLedger {
    async fn last_root(&self) -> Result<[u8; 32]> {
        Ok(self.state.lock().await.tree.root())
    }

    async fn commitments_since(&self, cursor: u64) -> Result<Vec<CommitmentRecord>> {
        let state = self.state.lock().await;
        let start = usize::try_from(cursor)
            .unwrap_or(usize::MAX)
            .min(state.records.len());
        Ok(state.records[start..].to_vec())
    }

    async fn is_nullifier_spent(&self, nullifier: &Nullifier) -> Result<bool> {
        Ok(self.state.lock().await.nullifiers.contains(nullifier))
    }

    async fn submit(&self, payload: &SubmissionPayload) -> Result<TxHandle> {
        if self.fail_next_submit.swap(false, Ordering::SeqCst) {
            return Err(PoolError::SubmissionFailed(format!(
                "ledger unavailable, tx {} not accepted",
                payload.tx_id
            )));
        }

        let handle = TxHandle {
            tx_id: payload.tx_id,
        };
        let mut state = self.state.lock().await;
        if state.outcomes.contains_key(&payload.tx_id)
            || state.held.iter().any(|p| p.tx_id == payload.tx_id)
        {
            return Err(PoolError::SubmissionFailed(format!(
                "tx {} already submitted",
                payload.tx_id
            )));
        }

        if self.hold.load(Ordering::SeqCst) {
            state.held.push(payload.clone());
            return Ok(handle);
        }

        let outcome = if self.revert_next.swap(false, Ordering::SeqCst) {
            TxOutcome::Reverted {
                reason: "execution reverted".to_string(),
            }
        } else {
            Self::process(&mut state, payload, self.max_deposit_amount)
        };
        state.outcomes.insert(payload.tx_id, outcome);
        Ok(handle)
    }

    async fn outcome(&self, handle: &TxHandle) -> Result<Option<TxOutcome>> {
        let state = self.state.lock().await;
        if let Some(outcome) = state.outcomes.get(&handle.tx_id) {
            return Ok(Some(outcome.clone()));
        }
        if state.held.iter().any(|p| p.tx_id == handle.tx_id) {
            return Ok(None);
        }
        Err(PoolError::UnknownTransaction(handle.tx_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PoolConfig {
        let mut config = PoolConfig::default();
        config.tree.height = 4;
        config.tree.root_history_size = 3;
        config
    }

    #[tokio::test]
    async fn test_commitment_log() {
        let ledger = MockLedger::new(&config()).unwrap();
        let empty_root = ledger.last_root().await.unwrap();

        assert_eq!(ledger.inject_commitment(Commitment([1u8; 32])).await.unwrap(), 0);
        assert_eq!(ledger.inject_commitment(Commitment([2u8; 32])).await.unwrap(), 1);
        assert_ne!(ledger.last_root().await.unwrap(), empty_root);

        let records = ledger.commitments_since(1).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].index, 1);
        assert!(ledger.commitments_since(10).await.unwrap().is_empty());

        let local = MerkleTree::from_leaves(4, &[Commitment([1u8; 32]), Commitment([2u8; 32])])
            .unwrap();
        assert_eq!(local.root(), ledger.last_root().await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_transaction() {
        let ledger = MockLedger::new(&config()).unwrap();
        let handle = TxHandle {
            tx_id: TxId([5u8; 32]),
        };
        assert!(matches!(
            ledger.outcome(&handle).await,
            Err(PoolError::UnknownTransaction(_))
        ));
        assert_eq!(ledger.balance_of(&ExternalAddress([1u8; 20])).await, 0);
    }

    #[tokio::test]
    async fn test_tree_capacity() {
        let ledger = MockLedger::new(&config()).unwrap();
        for i in 0..16u8 {
            ledger.inject_commitment(Commitment([i; 32])).await.unwrap();
        }
        assert!(ledger.inject_commitment(Commitment([99u8; 32])).await.is_err());
        assert_eq!(ledger.commitment_count().await, 16);
    }
}
