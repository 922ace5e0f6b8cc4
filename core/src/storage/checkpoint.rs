//! Wallet checkpoints.
//!
//! A JSON snapshot of the local mirror and the wallet's notes, so a restart
//! resumes from the last known leaf instead of rescanning the whole ledger.
//! Writes go to a temp file that is renamed into place. Transactions that
//! were submitted but undecided are kept with their locked inputs.

use std::fs;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use shieldpool_privacy::{Commitment, MerkleTree, Note, Nullifier};

use super::nullifiers::{NullifierTracker, RESTORED_HOLDER};
use super::shielded_state::SharedState;
use crate::bridge::WithdrawalIntent;
use crate::error::{PoolError, Result};
use crate::transaction::SubmittedTx;

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletCheckpoint {
    pub version: u32,
    pub tree_height: usize,
    pub tree_leaves: Vec<Commitment>,
    pub spent_nullifiers: Vec<Nullifier>,
    pub pending_nullifiers: Vec<Nullifier>,
    /// Notes with their leaf index
    pub owned_notes: Vec<Note>,
    #[serde(default)]
    pub withdrawals: Vec<WithdrawalIntent>,
    /// Submitted transactions with no observed outcome
    #[serde(default)]
    pub in_flight: Vec<SubmittedTx>,
}

impl WalletCheckpoint {
    /// Snapshot `state` under read locks
    pub async fn capture(
        state: &SharedState,
        owned_notes: Vec<Note>,
        withdrawals: Vec<WithdrawalIntent>,
        in_flight: Vec<SubmittedTx>,
    ) -> Self {
        let tree = state.tree().read().await;
        let tracker = state.nullifiers().read().await;

        let mut spent_nullifiers: Vec<Nullifier> = tracker.spent().copied().collect();
        let mut pending_nullifiers: Vec<Nullifier> = tracker.pending().copied().collect();
        spent_nullifiers.sort();
        pending_nullifiers.sort();

        Self {
            version: CHECKPOINT_VERSION,
            tree_height: tree.height(),
            tree_leaves: tree.leaves().to_vec(),
            spent_nullifiers,
            pending_nullifiers,
            owned_notes,
            withdrawals,
            in_flight,
        }
    }

    /// Rebuild the local mirror; pending marks go to [`RESTORED_HOLDER`]
    pub fn restore_state(&self) -> Result<SharedState> {
        let tree = MerkleTree::from_leaves(self.tree_height, &self.tree_leaves)?;

        let mut tracker = NullifierTracker::new();
        for nullifier in &self.spent_nullifiers {
            tracker.mark_confirmed(*nullifier);
        }
        tracker.mark_pending_all(&self.pending_nullifiers, RESTORED_HOLDER)?;

        Ok(SharedState::from_parts(tree, tracker))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;

        info!(
            "Saved checkpoint to {:?}: {} leaves, {} notes",
            path,
            self.tree_leaves.len(),
            self.owned_notes.len()
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let checkpoint: Self = serde_json::from_slice(&fs::read(path)?)?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(PoolError::InvalidState {
                operation: "load checkpoint",
                state: format!("version {}", checkpoint.version),
            });
        }
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use shieldpool_privacy::Keypair;

    #[tokio::test]
    async fn test_save_and_load() {
        let keypair = Keypair::generate(&mut OsRng);
        let state = SharedState::new(6).unwrap();
        let note = Note::construct(42, keypair.public_key(), None, &mut OsRng).unwrap();
        let index = state.insert_commitment(note.commitment()).await.unwrap();
        let note = note.with_index(index);

        {
            let mut tracker = state.nullifiers().write().await;
            tracker.mark_confirmed(Nullifier([1u8; 32]));
            tracker.mark_pending(Nullifier([2u8; 32]), 5).unwrap();
        }

        let checkpoint = WalletCheckpoint::capture(&state, vec![note.clone()], vec![], vec![])
            .await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet").join("checkpoint.json");
        checkpoint.save(&path).unwrap();

        let loaded = WalletCheckpoint::load(&path).unwrap();
        assert_eq!(loaded.owned_notes, vec![note.clone()]);
        assert_eq!(loaded.owned_notes[0].index, Some(0));

        let restored = loaded.restore_state().unwrap();
        assert_eq!(restored.root().await, state.root().await);
        assert!(restored.is_spent(&Nullifier([1u8; 32])).await);
        assert!(
            restored
                .nullifiers()
                .read()
                .await
                .is_pending(&Nullifier([2u8; 32]))
        );
    }

    #[test]
    fn test_rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let checkpoint = WalletCheckpoint {
            version: 99,
            tree_height: 4,
            tree_leaves: vec![],
            spent_nullifiers: vec![],
            pending_nullifiers: vec![],
            owned_notes: vec![],
            withdrawals: vec![],
            in_flight: vec![],
        };
        checkpoint.save(&path).unwrap();

        assert!(matches!(
            WalletCheckpoint::load(&path),
            Err(PoolError::InvalidState { .. })
        ));
    }
}
