//! Shared Shielded State
//!
//! The local mirror of the ledger's accumulator plus the nullifier tracker,
//! shared by every builder:
//! - Note commitment Merkle tree
//! - Nullifier statuses for double-spend prevention
//!
//! Both sit behind `tokio::sync::RwLock`: one writer at a time, concurrent
//! readers, and readers never see a half-applied insert. Ledger calls happen
//! outside the locks.

use std::sync::Arc;

use log::info;
use tokio::sync::RwLock;

use shieldpool_privacy::{Commitment, MerklePath, MerkleTree, Nullifier};

use super::nullifiers::NullifierTracker;
use crate::error::{PoolError, Result};
use crate::ledger::{CommitmentRecord, Ledger};

#[derive(Clone)]
pub struct SharedState {
    tree: Arc<RwLock<MerkleTree>>,
    nullifiers: Arc<RwLock<NullifierTracker>>,
}

impl SharedState {
    /// Create a new empty state
    pub fn new(height: usize) -> Result<Self> {
        Ok(Self::from_parts(MerkleTree::new(height)?, NullifierTracker::new()))
    }

    pub fn from_parts(tree: MerkleTree, nullifiers: NullifierTracker) -> Self {
        Self {
            tree: Arc::new(RwLock::new(tree)),
            nullifiers: Arc::new(RwLock::new(nullifiers)),
        }
    }

    pub fn tree(&self) -> &Arc<RwLock<MerkleTree>> {
        &self.tree
    }

    pub fn nullifiers(&self) -> &Arc<RwLock<NullifierTracker>> {
        &self.nullifiers
    }

    /// Get the current merkle root
    pub async fn root(&self) -> [u8; 32] {
        self.tree.read().await.root()
    }

    pub async fn height(&self) -> usize {
        self.tree.read().await.height()
    }

    /// Get the number of commitments
    pub async fn commitment_count(&self) -> u64 {
        self.tree.read().await.len()
    }

    /// Get a merkle path for the commitment at `index`
    pub async fn path(&self, index: u64) -> Result<MerklePath> {
        Ok(self.tree.read().await.path(index)?)
    }

    /// Root and paths taken under one read lock
    pub async fn snapshot_paths(&self, indices: &[u64]) -> Result<([u8; 32], Vec<MerklePath>)> {
        let tree = self.tree.read().await;
        let paths = indices
            .iter()
            .map(|i| tree.path(*i))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok((tree.root(), paths))
    }

    /// Check if a nullifier has been spent
    pub async fn is_spent(&self, nullifier: &Nullifier) -> bool {
        self.nullifiers.read().await.is_spent(nullifier)
    }

    /// Append one commitment
    pub async fn insert_commitment(&self, commitment: Commitment) -> Result<u64> {
        Ok(self.tree.write().await.insert(&commitment)?)
    }

    /// Pull new commitments from the ledger and replay them locally
    ///
    /// Returns the records that were applied so callers can scan them for
    /// owned notes. The ledger's root must match the tree after some prefix
    /// of the fetched records (the log may grow between the two calls);
    /// records past that prefix are left for the next sync. Fails with
    /// `RootMismatch` if no prefix matches; the local tree is left unchanged.
    pub async fn sync<L: Ledger>(&self, ledger: &L) -> Result<Vec<CommitmentRecord>> {
        let cursor = self.commitment_count().await;
        let external_root = ledger.last_root().await?;
        let records = ledger.commitments_since(cursor).await?;

        let mut tree = self.tree.write().await;

        // another writer may have advanced the tree while we were fetching
        let skip = usize::try_from(tree.len() - cursor).unwrap_or(usize::MAX);
        if skip > records.len() {
            return Ok(Vec::new());
        }
        let mut fresh: Vec<CommitmentRecord> = records.into_iter().skip(skip).collect();

        let mut expected = tree.len();
        for record in &fresh {
            if record.index != expected {
                return Err(PoolError::UnexpectedLeafIndex {
                    expected,
                    got: record.index,
                });
            }
            expected += 1;
        }

        let leaves: Vec<Commitment> = fresh.iter().map(|r| r.commitment).collect();
        let matched = match matching_prefix(&tree, &leaves, &external_root)? {
            Some(matched) => matched,
            // raced another writer; the next sync validates
            None if skip > 0 => return Ok(Vec::new()),
            // replaying everything surfaces the mismatch
            None => leaves.len(),
        };
        tree.sync_since(external_root, &leaves[..matched])?;
        fresh.truncate(matched);

        if !fresh.is_empty() {
            info!(
                "Synced {} commitments, tree now holds {} (root 0x{})",
                fresh.len(),
                tree.len(),
                hex::encode(tree.root())
            );
        }

        Ok(fresh)
    }
}

/// Longest prefix of `leaves` after which `tree` would have `root`
fn matching_prefix(
    tree: &MerkleTree,
    leaves: &[Commitment],
    root: &[u8; 32],
) -> Result<Option<usize>> {
    let mut replay = tree.clone();
    let mut matched = (replay.root() == *root).then_some(0);
    for (i, leaf) in leaves.iter().enumerate() {
        replay.insert(leaf)?;
        if replay.root() == *root {
            matched = Some(i + 1);
        }
    }
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shieldpool_config::PoolConfig;

    use crate::ledger::MockLedger;

    fn ledger() -> MockLedger {
        let mut config = PoolConfig::default();
        config.tree.height = 6;
        MockLedger::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_sync_replays_new_commitments() {
        let ledger = ledger();
        let state = SharedState::new(6).unwrap();
        for i in 1..=3u8 {
            ledger.inject_commitment(Commitment([i; 32])).await.unwrap();
        }

        let applied = state.sync(&ledger).await.unwrap();
        assert_eq!(applied.len(), 3);
        assert_eq!(state.root().await, ledger.last_root().await.unwrap());

        ledger.inject_commitment(Commitment([4u8; 32])).await.unwrap();
        let applied = state.sync(&ledger).await.unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].index, 3);
        assert!(state.sync(&ledger).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_rejects_divergent_tree() {
        let ledger = ledger();
        let state = SharedState::new(6).unwrap();
        ledger.inject_commitment(Commitment([1u8; 32])).await.unwrap();
        state.insert_commitment(Commitment([2u8; 32])).await.unwrap();
        let before = state.root().await;

        let err = state.sync(&ledger).await.unwrap_err();
        assert!(err.is_aborting());
        assert_eq!(state.root().await, before);
        assert_eq!(state.commitment_count().await, 1);
    }

    #[test]
    fn test_matching_prefix() {
        let tree = MerkleTree::new(4).unwrap();
        let leaves = [Commitment([1u8; 32]), Commitment([2u8; 32])];
        let after_one = MerkleTree::from_leaves(4, &leaves[..1]).unwrap().root();

        assert_eq!(matching_prefix(&tree, &leaves, &tree.root()).unwrap(), Some(0));
        assert_eq!(matching_prefix(&tree, &leaves, &after_one).unwrap(), Some(1));
        assert_eq!(matching_prefix(&tree, &leaves, &[9u8; 32]).unwrap(), None);
    }
}
