//! Merkle Tree for Note Commitments
//!
//! Append-only, fixed-height Poseidon tree mirroring the ledger's commitment
//! history. Used for proving note existence without revealing which note.
//!
//! ```text
//!                    Root
//!                   /    \
//!                 H01    H23
//!                /  \   /   \
//!               H0  H1 H2   Z0     Z0 = empty leaf, Z(k+1) = H(Zk, Zk)
//!               |   |   |
//!              C0  C1  C2          (Note Commitments)
//! ```
//!
//! Empty subtrees hash to the fixed `Zk` ladder, so two trees built over the
//! same leaf sequence agree bit-for-bit regardless of how they were built.

use std::collections::{HashMap, VecDeque};

use ark_bls12_381::Fr;
use serde::{Deserialize, Serialize};

use crate::commitment::Commitment;
use crate::error::{PrivacyError, Result};
use crate::poseidon::{field_to_bytes, hash_bytes, hash_fields};

/// Largest supported height (2^32 leaves)
pub const MAX_TREE_HEIGHT: usize = 32;

/// Default height, matching the deployed pool
pub const DEFAULT_TREE_HEIGHT: usize = 23;

/// A Merkle path proving inclusion of a note
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerklePath {
    /// Sibling hashes from leaf to root
    pub siblings: Vec<[u8; 32]>,
    /// Position bits (false = current node is left, true = right)
    pub path_bits: Vec<bool>,
    /// The leaf index
    pub index: u64,
}

impl MerklePath {
    /// All-zero path at index 0
    ///
    /// Attached to zero-amount padding inputs, whose membership the circuit
    /// does not check.
    pub fn zero(height: usize) -> Self {
        Self {
            siblings: vec![[0u8; 32]; height],
            path_bits: vec![false; height],
            index: 0,
        }
    }

    /// Hash `leaf` up the path
    pub fn compute_root(&self, leaf: &Commitment) -> [u8; 32] {
        let mut current = leaf.0;

        for (sibling, is_right) in self.siblings.iter().zip(self.path_bits.iter()) {
            current = if *is_right {
                hash_pair(sibling, &current)
            } else {
                hash_pair(&current, sibling)
            };
        }

        current
    }

    /// Verify that this path proves inclusion of `leaf` in `root`
    pub fn verify(&self, leaf: &Commitment, root: &[u8; 32]) -> bool {
        &self.compute_root(leaf) == root
    }
}

/// Hash two children to get parent
pub fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    hash_bytes(&[left, right])
}

/// Empty subtree roots, `zeros[k]` for a subtree of height k
fn zero_ladder() -> Vec<[u8; 32]> {
    let mut zeros = Vec::with_capacity(MAX_TREE_HEIGHT + 1);
    let mut current = field_to_bytes(&hash_fields(&[Fr::from(0u64)]));
    zeros.push(current);

    for _ in 0..MAX_TREE_HEIGHT {
        current = hash_pair(&current, &current);
        zeros.push(current);
    }

    zeros
}

/// Fixed-height commitment tree
///
/// Stores only non-empty nodes; empty siblings come from the zero ladder.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    height: usize,
    /// Non-empty interior nodes: (level, index) -> hash
    nodes: HashMap<(usize, u64), [u8; 32]>,
    /// Leaves in insertion order
    leaves: Vec<Commitment>,
    zeros: Vec<[u8; 32]>,
    root: [u8; 32],
}

impl MerkleTree {
    /// Create a new empty tree of the given height
    pub fn new(height: usize) -> Result<Self> {
        if height == 0 || height > MAX_TREE_HEIGHT {
            return Err(PrivacyError::InvalidTreeHeight(height));
        }

        let zeros = zero_ladder();
        let root = zeros[height];

        Ok(Self {
            height,
            nodes: HashMap::new(),
            leaves: Vec::new(),
            zeros,
            root,
        })
    }

    /// Rebuild a tree from an ordered leaf sequence
    pub fn from_leaves(height: usize, leaves: &[Commitment]) -> Result<Self> {
        let mut tree = Self::new(height)?;
        for leaf in leaves {
            tree.insert(leaf)?;
        }
        Ok(tree)
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Maximum number of leaves
    pub fn capacity(&self) -> u64 {
        1u64 << self.height
    }

    /// Get current root
    pub fn root(&self) -> [u8; 32] {
        self.root
    }

    /// Number of inserted leaves (also the next free index)
    pub fn len(&self) -> u64 {
        self.leaves.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn leaves(&self) -> &[Commitment] {
        &self.leaves
    }

    /// Get commitment at index
    pub fn get(&self, index: u64) -> Option<Commitment> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.leaves.get(i).copied())
    }

    /// Append a commitment and return its index
    pub fn insert(&mut self, commitment: &Commitment) -> Result<u64> {
        let index = self.len();
        if index >= self.capacity() {
            return Err(PrivacyError::TreeFull {
                capacity: self.capacity(),
            });
        }

        self.leaves.push(*commitment);
        self.nodes.insert((0, index), commitment.0);

        let mut current_index = index;
        let mut current_hash = commitment.0;

        for level in 0..self.height {
            let is_right = current_index & 1 == 1;
            let sibling = self.node(level, current_index ^ 1);

            current_hash = if is_right {
                hash_pair(&sibling, &current_hash)
            } else {
                hash_pair(&current_hash, &sibling)
            };
            current_index >>= 1;

            self.nodes.insert((level + 1, current_index), current_hash);
        }

        self.root = current_hash;
        Ok(index)
    }

    /// Get the authentication path for an inserted leaf
    pub fn path(&self, index: u64) -> Result<MerklePath> {
        if index >= self.len() {
            return Err(PrivacyError::IndexOutOfRange {
                index,
                len: self.len(),
            });
        }

        let mut siblings = Vec::with_capacity(self.height);
        let mut path_bits = Vec::with_capacity(self.height);
        let mut current_index = index;

        for level in 0..self.height {
            path_bits.push(current_index & 1 == 1);
            siblings.push(self.node(level, current_index ^ 1));
            current_index >>= 1;
        }

        Ok(MerklePath {
            siblings,
            path_bits,
            index,
        })
    }

    /// Reconcile with the full authoritative leaf history
    ///
    /// Local leaves must be a prefix of `external_leaves`; the missing suffix
    /// is replayed in order. Fails with `RootMismatch` (leaving `self`
    /// untouched) if the history diverges or the replay does not reproduce
    /// `external_root`.
    pub fn sync_to(&mut self, external_root: [u8; 32], external_leaves: &[Commitment]) -> Result<()> {
        let local = self.leaves.len();
        if external_leaves.len() < local || external_leaves[..local] != self.leaves[..] {
            return Err(PrivacyError::RootMismatch {
                local: self.root,
                external: external_root,
            });
        }

        self.sync_since(external_root, &external_leaves[local..])
    }

    /// Append leaves that follow the current tip, then check the root
    pub fn sync_since(&mut self, external_root: [u8; 32], new_leaves: &[Commitment]) -> Result<()> {
        let mut replay = self.clone();
        for leaf in new_leaves {
            replay.insert(leaf)?;
        }

        if replay.root != external_root {
            log::warn!(
                "tree replay diverged at {} leaves: local 0x{} vs ledger 0x{}",
                replay.len(),
                hex::encode(replay.root),
                hex::encode(external_root)
            );
            return Err(PrivacyError::RootMismatch {
                local: replay.root,
                external: external_root,
            });
        }

        if !new_leaves.is_empty() {
            log::debug!("tree synced to {} leaves", replay.len());
        }
        *self = replay;
        Ok(())
    }

    fn node(&self, level: usize, index: u64) -> [u8; 32] {
        self.nodes
            .get(&(level, index))
            .copied()
            .unwrap_or(self.zeros[level])
    }
}

/// Root history
///
/// Stores recent roots so a proof built against a slightly stale root is
/// still accepted after other deposits land.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RootHistory {
    /// Recent roots (most recent first)
    roots: VecDeque<[u8; 32]>,
    /// Maximum history size
    max_size: usize,
}

impl RootHistory {
    pub fn new(max_size: usize) -> Self {
        Self {
            roots: VecDeque::with_capacity(max_size),
            max_size,
        }
    }

    /// Add a new root
    pub fn push(&mut self, root: [u8; 32]) {
        self.roots.push_front(root);
        self.roots.truncate(self.max_size);
    }

    /// Check if a root is valid (current or recent)
    pub fn is_valid(&self, root: &[u8; 32]) -> bool {
        self.roots.contains(root)
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}
