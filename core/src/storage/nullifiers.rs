//! Local nullifier tracking.
//!
//! ```text
//!   (absent) ──mark_pending──> Pending(holder) ──mark_confirmed──> Confirmed
//!       ^                            │
//!       └──────release(holder)───────┘
//! ```
//!
//! Pending marks belong to the builder that placed them, so one builder's
//! release can never free a nullifier another builder is spending.
//! Confirmed is terminal.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use shieldpool_privacy::Nullifier;

use crate::error::{PoolError, Result};

/// Identifies the builder holding a pending mark
pub type HolderId = u64;

/// Holder assigned to pending marks loaded from a checkpoint
pub const RESTORED_HOLDER: HolderId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NullifierStatus {
    Pending(HolderId),
    Confirmed,
}

#[derive(Debug, Default)]
pub struct NullifierTracker {
    entries: HashMap<Nullifier, NullifierStatus>,
}

impl NullifierTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, nullifier: &Nullifier) -> Option<NullifierStatus> {
        self.entries.get(nullifier).copied()
    }

    /// Confirmed on the ledger
    pub fn is_spent(&self, nullifier: &Nullifier) -> bool {
        matches!(self.status(nullifier), Some(NullifierStatus::Confirmed))
    }

    pub fn is_pending(&self, nullifier: &Nullifier) -> bool {
        matches!(self.status(nullifier), Some(NullifierStatus::Pending(_)))
    }

    /// Spent or locked; either way not selectable
    pub fn is_unavailable(&self, nullifier: &Nullifier) -> bool {
        self.entries.contains_key(nullifier)
    }

    fn check_markable(&self, nullifier: &Nullifier, holder: HolderId) -> Result<()> {
        match self.status(nullifier) {
            Some(NullifierStatus::Confirmed) => Err(PoolError::DoubleSpend {
                nullifier: nullifier.0,
            }),
            Some(NullifierStatus::Pending(other)) if other != holder => {
                Err(PoolError::NullifierPending {
                    nullifier: nullifier.0,
                })
            }
            _ => Ok(()),
        }
    }

    /// Lock a nullifier for `holder`
    pub fn mark_pending(&mut self, nullifier: Nullifier, holder: HolderId) -> Result<()> {
        self.check_markable(&nullifier, holder)?;
        self.entries
            .insert(nullifier, NullifierStatus::Pending(holder));
        Ok(())
    }

    /// Lock every nullifier or none
    pub fn mark_pending_all(&mut self, nullifiers: &[Nullifier], holder: HolderId) -> Result<()> {
        for nullifier in nullifiers {
            self.check_markable(nullifier, holder)?;
        }
        for nullifier in nullifiers {
            self.entries
                .insert(*nullifier, NullifierStatus::Pending(holder));
        }
        Ok(())
    }

    pub fn mark_confirmed(&mut self, nullifier: Nullifier) {
        self.entries.insert(nullifier, NullifierStatus::Confirmed);
    }

    /// Drop `holder`'s pending mark; returns whether anything was released
    pub fn release(&mut self, nullifier: &Nullifier, holder: HolderId) -> bool {
        if self.status(nullifier) == Some(NullifierStatus::Pending(holder)) {
            self.entries.remove(nullifier);
            true
        } else {
            false
        }
    }

    /// Release `holder`'s marks among `nullifiers`
    pub fn release_all(&mut self, nullifiers: &[Nullifier], holder: HolderId) -> usize {
        nullifiers
            .iter()
            .filter(|nf| self.release(nf, holder))
            .count()
    }

    /// Hand `from`'s pending marks among `nullifiers` over to `to`
    ///
    /// Absent nullifiers are marked for `to`; confirmed ones stay confirmed.
    pub fn reassign(&mut self, nullifiers: &[Nullifier], from: HolderId, to: HolderId) -> Result<()> {
        for nullifier in nullifiers {
            if let Some(NullifierStatus::Pending(other)) = self.status(nullifier) {
                if other != from && other != to {
                    return Err(PoolError::NullifierPending {
                        nullifier: nullifier.0,
                    });
                }
            }
        }
        for nullifier in nullifiers {
            if !self.is_spent(nullifier) {
                self.entries
                    .insert(*nullifier, NullifierStatus::Pending(to));
            }
        }
        Ok(())
    }

    pub fn spent(&self) -> impl Iterator<Item = &Nullifier> {
        self.entries
            .iter()
            .filter(|(_, status)| **status == NullifierStatus::Confirmed)
            .map(|(nf, _)| nf)
    }

    pub fn pending(&self) -> impl Iterator<Item = &Nullifier> {
        self.entries
            .iter()
            .filter(|(_, status)| matches!(status, NullifierStatus::Pending(_)))
            .map(|(nf, _)| nf)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nf(byte: u8) -> Nullifier {
        Nullifier([byte; 32])
    }

    #[test]
    fn test_pending_then_confirmed() {
        let mut tracker = NullifierTracker::new();
        tracker.mark_pending(nf(1), 7).unwrap();

        assert!(tracker.is_pending(&nf(1)));
        assert!(!tracker.is_spent(&nf(1)));

        tracker.mark_confirmed(nf(1));
        assert!(tracker.is_spent(&nf(1)));
        assert!(!tracker.is_pending(&nf(1)));
    }

    #[test]
    fn test_confirmed_cannot_be_marked_again() {
        let mut tracker = NullifierTracker::new();
        tracker.mark_confirmed(nf(1));

        let err = tracker.mark_pending(nf(1), 1).unwrap_err();
        assert!(matches!(err, PoolError::DoubleSpend { nullifier } if nullifier == [1u8; 32]));
    }

    #[test]
    fn test_pending_is_exclusive_per_holder() {
        let mut tracker = NullifierTracker::new();
        tracker.mark_pending(nf(1), 1).unwrap();

        // same holder may re-mark
        tracker.mark_pending(nf(1), 1).unwrap();

        assert!(matches!(
            tracker.mark_pending(nf(1), 2),
            Err(PoolError::NullifierPending { .. })
        ));
    }

    #[test]
    fn test_mark_pending_all_is_atomic() {
        let mut tracker = NullifierTracker::new();
        tracker.mark_pending(nf(2), 1).unwrap();

        assert!(tracker.mark_pending_all(&[nf(1), nf(2), nf(3)], 2).is_err());
        assert!(!tracker.is_unavailable(&nf(1)));
        assert!(!tracker.is_unavailable(&nf(3)));
    }

    #[test]
    fn test_release_only_own_marks() {
        let mut tracker = NullifierTracker::new();
        tracker.mark_pending_all(&[nf(1), nf(2)], 1).unwrap();
        tracker.mark_pending(nf(3), 2).unwrap();

        assert_eq!(tracker.release_all(&[nf(1), nf(2), nf(3)], 1), 2);
        assert!(tracker.is_pending(&nf(3)));

        // second release is a no-op
        assert_eq!(tracker.release_all(&[nf(1), nf(2)], 1), 0);
        assert!(tracker.is_pending(&nf(3)));
    }

    #[test]
    fn test_release_never_clears_confirmed() {
        let mut tracker = NullifierTracker::new();
        tracker.mark_pending(nf(1), 1).unwrap();
        tracker.mark_confirmed(nf(1));

        assert!(!tracker.release(&nf(1), 1));
        assert!(tracker.is_spent(&nf(1)));
        assert_eq!(tracker.spent().count(), 1);
        assert_eq!(tracker.pending().count(), 0);
    }

    #[test]
    fn test_reassign_moves_restored_marks() {
        let mut tracker = NullifierTracker::new();
        tracker.mark_pending_all(&[nf(1), nf(2)], RESTORED_HOLDER).unwrap();
        tracker.mark_confirmed(nf(3));
        tracker.mark_pending(nf(4), 9).unwrap();

        assert!(tracker.reassign(&[nf(1), nf(4)], RESTORED_HOLDER, 5).is_err());
        assert_eq!(tracker.status(&nf(1)), Some(NullifierStatus::Pending(RESTORED_HOLDER)));

        tracker.reassign(&[nf(1), nf(3)], RESTORED_HOLDER, 5).unwrap();
        assert_eq!(tracker.status(&nf(1)), Some(NullifierStatus::Pending(5)));
        assert!(tracker.is_spent(&nf(3)));

        // the old holder can no longer free it
        assert!(!tracker.release(&nf(1), RESTORED_HOLDER));
        assert!(tracker.release(&nf(1), 5));
        assert!(tracker.is_pending(&nf(2)));
    }
}
