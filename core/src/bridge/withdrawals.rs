//! Withdrawal Intent Tracking
//!
//! Tracks cross-domain withdrawals from ledger confirmation until the bridge
//! reports an outcome.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Withdrawal Lifecycle                          │
//! │                                                                  │
//! │  ┌──────────────┐    ┌──────────┐    ┌───────────┐              │
//! │  │ tx confirmed │───>│ Pending  │───>│ Finalized │              │
//! │  │ on the pool  │    │ (bridge) │    └───────────┘              │
//! │  └──────────────┘    └────┬─────┘                               │
//! │                           │          ┌───────────┐              │
//! │                           └─────────>│  Failed   │              │
//! │                                      └───────────┘              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{PoolError, Result};
use crate::transaction::{ExternalAddress, TxId};

// ============================================================================
// Withdrawal States
// ============================================================================

/// State of a cross-domain withdrawal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WithdrawalState {
    /// Confirmed on the pool, waiting for the bridge
    Pending,
    /// Funds released on the other side
    Finalized,
    /// Bridge gave up
    Failed { reason: String },
}

/// What the bridge reports for an intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeOutcome {
    Finalized,
    Failed(String),
}

/// A tracked withdrawal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalIntent {
    /// Pool transaction that released the value
    pub tx_id: TxId,
    /// Destination on the other domain
    pub recipient: ExternalAddress,
    /// Amount leaving the pool, before the L1 fee
    pub amount: u128,
    /// Fee for the bridge-side unwrapper
    pub l1_fee: u64,
    /// Current state
    pub state: WithdrawalState,
    /// Timestamp when created (unix seconds)
    pub created_at: u64,
}

impl WithdrawalIntent {
    pub fn new(tx_id: TxId, recipient: ExternalAddress, amount: u128, l1_fee: u64) -> Self {
        Self {
            tx_id,
            recipient,
            amount,
            l1_fee,
            state: WithdrawalState::Pending,
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    /// Amount the recipient receives
    pub fn net_amount(&self) -> u128 {
        self.amount.saturating_sub(u128::from(self.l1_fee))
    }
}

// ============================================================================
// Withdrawal Tracker
// ============================================================================

#[derive(Debug, Default)]
pub struct WithdrawalTracker {
    withdrawals: HashMap<TxId, WithdrawalIntent>,
    /// Index by destination for quick lookup
    by_recipient: HashMap<ExternalAddress, Vec<TxId>>,
}

impl WithdrawalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking an intent; re-adding a known tx is a no-op
    pub fn add(&mut self, intent: WithdrawalIntent) {
        if self.withdrawals.contains_key(&intent.tx_id) {
            return;
        }
        info!(
            "Tracking cross-domain withdrawal {} to {}",
            intent.tx_id, intent.recipient
        );
        self.by_recipient
            .entry(intent.recipient)
            .or_default()
            .push(intent.tx_id);
        self.withdrawals.insert(intent.tx_id, intent);
    }

    /// Apply a bridge report
    pub fn apply(&mut self, tx_id: &TxId, outcome: BridgeOutcome) -> Result<()> {
        match outcome {
            BridgeOutcome::Finalized => self.mark_finalized(tx_id),
            BridgeOutcome::Failed(reason) => self.mark_failed(tx_id, reason),
        }
    }

    pub fn mark_finalized(&mut self, tx_id: &TxId) -> Result<()> {
        let intent = self.pending_mut(tx_id, "finalize withdrawal")?;
        intent.state = WithdrawalState::Finalized;
        info!("Withdrawal {} finalized", tx_id);
        Ok(())
    }

    pub fn mark_failed(&mut self, tx_id: &TxId, reason: String) -> Result<()> {
        let intent = self.pending_mut(tx_id, "fail withdrawal")?;
        warn!("Withdrawal {} failed: {}", tx_id, reason);
        intent.state = WithdrawalState::Failed { reason };
        Ok(())
    }

    fn pending_mut(&mut self, tx_id: &TxId, operation: &'static str) -> Result<&mut WithdrawalIntent> {
        let intent = self
            .withdrawals
            .get_mut(tx_id)
            .ok_or(PoolError::UnknownTransaction(*tx_id))?;
        if intent.state != WithdrawalState::Pending {
            return Err(PoolError::InvalidState {
                operation,
                state: format!("{:?}", intent.state),
            });
        }
        Ok(intent)
    }

    pub fn get(&self, tx_id: &TxId) -> Option<&WithdrawalIntent> {
        self.withdrawals.get(tx_id)
    }

    pub fn by_recipient(&self, recipient: &ExternalAddress) -> Vec<&WithdrawalIntent> {
        self.by_recipient
            .get(recipient)
            .map(|ids| ids.iter().filter_map(|id| self.withdrawals.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn pending(&self) -> Vec<&WithdrawalIntent> {
        self.withdrawals
            .values()
            .filter(|w| w.state == WithdrawalState::Pending)
            .collect()
    }

    /// All intents, for checkpointing
    pub fn intents(&self) -> Vec<WithdrawalIntent> {
        self.withdrawals.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.withdrawals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.withdrawals.is_empty()
    }
}
