//! Local state: the shared tree mirror, nullifier tracking and checkpoints.

pub mod checkpoint;
pub mod nullifiers;
pub mod shielded_state;

pub use checkpoint::WalletCheckpoint;
pub use nullifiers::{HolderId, NullifierStatus, NullifierTracker};
pub use shielded_state::SharedState;
