use std::sync::Arc;
use std::time::Duration;

use rand::rngs::OsRng;
use shieldpool_privacy::{Keypair, PrivacyError};

use super::{eth, init_logging, ledger, test_config, wallet, TestPool};
use crate::error::PoolError;
use crate::ledger::Ledger;
use crate::pool::ShieldedPool;
use crate::prover::MockProver;
use crate::storage::WalletCheckpoint;
use crate::transaction::ExternalAddress;

const RECIPIENT: ExternalAddress = ExternalAddress([0xcd; 20]);

fn same_keys(pool: &TestPool) -> Keypair {
    Keypair::from_secret(pool.keypair().secret_key().clone())
}

#[tokio::test]
async fn submission_failure_restores_spendability() {
    init_logging();
    let config = test_config();
    let ledger = ledger(&config);
    let pool = wallet(&ledger, &config);
    pool.deposit(eth(8)).await.unwrap();
    let root = ledger.last_root().await.unwrap();

    ledger.fail_next_submit();
    let err = pool
        .withdraw(Vec::new(), eth(5), RECIPIENT, false)
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::SubmissionFailed(_)));

    // --- nothing landed, the note is spendable again ---
    assert_eq!(ledger.last_root().await.unwrap(), root);
    assert_eq!(pool.balance().await, u128::from(eth(8)));
    assert!(pool.in_flight().await.is_empty());

    pool.withdraw(Vec::new(), eth(5), RECIPIENT, false)
        .await
        .unwrap();
    assert_eq!(ledger.balance_of(&RECIPIENT).await, u128::from(eth(5)));
    assert_eq!(pool.balance().await, u128::from(eth(3)));
}

#[tokio::test]
async fn revert_restores_spendability() {
    let config = test_config();
    let ledger = ledger(&config);
    let pool = wallet(&ledger, &config);
    pool.deposit(eth(8)).await.unwrap();
    let note = pool.notes().await.remove(0);
    let nullifier = note.nullifier(pool.keypair().secret_key()).unwrap();

    ledger.revert_next();
    let err = pool
        .withdraw(vec![note.clone()], eth(2), RECIPIENT, false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("reverted"));
    assert!(!ledger.is_nullifier_spent(&nullifier).await.unwrap());
    assert!(!pool.shared().is_spent(&nullifier).await);
    let available: Vec<_> = pool.notes().await.iter().map(|n| n.commitment()).collect();
    assert_eq!(available, vec![note.commitment()]);

    let receipt = pool
        .withdraw(vec![note], eth(2), RECIPIENT, false)
        .await
        .unwrap();
    assert_eq!(receipt.nullifiers, vec![nullifier]);
    assert_eq!(pool.balance().await, u128::from(eth(6)));
}

#[tokio::test]
async fn timeout_then_resolve() {
    init_logging();
    let mut config = test_config();
    config.timeouts.confirmation_timeout_ms = 50;
    let ledger = ledger(&config);
    let pool = wallet(&ledger, &config);
    pool.deposit(eth(8)).await.unwrap();

    ledger.set_hold(true);
    let err = pool
        .withdraw(Vec::new(), eth(5), RECIPIENT, false)
        .await
        .unwrap_err();
    let tx = match err {
        PoolError::ConfirmationTimeout { tx } => tx,
        other => panic!("expected timeout, got {other}"),
    };

    // --- the input stays locked while the outcome is unknown ---
    assert_eq!(pool.in_flight().await, vec![tx]);
    assert_eq!(pool.balance().await, 0);
    assert!(pool.resolve(&tx).await.unwrap().is_none());
    assert_eq!(pool.in_flight().await, vec![tx]);

    ledger.set_hold(false);
    assert_eq!(ledger.release_held().await, 1);

    let receipt = pool.resolve(&tx).await.unwrap().unwrap();
    assert_eq!(receipt.tx_id, tx);
    assert!(pool.in_flight().await.is_empty());
    assert_eq!(ledger.balance_of(&RECIPIENT).await, u128::from(eth(5)));
    assert_eq!(pool.balance().await, u128::from(eth(3)));

    let err = pool.resolve(&tx).await.unwrap_err();
    assert!(matches!(err, PoolError::UnknownTransaction(_)));
}

#[tokio::test]
async fn checkpoint_round_trip() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wallet.json");
    let config = test_config();
    let ledger = ledger(&config);

    let pool = wallet(&ledger, &config);
    pool.deposit(eth(8)).await.unwrap();
    pool.withdraw(Vec::new(), eth(1), RECIPIENT, false)
        .await
        .unwrap();
    pool.save_checkpoint(&path).await.unwrap();
    let keys = same_keys(&pool);
    drop(pool);

    // --- the ledger moves on while we are offline ---
    let other = wallet(&ledger, &config);
    other.deposit(eth(4)).await.unwrap();

    let checkpoint = WalletCheckpoint::load(&path).unwrap();
    assert_eq!(checkpoint.tree_leaves.len(), 4);
    let restored = ShieldedPool::restore(
        ledger.clone(),
        Arc::new(MockProver::new()),
        keys,
        config.clone(),
        checkpoint,
    )
    .await
    .unwrap();

    assert_eq!(restored.shared().commitment_count().await, 6);
    assert_eq!(
        restored.shared().root().await,
        ledger.last_root().await.unwrap()
    );
    assert_eq!(restored.balance().await, u128::from(eth(7)));

    restored
        .withdraw(Vec::new(), eth(7), RECIPIENT, false)
        .await
        .unwrap();
    assert_eq!(restored.balance().await, 0);
    assert_eq!(ledger.balance_of(&RECIPIENT).await, u128::from(eth(8)));
}

#[tokio::test]
async fn checkpoint_divergence() {
    let config = test_config();
    let ledger = ledger(&config);
    let pool = wallet(&ledger, &config);
    pool.deposit(eth(8)).await.unwrap();
    let checkpoint = pool.checkpoint().await;

    let elsewhere = super::ledger(&config);
    let err = ShieldedPool::restore(
        elsewhere,
        Arc::new(MockProver::new()),
        same_keys(&pool),
        config.clone(),
        checkpoint,
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(
        err,
        PoolError::Privacy(PrivacyError::RootMismatch { .. })
    ));
}

#[tokio::test]
async fn confirmed_transactions_are_checkpointed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("wallet.json");
    let mut config = test_config();
    config.storage.checkpoint_path = Some(path.to_string_lossy().into_owned());
    let ledger = ledger(&config);
    let pool = wallet(&ledger, &config);

    pool.deposit(eth(8)).await.unwrap();

    let saved = WalletCheckpoint::load(&path).unwrap();
    assert_eq!(saved.owned_notes.len(), 1);
    assert_eq!(saved.owned_notes[0].amount.0, eth(8));
    assert_eq!(saved.tree_leaves.len(), 2);
    assert!(saved.pending_nullifiers.is_empty());
}

#[tokio::test]
async fn restore_learns_later_spends() {
    init_logging();
    let config = test_config();
    let ledger = ledger(&config);
    let pool = wallet(&ledger, &config);
    pool.deposit(eth(8)).await.unwrap();
    let stale = pool.checkpoint().await;

    pool.withdraw(Vec::new(), eth(5), RECIPIENT, false)
        .await
        .unwrap();

    let restored = ShieldedPool::restore(
        ledger.clone(),
        Arc::new(MockProver::new()),
        same_keys(&pool),
        config.clone(),
        stale,
    )
    .await
    .unwrap();

    // the spent note is gone, the change note was found by the sync
    assert_eq!(restored.balance().await, u128::from(eth(3)));
    assert_eq!(restored.notes().await.len(), 1);

    restored
        .withdraw(Vec::new(), eth(2), RECIPIENT, false)
        .await
        .unwrap();
    assert_eq!(restored.balance().await, u128::from(eth(1)));
    assert_eq!(ledger.balance_of(&RECIPIENT).await, u128::from(eth(7)));
}

#[tokio::test]
async fn revert_teaches_spent_inputs() {
    init_logging();
    let config = test_config();
    let ledger = ledger(&config);
    let pool = wallet(&ledger, &config);
    pool.deposit(eth(8)).await.unwrap();

    let twin = ShieldedPool::new(
        ledger.clone(),
        Arc::new(MockProver::new()),
        same_keys(&pool),
        config.clone(),
    )
    .unwrap();
    assert_eq!(twin.sync().await.unwrap(), 1);

    pool.withdraw(Vec::new(), eth(5), RECIPIENT, false)
        .await
        .unwrap();

    // the twin still holds the 0.08 note and picks it first
    let err = twin
        .withdraw(Vec::new(), eth(1), RECIPIENT, false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("reverted"));
    assert!(twin.in_flight().await.is_empty());
    assert_eq!(twin.balance().await, u128::from(eth(3)));

    twin.withdraw(Vec::new(), eth(1), RECIPIENT, false)
        .await
        .unwrap();
    assert_eq!(twin.balance().await, u128::from(eth(2)));
    assert_eq!(ledger.balance_of(&RECIPIENT).await, u128::from(eth(6)));
}

#[tokio::test]
async fn checkpoint_keeps_undecided_spend_locked() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wallet.json");
    let mut config = test_config();
    config.timeouts.confirmation_timeout_ms = 50;
    let ledger = ledger(&config);
    let pool = wallet(&ledger, &config);
    pool.deposit(eth(8)).await.unwrap();

    ledger.set_hold(true);
    let err = pool
        .withdraw(Vec::new(), eth(5), RECIPIENT, false)
        .await
        .unwrap_err();
    let tx = match err {
        PoolError::ConfirmationTimeout { tx } => tx,
        other => panic!("expected timeout, got {other}"),
    };
    pool.save_checkpoint(&path).await.unwrap();
    let keys = same_keys(&pool);
    drop(pool);

    let checkpoint = WalletCheckpoint::load(&path).unwrap();
    assert_eq!(checkpoint.in_flight.len(), 1);
    assert_eq!(checkpoint.in_flight[0].tx_id(), tx);
    let restored = ShieldedPool::restore(
        ledger.clone(),
        Arc::new(MockProver::new()),
        keys,
        config.clone(),
        checkpoint,
    )
    .await
    .unwrap();

    // --- still undecided: the input stays locked ---
    assert_eq!(restored.balance().await, 0);
    assert_eq!(restored.in_flight().await, vec![tx]);
    assert!(restored.resolve(&tx).await.unwrap().is_none());
    assert_eq!(restored.balance().await, 0);

    ledger.set_hold(false);
    assert_eq!(ledger.release_held().await, 1);
    restored.sync().await.unwrap();
    assert_eq!(restored.balance().await, u128::from(eth(3)));

    let receipt = restored.resolve(&tx).await.unwrap().unwrap();
    assert_eq!(receipt.tx_id, tx);
    assert!(restored.in_flight().await.is_empty());
    assert_eq!(restored.balance().await, u128::from(eth(3)));
    assert_eq!(ledger.balance_of(&RECIPIENT).await, u128::from(eth(5)));
}

#[tokio::test]
async fn cancelled_spend_releases_inputs() {
    init_logging();
    let config = test_config();
    let ledger = ledger(&config);
    let pool = ShieldedPool::new(
        ledger.clone(),
        Arc::new(MockProver::with_prove_time(300)),
        Keypair::generate(&mut OsRng),
        config.clone(),
    )
    .unwrap();
    pool.deposit(eth(8)).await.unwrap();
    let root = ledger.last_root().await.unwrap();

    // caller gives up while the proof is being generated
    let attempt = tokio::time::timeout(
        Duration::from_millis(100),
        pool.withdraw(Vec::new(), eth(5), RECIPIENT, false),
    )
    .await;
    assert!(attempt.is_err());

    assert_eq!(ledger.last_root().await.unwrap(), root);
    assert!(pool.in_flight().await.is_empty());
    assert_eq!(pool.balance().await, u128::from(eth(8)));

    pool.withdraw(Vec::new(), eth(5), RECIPIENT, false)
        .await
        .unwrap();
    assert_eq!(pool.balance().await, u128::from(eth(3)));
    assert_eq!(ledger.balance_of(&RECIPIENT).await, u128::from(eth(5)));
}
