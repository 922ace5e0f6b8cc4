mod recovery;

use std::sync::Arc;

use rand::rngs::OsRng;

use shieldpool_config::PoolConfig;
use shieldpool_privacy::Keypair;

use crate::ledger::MockLedger;
use crate::pool::ShieldedPool;
use crate::prover::MockProver;

pub(crate) const ETH: u64 = 1_000_000_000_000_000_000;

/// `hundredths` of one ETH in wei
pub(crate) fn eth(hundredths: u64) -> u64 {
    hundredths * (ETH / 100)
}

pub(crate) type TestPool = ShieldedPool<MockLedger, MockProver>;

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(crate) fn test_config() -> PoolConfig {
    let mut config = PoolConfig::default();
    config.tree.height = 12;
    config.timeouts.confirmation_timeout_ms = 2_000;
    config.timeouts.poll_interval_ms = 5;
    config
}

pub(crate) fn ledger(config: &PoolConfig) -> Arc<MockLedger> {
    Arc::new(MockLedger::new(config).unwrap())
}

pub(crate) fn wallet(ledger: &Arc<MockLedger>, config: &PoolConfig) -> TestPool {
    ShieldedPool::new(
        ledger.clone(),
        Arc::new(MockProver::new()),
        Keypair::generate(&mut OsRng),
        config.clone(),
    )
    .unwrap()
}
