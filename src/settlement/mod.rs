//! Settlement engine for custodial cross-chain swaps
//!
//! The engine:
//! 1. Validates a deposit and its embedded intent before anything is stored
//! 2. Locks in a quote and gates dispatch on payout-side liquidity
//! 3. Pays out under a per-chain lock and waits for confirmation
//! 4. Sweeps periodically to expire, retry and reconcile live intents

pub mod engine;
pub mod validation;

pub use engine::{QuotePreview, SettlementEngine, SubmitOutcome, SweepReport};

use crate::clock::Clock;
use crate::config::OracleConfig;
use crate::error::SettlerResult;
use crate::intent::IntentStore;
use crate::oracle::PriceOracle;

use std::sync::Arc;

/// Build the oracle from the persisted rate log, seeding the log on first run
pub async fn bootstrap_oracle(
    store: &dyn IntentStore,
    config: OracleConfig,
    clock: Arc<dyn Clock>,
) -> SettlerResult<PriceOracle> {
    let tail = store.rate_tail(config.history_capacity).await?;
    if !tail.is_empty() {
        return Ok(PriceOracle::resume(config, clock, tail));
    }

    let oracle = PriceOracle::new(config, clock);
    for record in oracle.history(1).await {
        store.append_rate(&record).await?;
    }
    Ok(oracle)
}
