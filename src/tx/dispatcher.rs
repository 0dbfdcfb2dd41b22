//! Liquidity-gated payout dispatch, serialized per payout chain

use super::confirm::ConfirmationWaiter;
use crate::chain::{ChainManager, ConfirmationState};
use crate::clock::Clock;
use crate::error::{SettlerError, SettlerResult};
use crate::intent::{ChainSide, Intent, IntentStatus, IntentStore, IntentUpdate};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Result of a fresh custody balance read against a required payout
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiquidityProbe {
    pub have: f64,
    pub need: f64,
}

impl LiquidityProbe {
    pub fn sufficient(&self) -> bool {
        self.have >= self.need
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Confirmed { tx_reference: String },
    /// Broadcast, but no confirmation inside the window
    Unconfirmed { tx_reference: String },
    /// Included but unsuccessful; nothing was paid
    Reverted { tx_reference: String, reason: String },
    /// Nothing was sent
    InsufficientLiquidity { have: f64, need: f64 },
    /// Nothing was sent: a read or write failed before broadcast
    Deferred { reason: String },
    /// Nothing was sent: the stored intent is settled or already broadcast
    Superseded,
}

pub struct PayoutDispatcher {
    chains: Arc<ChainManager>,
    store: Arc<dyn IntentStore>,
    clock: Arc<dyn Clock>,
    liquidity_buffer: f64,
    waiter: ConfirmationWaiter,
    lock_a: Mutex<()>,
    lock_b: Mutex<()>,
}

impl PayoutDispatcher {
    pub fn new(
        chains: Arc<ChainManager>,
        store: Arc<dyn IntentStore>,
        clock: Arc<dyn Clock>,
        liquidity_buffer: f64,
        confirmation_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            chains,
            store,
            clock,
            liquidity_buffer,
            waiter: ConfirmationWaiter::new(confirmation_timeout, poll_interval),
            lock_a: Mutex::new(()),
            lock_b: Mutex::new(()),
        }
    }

    fn lock(&self, side: ChainSide) -> &Mutex<()> {
        match side {
            ChainSide::A => &self.lock_a,
            ChainSide::B => &self.lock_b,
        }
    }

    /// Uncached custody balance on `side` against `amount_out` plus buffer
    pub async fn probe(&self, side: ChainSide, amount_out: f64) -> SettlerResult<LiquidityProbe> {
        let have = self.chains.fetch_balance(side, true).await?;
        Ok(LiquidityProbe {
            have,
            need: amount_out * self.liquidity_buffer,
        })
    }

    /// Claim, probe, send and wait for confirmation while holding the
    /// payout chain's lock. Always pays the locked-in `quoted_amount_out`.
    ///
    /// Returns `Err` only when a broadcast was attempted and refused. Every
    /// failure before that point is reported as `Deferred`.
    pub async fn dispatch(&self, intent: &Intent) -> SettlerResult<DispatchOutcome> {
        let side = intent.direction.target();
        let _guard = self.lock(side).lock().await;

        // The caller's copy may predate an attempt that already paid
        let current = match self.store.get_by_id(&intent.id).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                warn!("Intent {} vanished before dispatch", intent.id);
                return Ok(DispatchOutcome::Superseded);
            }
            Err(e) => return Ok(deferred(&intent.id, e)),
        };
        if current.status.is_terminal() || current.payout_reference.is_some() {
            debug!(
                "Intent {} is {} (payout {:?}), not dispatching",
                current.id, current.status, current.payout_reference
            );
            return Ok(DispatchOutcome::Superseded);
        }

        let probe = match self.probe(side, current.quoted_amount_out).await {
            Ok(probe) => probe,
            Err(e) => return Ok(deferred(&current.id, e)),
        };
        if !probe.sufficient() {
            debug!(
                "Intent {} waiting for liquidity on side {}: have {}, need {}",
                current.id, side, probe.have, probe.need
            );
            return Ok(DispatchOutcome::InsufficientLiquidity {
                have: probe.have,
                need: probe.need,
            });
        }

        let claimed = match self
            .store
            .claim_for_dispatch(&current.id, self.clock.now_millis())
            .await
        {
            Ok(Some(claimed)) => claimed,
            Ok(None) => return Ok(DispatchOutcome::Superseded),
            Err(e) => return Ok(deferred(&current.id, e)),
        };
        if current.status != IntentStatus::Open {
            info!("Intent {} {} -> open", claimed.id, current.status);
        }

        crate::metrics::record_dispatch_attempt(side.as_str());
        let receipt = match self
            .chains
            .dispatch_payout(side, &claimed.target_address, claimed.quoted_amount_out)
            .await
        {
            Ok(receipt) => receipt,
            // Refused before anything was signed or sent
            Err(SettlerError::InsufficientBalance { have, need, .. }) => {
                return Ok(DispatchOutcome::InsufficientLiquidity { have, need })
            }
            Err(e @ SettlerError::ChainConnection { .. }) => {
                return Ok(deferred(&claimed.id, e))
            }
            Err(e) => return Err(e),
        };
        let tx_reference = receipt.tx_reference;

        // Record the broadcast before waiting so a restart reconciles it
        let update = IntentUpdate {
            payout_reference: Some(Some(tx_reference.clone())),
            updated_at: self.clock.now_millis(),
            ..Default::default()
        };
        if let Err(e) = self.store.update(&claimed.id, update).await {
            error!(
                "Failed to record payout {} for intent {}: {}",
                tx_reference, claimed.id, e
            );
        }

        let outcome = match self.waiter.wait(&self.chains, side, &tx_reference).await {
            ConfirmationState::Confirmed => DispatchOutcome::Confirmed { tx_reference },
            ConfirmationState::Failed(reason) => DispatchOutcome::Reverted {
                tx_reference,
                reason,
            },
            ConfirmationState::Pending | ConfirmationState::NotFound => {
                DispatchOutcome::Unconfirmed { tx_reference }
            }
        };

        Ok(outcome)
    }
}

fn deferred(id: &str, err: SettlerError) -> DispatchOutcome {
    warn!("Dispatch for intent {} deferred: {}", id, err);
    DispatchOutcome::Deferred {
        reason: err.to_string(),
    }
}
