//! Bounded wait for payout confirmation

use crate::chain::{ChainManager, ConfirmationState};
use crate::intent::ChainSide;

use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Polls a payout until it confirms, fails, or the window elapses
pub struct ConfirmationWaiter {
    window: Duration,
    poll_interval: Duration,
}

impl ConfirmationWaiter {
    pub fn new(window: Duration, poll_interval: Duration) -> Self {
        Self {
            window,
            poll_interval,
        }
    }

    /// Returns `Confirmed` or `Failed` as soon as the chain reports one.
    /// When the window elapses the last observed non-final state is
    /// returned: not confirmed is not the same as failed.
    pub async fn wait(
        &self,
        chains: &ChainManager,
        side: ChainSide,
        tx_reference: &str,
    ) -> ConfirmationState {
        let mut last = ConfirmationState::Pending;

        let poll = async {
            loop {
                match chains.payout_status(side, tx_reference).await {
                    Ok(ConfirmationState::Confirmed) => {
                        info!("Payout {} confirmed on side {}", tx_reference, side);
                        return ConfirmationState::Confirmed;
                    }
                    Ok(ConfirmationState::Failed(reason)) => {
                        warn!("Payout {} failed on side {}: {}", tx_reference, side, reason);
                        return ConfirmationState::Failed(reason);
                    }
                    Ok(state) => {
                        debug!("Payout {} is {}", tx_reference, state);
                        last = state;
                    }
                    Err(e) => {
                        // transient, keep polling until the window closes
                        warn!("Failed to poll payout {}: {}", tx_reference, e);
                    }
                }
                sleep(self.poll_interval).await;
            }
        };

        let outcome = timeout(self.window, poll).await;
        match outcome {
            Ok(state) => state,
            Err(_) => {
                warn!(
                    "Payout {} not confirmed within {:?}",
                    tx_reference, self.window
                );
                last
            }
        }
    }
}
