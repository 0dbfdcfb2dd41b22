//! Local nonce tracking for the payout wallet
//!
//! Handles:
//! - Sequential allocation without a round trip per payout
//! - Release of nonces whose broadcast failed
//! - Resync with the chain after a "nonce too low" rejection

use super::ChainProvider;
use crate::error::{SettlerError, SettlerResult};

use ethers::prelude::*;
use ethers::types::Address;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

struct NonceState {
    /// Next nonce to hand out
    current: u64,
    /// Broadcast but not yet confirmed: nonce -> tx hash
    pending: BTreeMap<u64, String>,
}

/// Nonce manager for one wallet on one chain
pub struct NonceManager {
    chain: String,
    wallet_address: Address,
    state: Mutex<NonceState>,
}

impl NonceManager {
    /// Initialize from the on-chain transaction count
    pub async fn init(provider: &ChainProvider, wallet_address: Address) -> SettlerResult<Self> {
        let on_chain = Self::fetch_nonce(provider, wallet_address).await?;
        debug!("Initialized nonce for chain {}: {}", provider.name(), on_chain);

        Ok(Self::starting_at(provider.name(), wallet_address, on_chain))
    }

    fn starting_at(chain: &str, wallet_address: Address, nonce: u64) -> Self {
        Self {
            chain: chain.to_string(),
            wallet_address,
            state: Mutex::new(NonceState {
                current: nonce,
                pending: BTreeMap::new(),
            }),
        }
    }

    /// Allocate the next nonce
    pub async fn next(&self) -> u64 {
        let mut state = self.state.lock().await;
        let nonce = state.current;
        state.current += 1;
        debug!("Allocated nonce {} for chain {}", nonce, self.chain);
        nonce
    }

    pub async fn mark_pending(&self, nonce: u64, tx_hash: &str) {
        self.state
            .lock()
            .await
            .pending
            .insert(nonce, tx_hash.to_string());
    }

    /// Release a nonce whose transaction never reached the mempool
    pub async fn release(&self, nonce: u64) {
        let mut state = self.state.lock().await;
        state.pending.remove(&nonce);

        if nonce + 1 == state.current {
            state.current = nonce;
        }
    }

    /// Sync with on-chain state
    pub async fn sync(&self, provider: &ChainProvider) -> SettlerResult<()> {
        let on_chain = Self::fetch_nonce(provider, self.wallet_address).await?;
        let mut state = self.state.lock().await;

        state.pending.retain(|nonce, _| *nonce >= on_chain);
        if state.current < on_chain {
            warn!(
                "Nonce behind chain {}: local {}, chain {}",
                self.chain, state.current, on_chain
            );
            state.current = on_chain;
        }

        Ok(())
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    async fn fetch_nonce(provider: &ChainProvider, wallet_address: Address) -> SettlerResult<u64> {
        let nonce = provider
            .http()
            .get_transaction_count(wallet_address, None)
            .await
            .map_err(|e| SettlerError::Nonce {
                chain: provider.name().to_string(),
                message: e.to_string(),
            })?;

        Ok(nonce.as_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequential_allocation() {
        let manager = NonceManager::starting_at("alpha", Address::zero(), 7);
        assert_eq!(manager.next().await, 7);
        assert_eq!(manager.next().await, 8);
        manager.mark_pending(8, "0xabc").await;
        assert_eq!(manager.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_release_of_latest_nonce_reuses_it() {
        let manager = NonceManager::starting_at("alpha", Address::zero(), 3);
        let nonce = manager.next().await;
        manager.release(nonce).await;
        assert_eq!(manager.next().await, 3);
    }

    #[tokio::test]
    async fn test_release_of_older_nonce_keeps_sequence() {
        let manager = NonceManager::starting_at("alpha", Address::zero(), 3);
        let first = manager.next().await;
        let _second = manager.next().await;
        manager.release(first).await;
        assert_eq!(manager.next().await, 5);
    }
}
