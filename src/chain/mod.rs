//! Chain module - the two ledgers the settler bridges
//!
//! This module provides:
//! - The `ChainClient` port the engine talks to
//! - A manager holding one client per side with a short-lived balance cache
//! - An EVM implementation with multi-RPC failover and local signing

pub mod evm;
#[cfg(test)]
pub(crate) mod fake;
mod gas;
mod nonce;
pub mod provider;

pub use evm::EvmChainClient;
pub use gas::GasEstimator;
pub use nonce::NonceManager;
pub use provider::ChainProvider;

use crate::clock::Clock;
use crate::config::{ChainConfig, Settings};
use crate::error::{SettlerError, SettlerResult};
use crate::intent::ChainSide;

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::signers::LocalWallet;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Confirmation state of a transaction as seen by the chain
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConfirmationState {
    Confirmed,
    /// Seen but not yet at the required depth
    Pending,
    /// Included but unsuccessful
    Failed(String),
    NotFound,
}

impl fmt::Display for ConfirmationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfirmationState::Confirmed => f.write_str("confirmed"),
            ConfirmationState::Pending => f.write_str("pending"),
            ConfirmationState::Failed(reason) => write!(f, "failed: {}", reason),
            ConfirmationState::NotFound => f.write_str("not_found"),
        }
    }
}

/// An inbound transfer as observed on the source chain
#[derive(Debug, Clone, PartialEq)]
pub struct Deposit {
    pub from: String,
    pub to: String,
    /// Decimal units of the chain's asset
    pub amount: f64,
    /// Raw memo attached to the transfer
    pub memo: String,
    pub confirmation: ConfirmationState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PayoutReceipt {
    pub tx_reference: String,
}

/// Port to a single ledger
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Look up a deposit by transaction reference. `None` if the chain has
    /// never seen it.
    async fn fetch_deposit(&self, reference: &str) -> SettlerResult<Option<Deposit>>;

    /// Balance of `account` in decimal units
    async fn fetch_balance(&self, account: &str) -> SettlerResult<f64>;

    /// Broadcast a transfer of `amount` from the custody account to `to`
    async fn dispatch_payout(&self, to: &str, amount: f64) -> SettlerResult<PayoutReceipt>;

    async fn payout_status(&self, tx_reference: &str) -> SettlerResult<ConfirmationState>;

    async fn health_check(&self) -> bool;
}

/// A configured side: its identity plus the client that reaches it
pub struct ChainEndpoint {
    pub side: ChainSide,
    pub name: String,
    pub chain_id: u64,
    pub asset: String,
    pub custody_address: String,
    pub client: Arc<dyn ChainClient>,
}

impl ChainEndpoint {
    pub fn new(side: ChainSide, config: &ChainConfig, client: Arc<dyn ChainClient>) -> Self {
        Self {
            side,
            name: config.name.clone(),
            chain_id: config.chain_id,
            asset: config.asset.clone(),
            custody_address: config.custody_address.clone(),
            client,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedBalance {
    amount: f64,
    fetched_at: i64,
}

/// Manages both configured chains
pub struct ChainManager {
    endpoints: DashMap<ChainSide, Arc<ChainEndpoint>>,
    /// Custody balances for the quote path
    balances: DashMap<ChainSide, CachedBalance>,
    balance_ttl_ms: i64,
    clock: Arc<dyn Clock>,
}

impl ChainManager {
    pub fn new(balance_cache_ttl_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            endpoints: DashMap::new(),
            balances: DashMap::new(),
            balance_ttl_ms: i64::try_from(balance_cache_ttl_secs.saturating_mul(1000))
                .unwrap_or(i64::MAX),
            clock,
        }
    }

    /// Connect EVM clients for both configured sides
    pub async fn connect(settings: &Settings, clock: Arc<dyn Clock>) -> SettlerResult<Self> {
        let wallet = load_wallet(&settings.wallet.private_key_env)?;
        let manager = Self::new(settings.settler.balance_cache_ttl_secs, clock);

        for side in [ChainSide::A, ChainSide::B] {
            let chain_config = settings.chains.side(side);
            info!(
                "Initializing chain {} (side {}, ID: {})",
                chain_config.name, side, chain_config.chain_id
            );

            let client = EvmChainClient::connect(chain_config.clone(), wallet.clone()).await?;
            manager.register(ChainEndpoint::new(side, chain_config, Arc::new(client)));

            info!("Chain {} initialized successfully", chain_config.name);
        }

        Ok(manager)
    }

    pub fn register(&self, endpoint: ChainEndpoint) {
        self.balances.remove(&endpoint.side);
        self.endpoints.insert(endpoint.side, Arc::new(endpoint));
    }

    pub fn endpoint(&self, side: ChainSide) -> SettlerResult<Arc<ChainEndpoint>> {
        self.endpoints
            .get(&side)
            .map(|e| e.clone())
            .ok_or_else(|| SettlerError::Config(format!("Chain side {} is not registered", side)))
    }

    pub async fn fetch_deposit(
        &self,
        side: ChainSide,
        reference: &str,
    ) -> SettlerResult<Option<Deposit>> {
        self.endpoint(side)?.client.fetch_deposit(reference).await
    }

    /// Custody balance on `side`. `fresh` bypasses the cache; fresh reads
    /// refresh it.
    pub async fn fetch_balance(&self, side: ChainSide, fresh: bool) -> SettlerResult<f64> {
        let now = self.clock.now_millis();
        if !fresh {
            if let Some(cached) = self.balances.get(&side) {
                if now - cached.fetched_at < self.balance_ttl_ms {
                    return Ok(cached.amount);
                }
            }
        }

        let endpoint = self.endpoint(side)?;
        let amount = endpoint
            .client
            .fetch_balance(&endpoint.custody_address)
            .await?;
        self.balances.insert(
            side,
            CachedBalance {
                amount,
                fetched_at: now,
            },
        );
        debug!("Custody balance on {}: {}", endpoint.name, amount);
        crate::metrics::record_custody_balance(&endpoint.name, amount);
        Ok(amount)
    }

    pub async fn dispatch_payout(
        &self,
        side: ChainSide,
        to: &str,
        amount: f64,
    ) -> SettlerResult<PayoutReceipt> {
        let endpoint = self.endpoint(side)?;
        let result = endpoint.client.dispatch_payout(to, amount).await;
        // Whatever happened, the cached figure may be stale now
        self.balances.remove(&side);
        result
    }

    pub async fn payout_status(
        &self,
        side: ChainSide,
        tx_reference: &str,
    ) -> SettlerResult<ConfirmationState> {
        self.endpoint(side)?.client.payout_status(tx_reference).await
    }

    /// Health check for both chains
    pub async fn health_check(&self) -> Vec<(ChainSide, bool)> {
        let mut results = Vec::new();

        let endpoints: Vec<Arc<ChainEndpoint>> =
            self.endpoints.iter().map(|e| e.value().clone()).collect();
        for endpoint in endpoints {
            let healthy = endpoint.client.health_check().await;
            if !healthy {
                error!("Chain {} failed its health check", endpoint.name);
            }
            results.push((endpoint.side, healthy));

            crate::metrics::record_chain_health(&endpoint.name, healthy);
        }

        results.sort_by_key(|(side, _)| side.as_str());
        results
    }
}

/// Load the payout signing key from the named environment variable
fn load_wallet(private_key_env: &str) -> SettlerResult<LocalWallet> {
    let key = std::env::var(private_key_env).map_err(|_| {
        SettlerError::Wallet(format!(
            "No wallet configured. Set {} to the payout private key",
            private_key_env
        ))
    })?;

    key.trim()
        .parse::<LocalWallet>()
        .map_err(|e| SettlerError::Wallet(format!("Invalid private key: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use mockall::predicate::eq;

    fn endpoint(side: ChainSide, client: MockChainClient) -> ChainEndpoint {
        ChainEndpoint {
            side,
            name: format!("chain-{}", side),
            chain_id: 1,
            asset: "AAA".to_string(),
            custody_address: "0xcustody".to_string(),
            client: Arc::new(client),
        }
    }

    #[tokio::test]
    async fn test_cached_balance_within_ttl() {
        let mut client = MockChainClient::new();
        client
            .expect_fetch_balance()
            .with(eq("0xcustody"))
            .times(2)
            .returning(|_| Ok(7.5));

        let clock = Arc::new(ManualClock::new(0));
        let manager = ChainManager::new(15, clock.clone());
        manager.register(endpoint(ChainSide::B, client));

        assert_eq!(manager.fetch_balance(ChainSide::B, false).await.unwrap(), 7.5);
        clock.advance_secs(10);
        // served from cache
        assert_eq!(manager.fetch_balance(ChainSide::B, false).await.unwrap(), 7.5);
        clock.advance_secs(10);
        // expired, second RPC
        assert_eq!(manager.fetch_balance(ChainSide::B, false).await.unwrap(), 7.5);
    }

    #[tokio::test]
    async fn test_fresh_read_bypasses_cache() {
        let mut client = MockChainClient::new();
        let mut balances = vec![1.0, 2.0].into_iter();
        client
            .expect_fetch_balance()
            .times(2)
            .returning(move |_| Ok(balances.next().unwrap_or_default()));

        let manager = ChainManager::new(15, Arc::new(ManualClock::new(0)));
        manager.register(endpoint(ChainSide::A, client));

        assert_eq!(manager.fetch_balance(ChainSide::A, false).await.unwrap(), 1.0);
        assert_eq!(manager.fetch_balance(ChainSide::A, true).await.unwrap(), 2.0);
        // the fresh read refreshed the cache
        assert_eq!(manager.fetch_balance(ChainSide::A, false).await.unwrap(), 2.0);
    }

    #[tokio::test]
    async fn test_payout_invalidates_cache() {
        let mut client = MockChainClient::new();
        client.expect_fetch_balance().times(2).returning(|_| Ok(3.0));
        client
            .expect_dispatch_payout()
            .with(eq("0xuser"), eq(1.0))
            .times(1)
            .returning(|_, _| {
                Ok(PayoutReceipt {
                    tx_reference: "0xpayout".to_string(),
                })
            });

        let manager = ChainManager::new(15, Arc::new(ManualClock::new(0)));
        manager.register(endpoint(ChainSide::A, client));

        manager.fetch_balance(ChainSide::A, false).await.unwrap();
        let receipt = manager.dispatch_payout(ChainSide::A, "0xuser", 1.0).await.unwrap();
        assert_eq!(receipt.tx_reference, "0xpayout");
        manager.fetch_balance(ChainSide::A, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_unregistered_side_is_config_error() {
        let manager = ChainManager::new(15, Arc::new(ManualClock::new(0)));
        let err = manager.fetch_balance(ChainSide::A, true).await.unwrap_err();
        assert!(matches!(err, SettlerError::Config(_)));
    }

    #[test]
    fn test_missing_wallet_env() {
        let err = load_wallet("SETTLER_TEST_KEY_THAT_IS_NOT_SET").unwrap_err();
        assert!(matches!(err, SettlerError::Wallet(_)));
    }
}
