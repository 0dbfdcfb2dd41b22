//! Chain provider with multi-RPC support and automatic failover

use crate::config::ChainConfig;
use crate::error::{SettlerError, SettlerResult};

use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Last known block number
    last_block: RwLock<u64>,
}

impl ChainProvider {
    /// Create a new chain provider
    pub async fn new(config: ChainConfig) -> SettlerResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.name, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(SettlerError::ChainConnection {
                chain: config.name.clone(),
                message: "No valid RPC providers".to_string(),
            });
        }

        let initial_block = http_providers[0]
            .get_block_number()
            .await
            .map(|b| b.as_u64())
            .unwrap_or(0);

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            last_block: RwLock::new(initial_block),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.name, next);
    }

    fn connection_error(&self, message: impl ToString) -> SettlerError {
        SettlerError::ChainConnection {
            chain: self.config.name.clone(),
            message: message.to_string(),
        }
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> SettlerResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => {
                    let block_num = block.as_u64();
                    *self.last_block.write().await = block_num;
                    return Ok(block_num);
                }
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.name, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed"))
    }

    /// Last block number observed by any call
    pub async fn last_block(&self) -> u64 {
        *self.last_block.read().await
    }

    /// Get a transaction by hash with failover
    pub async fn get_transaction(&self, tx_hash: H256) -> SettlerResult<Option<Transaction>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_transaction(tx_hash).await {
                Ok(tx) => return Ok(tx),
                Err(e) => {
                    warn!(
                        "Failed to get transaction from chain {}: {}",
                        self.config.name, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed to get transaction"))
    }

    /// Get transaction receipt
    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> SettlerResult<Option<TransactionReceipt>> {
        self.http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.connection_error(e))
    }

    /// Get native balance with failover
    pub async fn get_balance(&self, account: Address) -> SettlerResult<U256> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_balance(account, None).await {
                Ok(balance) => return Ok(balance),
                Err(e) => {
                    warn!(
                        "Failed to get balance from chain {}: {}",
                        self.config.name, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed to get balance"))
    }

    /// Current legacy gas price
    pub async fn get_gas_price(&self) -> SettlerResult<U256> {
        self.http()
            .get_gas_price()
            .await
            .map_err(|e| self.connection_error(e))
    }

    /// Number of blocks that include `block_number` up to the current head
    pub async fn confirmations(&self, block_number: u64) -> SettlerResult<u64> {
        let current = self.get_block_number().await?;
        Ok(current.saturating_sub(block_number) + 1)
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.name, e);
                false
            }
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }
}
