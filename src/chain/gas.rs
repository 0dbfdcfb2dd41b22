//! Gas pricing for native-value payouts

use super::ChainProvider;
use crate::error::SettlerResult;

use ethers::types::U256;
use tracing::{debug, warn};

/// Gas for a plain value transfer to an externally owned account
pub const TRANSFER_GAS: u64 = 21_000;

const GWEI: u64 = 1_000_000_000;

/// Gas estimator for payout transfers
pub struct GasEstimator {
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
    /// Ceiling in wei
    max_gas_price: U256,
}

impl GasEstimator {
    pub fn new(max_gas_price_gwei: u64) -> Self {
        Self {
            gas_price_buffer_percent: 10,
            max_gas_price: U256::from(max_gas_price_gwei) * U256::from(GWEI),
        }
    }

    pub fn transfer_gas_limit(&self) -> U256 {
        U256::from(TRANSFER_GAS)
    }

    /// Buffered node gas price, capped at the configured ceiling
    pub async fn get_gas_price(&self, provider: &ChainProvider) -> SettlerResult<U256> {
        let price = provider.get_gas_price().await?;
        let price = self.buffered(price);
        debug!("Gas price for chain {}: {}", provider.name(), price);
        Ok(price)
    }

    fn buffered(&self, price: U256) -> U256 {
        let buffered = price + price * self.gas_price_buffer_percent / 100;
        if buffered > self.max_gas_price {
            warn!(
                "Gas price {} above ceiling, capping at {}",
                buffered, self.max_gas_price
            );
            return self.max_gas_price;
        }
        buffered
    }

    /// Calculate total cost in wei
    pub fn calculate_cost(gas_limit: U256, gas_price: U256) -> U256 {
        gas_limit * gas_price
    }
}
