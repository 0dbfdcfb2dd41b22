//! EVM ledger client
//!
//! Deposits are native-value transfers into the custody account with the
//! intent memo carried as call data. Payouts are legacy-priced value
//! transfers signed locally by the custody wallet.

use super::gas::GasEstimator;
use super::nonce::NonceManager;
use super::provider::ChainProvider;
use super::{ChainClient, ConfirmationState, Deposit, PayoutReceipt};
use crate::config::ChainConfig;
use crate::error::{SettlerError, SettlerResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::{format_units, keccak256, parse_units};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

pub struct EvmChainClient {
    provider: ChainProvider,
    wallet: LocalWallet,
    nonces: NonceManager,
    gas: GasEstimator,
    decimals: u32,
    confirmation_blocks: u64,
}

impl EvmChainClient {
    /// Connect to the chain and bind the custody wallet to it
    pub async fn connect(config: ChainConfig, wallet: LocalWallet) -> SettlerResult<Self> {
        let custody: Address = config
            .custody_address
            .parse()
            .map_err(|e| SettlerError::Config(format!("Invalid custody address: {}", e)))?;

        let wallet = wallet.with_chain_id(config.chain_id);
        if wallet.address() != custody {
            return Err(SettlerError::Config(format!(
                "Custody address {} on {} does not match the payout wallet {:?}",
                config.custody_address,
                config.name,
                wallet.address()
            )));
        }

        let provider = ChainProvider::new(config.clone()).await?;
        let nonces = NonceManager::init(&provider, wallet.address()).await?;

        info!(
            "EVM client for {} ready (payouts from {:?})",
            config.name,
            wallet.address()
        );

        Ok(Self {
            provider,
            wallet,
            nonces,
            gas: GasEstimator::new(config.max_gas_price_gwei),
            decimals: config.decimals,
            confirmation_blocks: config.confirmation_blocks,
        })
    }

    fn chain(&self) -> String {
        self.provider.name().to_string()
    }

    fn payout_error(&self, message: impl ToString) -> SettlerError {
        SettlerError::Payout {
            chain: self.chain(),
            message: message.to_string(),
        }
    }

    /// Classify a mined or unmined transaction by receipt and depth
    async fn confirmation_of(&self, tx_hash: H256) -> SettlerResult<ConfirmationState> {
        let Some(receipt) = self.provider.get_transaction_receipt(tx_hash).await? else {
            return match self.provider.get_transaction(tx_hash).await? {
                Some(_) => Ok(ConfirmationState::Pending),
                None => Ok(ConfirmationState::NotFound),
            };
        };

        if receipt.status == Some(0u64.into()) {
            return Ok(ConfirmationState::Failed("reverted".to_string()));
        }

        let Some(block) = receipt.block_number else {
            return Ok(ConfirmationState::Pending);
        };

        let confirmations = self.provider.confirmations(block.as_u64()).await?;
        if confirmations >= self.confirmation_blocks {
            Ok(ConfirmationState::Confirmed)
        } else {
            debug!(
                "Transaction {:?} has {} / {} confirmations on chain {}",
                tx_hash,
                confirmations,
                self.confirmation_blocks,
                self.provider.name()
            );
            Ok(ConfirmationState::Pending)
        }
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    async fn fetch_deposit(&self, reference: &str) -> SettlerResult<Option<Deposit>> {
        let Ok(tx_hash) = reference.parse::<H256>() else {
            debug!("Deposit reference {} is not a transaction hash", reference);
            return Ok(None);
        };

        let Some(tx) = self.provider.get_transaction(tx_hash).await? else {
            return Ok(None);
        };

        let confirmation = if tx.block_number.is_some() {
            self.confirmation_of(tx_hash).await?
        } else {
            ConfirmationState::Pending
        };

        let memo = if tx.input.is_empty() {
            String::new()
        } else {
            format!("0x{}", hex::encode(&tx.input))
        };

        Ok(Some(Deposit {
            from: format!("{:?}", tx.from),
            to: tx.to.map(|to| format!("{:?}", to)).unwrap_or_default(),
            amount: from_base_units(tx.value, self.decimals)?,
            memo,
            confirmation,
        }))
    }

    async fn fetch_balance(&self, account: &str) -> SettlerResult<f64> {
        let account: Address = account.parse().map_err(|e| SettlerError::ChainConnection {
            chain: self.chain(),
            message: format!("Invalid account {}: {}", account, e),
        })?;
        let balance = self.provider.get_balance(account).await?;
        from_base_units(balance, self.decimals)
    }

    async fn dispatch_payout(&self, to: &str, amount: f64) -> SettlerResult<PayoutReceipt> {
        let recipient: Address = to
            .parse()
            .map_err(|e| self.payout_error(format!("Invalid recipient {}: {}", to, e)))?;
        let value = to_base_units(amount, self.decimals)?;

        let gas_limit = self.gas.transfer_gas_limit();
        let gas_price = self.gas.get_gas_price(&self.provider).await?;
        let balance = self.provider.get_balance(self.wallet.address()).await?;
        let need = value + GasEstimator::calculate_cost(gas_limit, gas_price);
        if balance < need {
            return Err(SettlerError::InsufficientBalance {
                chain: self.chain(),
                have: from_base_units(balance, self.decimals)?,
                need: from_base_units(need, self.decimals)?,
            });
        }

        let nonce = self.nonces.next().await;
        let request = TransactionRequest::new()
            .from(self.wallet.address())
            .to(recipient)
            .value(value)
            .nonce(nonce)
            .gas(gas_limit)
            .gas_price(gas_price)
            .chain_id(self.provider.chain_id());
        let tx = TypedTransaction::Legacy(request);

        let signature = match self.wallet.sign_transaction(&tx).await {
            Ok(signature) => signature,
            Err(e) => {
                self.nonces.release(nonce).await;
                return Err(SettlerError::Wallet(e.to_string()));
            }
        };
        let raw = tx.rlp_signed(&signature);
        let local_hash = H256::from(keccak256(&raw));

        match timeout(SEND_TIMEOUT, self.provider.http().send_raw_transaction(raw)).await {
            Ok(Ok(pending)) => {
                let tx_hash = pending.tx_hash();
                let reference = format!("{:?}", tx_hash);
                self.nonces.mark_pending(nonce, &reference).await;
                info!(
                    "Payout sent on {}: {} to {} (nonce {})",
                    self.provider.name(),
                    reference,
                    to,
                    nonce
                );
                Ok(PayoutReceipt {
                    tx_reference: reference,
                })
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                if message.contains("nonce too low") {
                    warn!("Nonce too low on {}, syncing", self.provider.name());
                    self.nonces.sync(&self.provider).await?;
                    return Err(SettlerError::Nonce {
                        chain: self.chain(),
                        message,
                    });
                }

                self.nonces.release(nonce).await;
                if message.contains("insufficient funds") {
                    return Err(SettlerError::InsufficientBalance {
                        chain: self.chain(),
                        have: from_base_units(balance, self.decimals)?,
                        need: from_base_units(need, self.decimals)?,
                    });
                }
                Err(self.payout_error(message))
            }
            Err(_) => {
                // The node may have accepted it; track the locally computed hash
                let reference = format!("{:?}", local_hash);
                warn!(
                    "Payout send timed out on {}, tracking {} for reconciliation",
                    self.provider.name(),
                    reference
                );
                self.nonces.mark_pending(nonce, &reference).await;
                Ok(PayoutReceipt {
                    tx_reference: reference,
                })
            }
        }
    }

    async fn payout_status(&self, tx_reference: &str) -> SettlerResult<ConfirmationState> {
        let Ok(tx_hash) = tx_reference.parse::<H256>() else {
            return Ok(ConfirmationState::NotFound);
        };
        self.confirmation_of(tx_hash).await
    }

    async fn health_check(&self) -> bool {
        self.provider.health_check().await
    }
}

/// Decimal amount to base units at `decimals` precision
pub fn to_base_units(amount: f64, decimals: u32) -> SettlerResult<U256> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(SettlerError::Internal(format!(
            "Cannot convert amount {} to base units",
            amount
        )));
    }

    let text = format!("{:.*}", decimals as usize, amount);
    let parsed = parse_units(text, decimals)
        .map_err(|e| SettlerError::Internal(format!("Unit conversion failed: {}", e)))?;
    Ok(parsed.into())
}

/// Base units to a decimal amount
pub fn from_base_units(value: U256, decimals: u32) -> SettlerResult<f64> {
    let text = format_units(value, decimals)
        .map_err(|e| SettlerError::Internal(format!("Unit conversion failed: {}", e)))?;
    text.parse::<f64>()
        .map_err(|e| SettlerError::Internal(format!("Unit conversion failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_base_units() {
        let wei = to_base_units(1.5, 18).unwrap();
        assert_eq!(wei, U256::from(1_500_000_000_000_000_000u128));

        let micros = to_base_units(0.25, 6).unwrap();
        assert_eq!(micros, U256::from(250_000u64));
    }

    #[test]
    fn test_from_base_units() {
        let amount = from_base_units(U256::from(1_500_000u64), 6).unwrap();
        assert!((amount - 1.5).abs() < 1e-12);

        let amount = from_base_units(U256::exp10(18) * 3, 18).unwrap();
        assert!((amount - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_negative_amount_rejected() {
        assert!(to_base_units(-1.0, 18).is_err());
        assert!(to_base_units(f64::NAN, 18).is_err());
    }
}
