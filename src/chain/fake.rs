//! Scriptable in-memory ledger for engine tests

use super::{ChainClient, ConfirmationState, Deposit, PayoutReceipt};
use crate::error::{SettlerError, SettlerResult};

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

pub(crate) struct FakeChain {
    name: String,
    deposits: DashMap<String, Deposit>,
    balance: Mutex<f64>,
    payouts: Mutex<Vec<(String, f64)>>,
    statuses: DashMap<String, ConfirmationState>,
    /// State new payouts report from `payout_status`
    payout_state: Mutex<ConfirmationState>,
    fail_dispatch: AtomicBool,
    fail_balance: AtomicBool,
    counter: AtomicU64,
}

impl FakeChain {
    pub(crate) fn new(name: &str, balance: f64) -> Self {
        Self {
            name: name.to_string(),
            deposits: DashMap::new(),
            balance: Mutex::new(balance),
            payouts: Mutex::new(Vec::new()),
            statuses: DashMap::new(),
            payout_state: Mutex::new(ConfirmationState::Confirmed),
            fail_dispatch: AtomicBool::new(false),
            fail_balance: AtomicBool::new(false),
            counter: AtomicU64::new(0),
        }
    }

    pub(crate) fn add_deposit(&self, reference: &str, deposit: Deposit) {
        self.deposits.insert(reference.to_string(), deposit);
    }

    pub(crate) fn set_balance(&self, amount: f64) {
        *self.balance.lock().unwrap() = amount;
    }

    pub(crate) fn balance(&self) -> f64 {
        *self.balance.lock().unwrap()
    }

    pub(crate) fn payouts(&self) -> Vec<(String, f64)> {
        self.payouts.lock().unwrap().clone()
    }

    pub(crate) fn set_payout_state(&self, state: ConfirmationState) {
        *self.payout_state.lock().unwrap() = state;
    }

    pub(crate) fn set_status(&self, reference: &str, state: ConfirmationState) {
        self.statuses.insert(reference.to_string(), state);
    }

    pub(crate) fn fail_dispatch(&self, fail: bool) {
        self.fail_dispatch.store(fail, Ordering::SeqCst);
    }

    /// Balance reads fail as if the RPC endpoint were down
    pub(crate) fn fail_balance(&self, fail: bool) {
        self.fail_balance.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn fetch_deposit(&self, reference: &str) -> SettlerResult<Option<Deposit>> {
        Ok(self.deposits.get(reference).map(|d| d.value().clone()))
    }

    async fn fetch_balance(&self, _account: &str) -> SettlerResult<f64> {
        if self.fail_balance.load(Ordering::SeqCst) {
            return Err(SettlerError::ChainConnection {
                chain: self.name.clone(),
                message: "rpc down".to_string(),
            });
        }
        Ok(self.balance())
    }

    async fn dispatch_payout(&self, to: &str, amount: f64) -> SettlerResult<PayoutReceipt> {
        if self.fail_dispatch.load(Ordering::SeqCst) {
            return Err(SettlerError::Payout {
                chain: self.name.clone(),
                message: "node rejected transaction".to_string(),
            });
        }

        {
            let mut balance = self.balance.lock().unwrap();
            if *balance < amount {
                return Err(SettlerError::InsufficientBalance {
                    chain: self.name.clone(),
                    have: *balance,
                    need: amount,
                });
            }
            *balance -= amount;
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let reference = format!("0x{}payout{}", self.name, n);
        self.payouts.lock().unwrap().push((to.to_string(), amount));
        let state = self.payout_state.lock().unwrap().clone();
        self.statuses.insert(reference.clone(), state);

        Ok(PayoutReceipt {
            tx_reference: reference,
        })
    }

    async fn payout_status(&self, tx_reference: &str) -> SettlerResult<ConfirmationState> {
        Ok(self
            .statuses
            .get(tx_reference)
            .map(|s| s.value().clone())
            .unwrap_or(ConfirmationState::NotFound))
    }

    async fn health_check(&self) -> bool {
        true
    }
}
