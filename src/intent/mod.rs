//! Intent domain model
//!
//! An intent is created once a deposit has been fully validated and is then
//! driven through its lifecycle by the settlement engine. Terminal states
//! never transition again.

mod store;

pub use store::IntentStore;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the two ledgers the settler bridges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainSide {
    A,
    B,
}

impl ChainSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainSide::A => "a",
            ChainSide::B => "b",
        }
    }
}

impl fmt::Display for ChainSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Swap direction, fixed at intent creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    AToB,
    BToA,
}

impl Direction {
    /// Chain the deposit arrives on
    pub fn source(&self) -> ChainSide {
        match self {
            Direction::AToB => ChainSide::A,
            Direction::BToA => ChainSide::B,
        }
    }

    /// Chain the payout leaves from
    pub fn target(&self) -> ChainSide {
        match self {
            Direction::AToB => ChainSide::B,
            Direction::BToA => ChainSide::A,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::AToB => "a_to_b",
            Direction::BToA => "b_to_a",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "a_to_b" => Ok(Direction::AToB),
            "b_to_a" => Ok(Direction::BToA),
            other => Err(format!("unknown direction: {}", other)),
        }
    }
}

/// Lifecycle state of a stored intent.
///
/// Rejected deposits never reach the store, so there is no rejected state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    /// Liquidity confirmed, dispatch in flight or being retried
    Open,
    /// Waiting for counter-liquidity
    Pending,
    Fulfilled,
    Expired,
    /// Dispatch gave up after the configured number of attempts
    Failed,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Open => "open",
            IntentStatus::Pending => "pending",
            IntentStatus::Fulfilled => "fulfilled",
            IntentStatus::Expired => "expired",
            IntentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentStatus::Fulfilled | IntentStatus::Expired | IntentStatus::Failed
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: IntentStatus) -> bool {
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (IntentStatus::Open, IntentStatus::Open) => true,
            (IntentStatus::Pending, IntentStatus::Pending) => true,
            (IntentStatus::Open, IntentStatus::Pending) => true,
            (IntentStatus::Pending, IntentStatus::Open) => true,
            (_, next) => next.is_terminal(),
        }
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(IntentStatus::Open),
            "pending" => Ok(IntentStatus::Pending),
            "fulfilled" => Ok(IntentStatus::Fulfilled),
            "expired" => Ok(IntentStatus::Expired),
            "failed" => Ok(IntentStatus::Failed),
            other => Err(format!("unknown intent status: {}", other)),
        }
    }
}

/// A swap intent accepted for settlement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub id: String,
    pub direction: Direction,
    pub source_address: String,
    pub source_tx_hash: String,
    pub amount_in: f64,
    pub target_address: String,
    pub target_tx_hash: Option<String>,
    pub amount_out: Option<f64>,
    /// Output locked in at acceptance; every dispatch pays this amount
    pub quoted_amount_out: f64,
    pub min_amount_out: f64,
    pub status: IntentStatus,
    pub expiry: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub fulfilled_at: Option<i64>,
    pub error: Option<String>,
    /// Payout broadcast whose confirmation has not been observed yet
    pub payout_reference: Option<String>,
    pub dispatch_attempts: u32,
    pub payload: serde_json::Value,
}

impl Intent {
    pub fn is_expired_at(&self, now: i64) -> bool {
        now > self.expiry
    }

    /// An unconfirmed payout is on the wire; the intent must not be expired
    /// or re-dispatched until it is reconciled.
    pub fn awaiting_reconciliation(&self) -> bool {
        self.payout_reference.is_some()
    }
}

/// Partial update applied atomically by the store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntentUpdate {
    pub status: Option<IntentStatus>,
    pub target_tx_hash: Option<String>,
    pub amount_out: Option<f64>,
    pub fulfilled_at: Option<i64>,
    pub error: Option<String>,
    /// `Some(None)` clears the reference
    pub payout_reference: Option<Option<String>>,
    pub dispatch_attempts: Option<u32>,
    pub updated_at: i64,
}

impl IntentUpdate {
    pub fn status(status: IntentStatus, now: i64) -> Self {
        Self {
            status: Some(status),
            updated_at: now,
            ..Default::default()
        }
    }

    /// The single write that moves an intent into `Fulfilled`
    pub fn fulfilled(target_tx_hash: String, amount_out: f64, now: i64) -> Self {
        Self {
            status: Some(IntentStatus::Fulfilled),
            target_tx_hash: Some(target_tx_hash),
            amount_out: Some(amount_out),
            fulfilled_at: Some(now),
            payout_reference: Some(None),
            updated_at: now,
            ..Default::default()
        }
    }

    /// Apply to an in-memory copy. Used by stores without native partial
    /// updates.
    pub fn apply_to(&self, intent: &mut Intent) {
        if let Some(status) = self.status {
            intent.status = status;
        }
        if let Some(ref hash) = self.target_tx_hash {
            intent.target_tx_hash = Some(hash.clone());
        }
        if let Some(amount) = self.amount_out {
            intent.amount_out = Some(amount);
        }
        if let Some(at) = self.fulfilled_at {
            intent.fulfilled_at = Some(at);
        }
        if let Some(ref error) = self.error {
            intent.error = Some(error.clone());
        }
        if let Some(ref reference) = self.payout_reference {
            intent.payout_reference = reference.clone();
        }
        if let Some(attempts) = self.dispatch_attempts {
            intent.dispatch_attempts = attempts;
        }
        intent.updated_at = self.updated_at;
    }
}

/// Single-use token consumed by an accepted envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonceRecord {
    pub nonce: String,
    pub source_tx_hash: String,
    pub consumed_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_sides() {
        assert_eq!(Direction::AToB.source(), ChainSide::A);
        assert_eq!(Direction::AToB.target(), ChainSide::B);
        assert_eq!(Direction::BToA.source(), ChainSide::B);
        assert_eq!(Direction::BToA.target(), ChainSide::A);
        assert_eq!("b_to_a".parse::<Direction>().unwrap(), Direction::BToA);
    }

    #[test]
    fn test_terminal_states_never_transition() {
        for terminal in [
            IntentStatus::Fulfilled,
            IntentStatus::Expired,
            IntentStatus::Failed,
        ] {
            for next in [
                IntentStatus::Open,
                IntentStatus::Pending,
                IntentStatus::Fulfilled,
                IntentStatus::Expired,
                IntentStatus::Failed,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_live_state_transitions() {
        assert!(IntentStatus::Pending.can_transition_to(IntentStatus::Open));
        assert!(IntentStatus::Open.can_transition_to(IntentStatus::Pending));
        assert!(IntentStatus::Open.can_transition_to(IntentStatus::Fulfilled));
        assert!(IntentStatus::Pending.can_transition_to(IntentStatus::Expired));
        assert!(IntentStatus::Open.can_transition_to(IntentStatus::Failed));
    }

    #[test]
    fn test_fulfilled_update_sets_fields_together() {
        let update = IntentUpdate::fulfilled("0xpayout".to_string(), 0.5, 42);
        assert_eq!(update.status, Some(IntentStatus::Fulfilled));
        assert_eq!(update.target_tx_hash.as_deref(), Some("0xpayout"));
        assert_eq!(update.amount_out, Some(0.5));
        assert_eq!(update.fulfilled_at, Some(42));
        assert_eq!(update.payout_reference, Some(None));
    }
}
