//! Error types for the intent settler

use crate::envelope::EnvelopeError;
use serde::Serialize;
use thiserror::Error;

/// Infrastructure-level errors. These never describe a bad deposit; they
/// mean the current operation could not complete and should be retried.
#[derive(Error, Debug)]
pub enum SettlerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Chain connection error for chain {chain}: {message}")]
    ChainConnection { chain: String, message: String },

    #[error("Payout error on chain {chain}: {message}")]
    Payout { chain: String, message: String },

    #[error("Nonce error for chain {chain}: {message}")]
    Nonce { chain: String, message: String },

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Intent {id} not found")]
    IntentNotFound { id: String },

    #[error("Deposit {source_tx_hash} already has an intent")]
    DuplicateDeposit { source_tx_hash: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Insufficient balance on chain {chain}: have {have}, need {need}")]
    InsufficientBalance { chain: String, have: f64, need: f64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SettlerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SettlerError::ChainConnection { .. }
                | SettlerError::Timeout { .. }
                | SettlerError::Payout { .. }
                | SettlerError::Nonce { .. }
                | SettlerError::Database(_)
                | SettlerError::Storage(_)
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            SettlerError::InsufficientBalance { .. }
                | SettlerError::Wallet(_)
                | SettlerError::InvalidStateTransition { .. }
        )
    }
}

/// Result type for settler operations
pub type SettlerResult<T> = Result<T, SettlerError>;

/// Why a deposit was turned away before any intent row was created.
///
/// Every variant carries the expected and observed values so a caller can
/// tell exactly which check failed.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    #[error("Deposit {reference} not found on chain {chain}")]
    DepositNotFound { chain: String, reference: String },

    #[error("Deposit {reference} is not confirmed (state: {state})")]
    DepositUnconfirmed { reference: String, state: String },

    #[error("Deposit sent to {actual}, expected custody account {expected}")]
    WrongRecipient { expected: String, actual: String },

    #[error("Deposit amount must be positive, got {actual}")]
    InvalidDepositAmount { actual: f64 },

    #[error("Envelope rejected: {detail}")]
    Envelope {
        #[from]
        #[serde(serialize_with = "serialize_display")]
        detail: EnvelopeError,
    },

    #[error("Intent {field} mismatch: expected {expected}, got {actual}")]
    RouteMismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },

    #[error("Intent amount {declared} does not match deposited amount {deposited}")]
    AmountMismatch { declared: f64, deposited: f64 },

    #[error("Intent expired at {expiry}, now {now}")]
    Expired { expiry: i64, now: i64 },

    #[error("Quoted output {quoted} below minimum {minimum}")]
    InsufficientOutput { minimum: f64, quoted: f64 },

    #[error("Nonce {nonce} already used")]
    NonceReplay { nonce: String },
}

impl Rejection {
    /// Short machine label used for metrics
    pub fn label(&self) -> &'static str {
        match self {
            Rejection::DepositNotFound { .. } => "deposit_not_found",
            Rejection::DepositUnconfirmed { .. } => "deposit_unconfirmed",
            Rejection::WrongRecipient { .. } => "wrong_recipient",
            Rejection::InvalidDepositAmount { .. } => "invalid_deposit_amount",
            Rejection::Envelope { .. } => "envelope",
            Rejection::RouteMismatch { .. } => "route_mismatch",
            Rejection::AmountMismatch { .. } => "amount_mismatch",
            Rejection::Expired { .. } => "expired",
            Rejection::InsufficientOutput { .. } => "insufficient_output",
            Rejection::NonceReplay { .. } => "nonce_replay",
        }
    }
}

fn serialize_display<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
    T: std::fmt::Display,
{
    serializer.serialize_str(&value.to_string())
}

/// Outcome of a settlement submission that did not produce an intent.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error(transparent)]
    Infrastructure(#[from] SettlerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let err = SettlerError::ChainConnection {
            chain: "a".to_string(),
            message: "connection reset".to_string(),
        };
        assert!(err.is_retryable());
        assert!(!SettlerError::Wallet("no key".to_string()).is_retryable());
        assert!(SettlerError::Wallet("no key".to_string()).should_alert());
    }

    #[test]
    fn test_rejection_serializes_with_reason_tag() {
        let rejection = Rejection::WrongRecipient {
            expected: "0xcustody".to_string(),
            actual: "0xother".to_string(),
        };
        let json = serde_json::to_value(&rejection).unwrap();
        assert_eq!(json["reason"], "wrong_recipient");
        assert_eq!(json["expected"], "0xcustody");
        assert_eq!(json["actual"], "0xother");
    }

    #[test]
    fn test_envelope_rejection_serializes_message() {
        let rejection = Rejection::from(EnvelopeError::MissingField("nonce"));
        let json = serde_json::to_value(&rejection).unwrap();
        assert_eq!(json["reason"], "envelope");
        assert_eq!(rejection.label(), "envelope");
    }
}
