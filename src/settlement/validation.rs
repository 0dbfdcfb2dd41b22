//! Deposit and intent coherence checks
//!
//! Each check turns one failed condition into a typed rejection carrying
//! the expected and observed values.

use crate::chain::{ChainEndpoint, ConfirmationState, Deposit};
use crate::envelope::IntentPayload;
use crate::error::Rejection;

/// The deposit exists, is confirmed, paid the custody account and moved a
/// positive amount
pub fn check_deposit(
    deposit: Option<Deposit>,
    reference: &str,
    source: &ChainEndpoint,
) -> Result<Deposit, Rejection> {
    let deposit = deposit.ok_or_else(|| Rejection::DepositNotFound {
        chain: source.name.clone(),
        reference: reference.to_string(),
    })?;

    if deposit.confirmation != ConfirmationState::Confirmed {
        return Err(Rejection::DepositUnconfirmed {
            reference: reference.to_string(),
            state: deposit.confirmation.to_string(),
        });
    }

    if !same_account(&deposit.to, &source.custody_address) {
        return Err(Rejection::WrongRecipient {
            expected: source.custody_address.clone(),
            actual: deposit.to.clone(),
        });
    }

    if !(deposit.amount.is_finite() && deposit.amount > 0.0) {
        return Err(Rejection::InvalidDepositAmount {
            actual: deposit.amount,
        });
    }

    Ok(deposit)
}

/// Assets and target chain agree with the requested direction
pub fn check_route(
    payload: &IntentPayload,
    source: &ChainEndpoint,
    target: &ChainEndpoint,
) -> Result<(), Rejection> {
    if !payload.from_asset.eq_ignore_ascii_case(&source.asset) {
        return Err(Rejection::RouteMismatch {
            field: "from_asset",
            expected: source.asset.clone(),
            actual: payload.from_asset.clone(),
        });
    }

    if !payload.to_asset.eq_ignore_ascii_case(&target.asset) {
        return Err(Rejection::RouteMismatch {
            field: "to_asset",
            expected: target.asset.clone(),
            actual: payload.to_asset.clone(),
        });
    }

    // Either the numeric chain id or the configured chain name
    let chain = &payload.target_chain;
    if chain != &target.chain_id.to_string() && !chain.eq_ignore_ascii_case(&target.name) {
        return Err(Rejection::RouteMismatch {
            field: "target_chain",
            expected: format!("{} ({})", target.chain_id, target.name),
            actual: chain.clone(),
        });
    }

    Ok(())
}

/// Declared intent amount equals the deposited amount within a relative
/// tolerance
pub fn check_amount(declared: f64, deposited: f64, tolerance: f64) -> Result<(), Rejection> {
    let allowed = tolerance * deposited.abs().max(1.0);
    if (declared - deposited).abs() > allowed {
        return Err(Rejection::AmountMismatch {
            declared,
            deposited,
        });
    }
    Ok(())
}

pub fn check_expiry(expiry: i64, now: i64) -> Result<(), Rejection> {
    if now > expiry {
        return Err(Rejection::Expired { expiry, now });
    }
    Ok(())
}

pub fn check_min_output(quoted: f64, minimum: f64) -> Result<(), Rejection> {
    if quoted <= 0.0 || quoted < minimum {
        return Err(Rejection::InsufficientOutput { minimum, quoted });
    }
    Ok(())
}

fn same_account(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::fake::FakeChain;
    use crate::intent::ChainSide;
    use serde_json::json;
    use std::sync::Arc;

    fn endpoint(side: ChainSide, name: &str, chain_id: u64, asset: &str) -> ChainEndpoint {
        ChainEndpoint {
            side,
            name: name.to_string(),
            chain_id,
            asset: asset.to_string(),
            custody_address: "0xCustody".to_string(),
            client: Arc::new(FakeChain::new(name, 0.0)),
        }
    }

    fn deposit(to: &str, amount: f64, confirmation: ConfirmationState) -> Deposit {
        Deposit {
            from: "0xuser".to_string(),
            to: to.to_string(),
            amount,
            memo: String::new(),
            confirmation,
        }
    }

    fn payload(from: &str, to: &str, chain: serde_json::Value) -> IntentPayload {
        IntentPayload::from_value(&json!({
            "from_asset": from,
            "to_asset": to,
            "amount": 100,
            "target_chain": chain,
            "destination": "0xdest",
            "expiry": 10_000,
            "nonce": "n-1",
        }))
        .unwrap()
    }

    #[test]
    fn test_missing_deposit() {
        let source = endpoint(ChainSide::A, "alpha", 1, "AAA");
        let err = check_deposit(None, "0xabc", &source).unwrap_err();
        assert_eq!(
            err,
            Rejection::DepositNotFound {
                chain: "alpha".to_string(),
                reference: "0xabc".to_string()
            }
        );
    }

    #[test]
    fn test_unconfirmed_deposit() {
        let source = endpoint(ChainSide::A, "alpha", 1, "AAA");
        let found = deposit("0xcustody", 1.0, ConfirmationState::Pending);
        let err = check_deposit(Some(found), "0xabc", &source).unwrap_err();
        assert!(matches!(err, Rejection::DepositUnconfirmed { .. }));
    }

    #[test]
    fn test_recipient_compared_case_insensitively() {
        let source = endpoint(ChainSide::A, "alpha", 1, "AAA");
        let found = deposit("0xcustody", 1.0, ConfirmationState::Confirmed);
        assert!(check_deposit(Some(found), "0xabc", &source).is_ok());

        let elsewhere = deposit("0xsomeoneelse", 1.0, ConfirmationState::Confirmed);
        let err = check_deposit(Some(elsewhere), "0xabc", &source).unwrap_err();
        assert_eq!(
            err,
            Rejection::WrongRecipient {
                expected: "0xCustody".to_string(),
                actual: "0xsomeoneelse".to_string()
            }
        );
    }

    #[test]
    fn test_zero_amount_deposit() {
        let source = endpoint(ChainSide::A, "alpha", 1, "AAA");
        let found = deposit("0xcustody", 0.0, ConfirmationState::Confirmed);
        let err = check_deposit(Some(found), "0xabc", &source).unwrap_err();
        assert_eq!(err, Rejection::InvalidDepositAmount { actual: 0.0 });
    }

    #[test]
    fn test_route_accepts_chain_id_or_name() {
        let source = endpoint(ChainSide::A, "alpha", 1, "AAA");
        let target = endpoint(ChainSide::B, "beta", 2, "BBB");
        assert!(check_route(&payload("AAA", "BBB", json!(2)), &source, &target).is_ok());
        assert!(check_route(&payload("aaa", "bbb", json!("Beta")), &source, &target).is_ok());
    }

    #[test]
    fn test_route_mismatches_name_the_field() {
        let source = endpoint(ChainSide::A, "alpha", 1, "AAA");
        let target = endpoint(ChainSide::B, "beta", 2, "BBB");

        let err = check_route(&payload("BBB", "AAA", json!(2)), &source, &target).unwrap_err();
        assert!(matches!(
            err,
            Rejection::RouteMismatch {
                field: "from_asset",
                ..
            }
        ));

        let err = check_route(&payload("AAA", "BBB", json!(1)), &source, &target).unwrap_err();
        assert!(matches!(
            err,
            Rejection::RouteMismatch {
                field: "target_chain",
                ..
            }
        ));
    }

    #[test]
    fn test_amount_tolerance() {
        assert!(check_amount(100.0, 100.0, 1e-9).is_ok());
        assert!(check_amount(100.0 + 1e-10, 100.0, 1e-9).is_ok());
        assert!(check_amount(101.0, 100.0, 1e-9).is_err());
    }

    #[test]
    fn test_expiry_boundary() {
        assert!(check_expiry(1_000, 1_000).is_ok());
        assert_eq!(
            check_expiry(1_000, 1_001),
            Err(Rejection::Expired {
                expiry: 1_000,
                now: 1_001
            })
        );
    }

    #[test]
    fn test_min_output() {
        assert!(check_min_output(0.099, 0.09).is_ok());
        assert!(check_min_output(0.099, 0.1).is_err());
        // a zero quote is never acceptable
        assert!(check_min_output(0.0, 0.0).is_err());
    }
}
