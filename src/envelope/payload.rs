//! Typed intent payload extracted from an authenticated envelope

use super::EnvelopeError;

use serde::Serialize;
use serde_json::{Map, Value};

/// Fields a deposit's intent must declare
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntentPayload {
    pub from_asset: String,
    pub to_asset: String,
    pub amount: f64,
    pub target_chain: String,
    pub destination: String,
    /// Absolute deadline, epoch millis
    pub expiry: i64,
    pub nonce: String,
    pub min_amount_out: f64,
    /// Untouched payload JSON kept for audit
    #[serde(skip)]
    pub raw: Value,
}

impl IntentPayload {
    /// Validate field presence and typing. Any defect fails the whole payload.
    pub fn from_value(value: &Value) -> Result<Self, EnvelopeError> {
        let Value::Object(map) = value else {
            return Err(EnvelopeError::InvalidField {
                field: "payload",
                reason: "expected object".to_string(),
            });
        };

        let amount = number_field(map, "amount")?;
        if !(amount.is_finite() && amount > 0.0) {
            return Err(EnvelopeError::InvalidField {
                field: "amount",
                reason: format!("must be positive, got {}", amount),
            });
        }

        let expiry = match map.get("expiry") {
            None | Some(Value::Null) => return Err(EnvelopeError::MissingField("expiry")),
            Some(Value::Number(n)) => n.as_i64().ok_or_else(|| EnvelopeError::InvalidField {
                field: "expiry",
                reason: "expected integer epoch millis".to_string(),
            })?,
            Some(other) => {
                return Err(EnvelopeError::InvalidField {
                    field: "expiry",
                    reason: format!("expected integer, got {}", other),
                })
            }
        };
        if expiry <= 0 {
            return Err(EnvelopeError::InvalidField {
                field: "expiry",
                reason: "must be positive".to_string(),
            });
        }

        let target_chain = match map.get("target_chain") {
            None | Some(Value::Null) => return Err(EnvelopeError::MissingField("target_chain")),
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(Value::Number(n)) if n.is_u64() => n.to_string(),
            Some(other) => {
                return Err(EnvelopeError::InvalidField {
                    field: "target_chain",
                    reason: format!("expected chain identifier, got {}", other),
                })
            }
        };

        let min_amount_out = match map.get("min_amount_out") {
            None | Some(Value::Null) => 0.0,
            Some(_) => {
                let min = number_field(map, "min_amount_out")?;
                if !(min.is_finite() && min >= 0.0) {
                    return Err(EnvelopeError::InvalidField {
                        field: "min_amount_out",
                        reason: format!("must be non-negative, got {}", min),
                    });
                }
                min
            }
        };

        Ok(Self {
            from_asset: string_field(map, "from_asset")?,
            to_asset: string_field(map, "to_asset")?,
            amount,
            target_chain,
            destination: string_field(map, "destination")?,
            expiry,
            nonce: string_field(map, "nonce")?,
            min_amount_out,
            raw: value.clone(),
        })
    }
}

fn string_field(map: &Map<String, Value>, field: &'static str) -> Result<String, EnvelopeError> {
    match map.get(field) {
        None | Some(Value::Null) => Err(EnvelopeError::MissingField(field)),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::String(_)) => Err(EnvelopeError::InvalidField {
            field,
            reason: "must not be empty".to_string(),
        }),
        Some(other) => Err(EnvelopeError::InvalidField {
            field,
            reason: format!("expected string, got {}", other),
        }),
    }
}

/// Numbers may arrive as JSON numbers or numeric strings
fn number_field(map: &Map<String, Value>, field: &'static str) -> Result<f64, EnvelopeError> {
    match map.get(field) {
        None | Some(Value::Null) => Err(EnvelopeError::MissingField(field)),
        Some(Value::Number(n)) => n.as_f64().ok_or_else(|| EnvelopeError::InvalidField {
            field,
            reason: "not representable as f64".to_string(),
        }),
        Some(Value::String(s)) => s.trim().parse::<f64>().map_err(|_| EnvelopeError::InvalidField {
            field,
            reason: format!("not numeric: {:?}", s),
        }),
        Some(other) => Err(EnvelopeError::InvalidField {
            field,
            reason: format!("expected number, got {}", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid() -> Value {
        json!({
            "from_asset": "AAA",
            "to_asset": "BBB",
            "amount": "100",
            "target_chain": 2,
            "destination": "0xdest",
            "expiry": 1_700_000_000_000i64,
            "nonce": "n-1"
        })
    }

    #[test]
    fn test_parses_numeric_strings_and_integer_chain() {
        let payload = IntentPayload::from_value(&valid()).unwrap();
        assert_eq!(payload.amount, 100.0);
        assert_eq!(payload.target_chain, "2");
        assert_eq!(payload.min_amount_out, 0.0);
        assert_eq!(payload.raw, valid());
    }

    #[test]
    fn test_each_required_field_is_enforced() {
        for field in [
            "from_asset",
            "to_asset",
            "amount",
            "target_chain",
            "destination",
            "expiry",
            "nonce",
        ] {
            let mut value = valid();
            value.as_object_mut().unwrap().remove(field);
            assert_eq!(
                IntentPayload::from_value(&value),
                Err(EnvelopeError::MissingField(field)),
                "field {}",
                field
            );
        }
    }

    #[test]
    fn test_rejects_bad_types() {
        let mut value = valid();
        value["amount"] = json!(-5);
        assert!(IntentPayload::from_value(&value).is_err());

        let mut value = valid();
        value["expiry"] = json!("soon");
        assert!(IntentPayload::from_value(&value).is_err());

        let mut value = valid();
        value["nonce"] = json!("   ");
        assert!(IntentPayload::from_value(&value).is_err());

        let mut value = valid();
        value["min_amount_out"] = json!("abc");
        assert!(IntentPayload::from_value(&value).is_err());
    }
}
