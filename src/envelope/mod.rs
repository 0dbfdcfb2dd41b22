//! Envelope integrity verification
//!
//! Extracts the intent embedded in a deposit memo and authenticates it
//! before any money moves:
//! 1. Detect and strip the transport encoding (hex, base64 or raw JSON)
//! 2. Recompute the canonical payload digest and compare with the declared hash
//! 3. Validate the payload fields
//!
//! Envelopes without a hash are accepted only in legacy-compatibility mode.

mod canonical;
mod codec;
mod payload;

pub use canonical::{canonical_string, payload_digest};
pub use codec::{EnvelopeParts, MemoEncoding};
pub use payload::IntentPayload;

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnvelopeError {
    #[error("memo is empty")]
    EmptyMemo,

    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("malformed JSON: {0}")]
    MalformedJson(String),

    #[error("payload hash mismatch: declared {declared}, computed {computed}")]
    HashMismatch { declared: String, computed: String },

    #[error("envelope carries no hash and legacy envelopes are disabled")]
    LegacyDisallowed,

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// How much the verifier was able to establish about a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustLevel {
    /// Declared hash matched the canonical payload digest
    Authenticated,
    /// No hash present; accepted for compatibility only
    Legacy,
}

/// Result of a successful verification
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedEnvelope {
    pub payload: IntentPayload,
    pub trust: TrustLevel,
    pub digest: String,
    pub timestamp: Option<i64>,
}

/// Authenticates intent envelopes embedded in deposit memos
#[derive(Debug, Clone)]
pub struct EnvelopeVerifier {
    allow_legacy: bool,
}

impl EnvelopeVerifier {
    pub fn new(allow_legacy: bool) -> Self {
        Self { allow_legacy }
    }

    /// Decode, authenticate and validate a memo. Fails closed: no partial
    /// payload is ever returned.
    pub fn verify(&self, memo: &str) -> Result<VerifiedEnvelope, EnvelopeError> {
        let parts = codec::normalize(memo)?;
        let computed = payload_digest(&parts.payload)
            .map_err(|e| EnvelopeError::MalformedJson(e.to_string()))?;

        let trust = match parts.declared_hash {
            Some(ref declared) => {
                if !canonical::digest_matches(declared, &computed) {
                    warn!(
                        "Envelope hash mismatch (declared {}, computed {})",
                        declared, computed
                    );
                    return Err(EnvelopeError::HashMismatch {
                        declared: declared.clone(),
                        computed,
                    });
                }
                TrustLevel::Authenticated
            }
            None if self.allow_legacy => {
                debug!("Accepting unhashed {} envelope in legacy mode", parts.encoding);
                TrustLevel::Legacy
            }
            None => return Err(EnvelopeError::LegacyDisallowed),
        };

        let payload = IntentPayload::from_value(&parts.payload)?;

        Ok(VerifiedEnvelope {
            payload,
            trust,
            digest: computed,
            timestamp: parts.timestamp,
        })
    }
}

/// Build a hashed envelope for a payload (used by clients and tests)
pub fn seal(payload: &serde_json::Value, timestamp: i64) -> Result<serde_json::Value, serde_json::Error> {
    Ok(serde_json::json!({
        "payload": payload,
        "hash": payload_digest(payload)?,
        "timestamp": timestamp,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde_json::{json, Value};

    fn payload() -> Value {
        json!({
            "from_asset": "AAA",
            "to_asset": "BBB",
            "amount": 100,
            "target_chain": "2",
            "destination": "0xdest",
            "expiry": 1_900_000_000_000i64,
            "nonce": "nonce-1",
            "min_amount_out": 0.05
        })
    }

    fn encoded_envelope() -> String {
        STANDARD.encode(seal(&payload(), 1).unwrap().to_string())
    }

    #[test]
    fn test_correct_hash_verifies() {
        let verifier = EnvelopeVerifier::new(false);
        let verified = verifier.verify(&encoded_envelope()).unwrap();
        assert_eq!(verified.trust, TrustLevel::Authenticated);
        assert_eq!(verified.payload.nonce, "nonce-1");
        assert_eq!(verified.payload.min_amount_out, 0.05);
        assert_eq!(verified.timestamp, Some(1));
    }

    #[test]
    fn test_hex_wrapped_envelope_verifies() {
        let memo = format!("0x{}", hex::encode(encoded_envelope()));
        let verified = EnvelopeVerifier::new(false).verify(&memo).unwrap();
        assert_eq!(verified.trust, TrustLevel::Authenticated);
    }

    #[test]
    fn test_any_payload_byte_change_fails() {
        let verifier = EnvelopeVerifier::new(true);
        let original = seal(&payload(), 1).unwrap();
        let hash = original["hash"].as_str().unwrap().to_string();
        let payload_text = canonical_string(&payload()).unwrap();

        let mut failures = 0;
        for idx in 0..payload_text.len() {
            let mut bytes = payload_text.clone().into_bytes();
            bytes[idx] = if bytes[idx] == b'1' { b'2' } else { b'1' };
            let Ok(mutated) = String::from_utf8(bytes) else {
                failures += 1;
                continue;
            };
            let memo = format!(
                r#"{{"payload":{},"hash":"{}","timestamp":1}}"#,
                mutated, hash
            );
            if verifier.verify(&memo).is_err() {
                failures += 1;
            }
        }
        assert_eq!(failures, payload_text.len());
    }

    /// Apply every single-byte substitution to `memo`. Each variant whose
    /// decoded payload or hash differs from the original must be refused.
    /// Returns how many such variants there were.
    fn count_refused_variants(memo: &str, substitute: impl Fn(u8) -> u8) -> usize {
        let verifier = EnvelopeVerifier::new(false);
        let original = seal(&payload(), 1).unwrap();
        let original_hash = original["hash"].as_str().unwrap();

        let mut altered = 0;
        for idx in 0..memo.len() {
            let mut bytes = memo.as_bytes().to_vec();
            bytes[idx] = substitute(bytes[idx]);
            let mutated = String::from_utf8(bytes).unwrap();

            let decoded = codec::decode_text(&mutated)
                .ok()
                .and_then(|(text, _)| serde_json::from_str::<Value>(&text).ok());
            let intact = decoded.map_or(false, |envelope| {
                envelope["payload"] == original["payload"]
                    && envelope["hash"]
                        .as_str()
                        .map_or(false, |h| canonical::digest_matches(h, original_hash))
            });
            if intact {
                // only the timestamp moved
                continue;
            }

            altered += 1;
            assert!(
                verifier.verify(&mutated).is_err(),
                "variant at byte {} verified: {}",
                idx,
                mutated
            );
        }
        altered
    }

    #[test]
    fn test_any_encoded_byte_change_fails() {
        let memo = encoded_envelope();
        let altered =
            count_refused_variants(&memo, |c| if c == b'A' { b'B' } else { b'A' });
        assert!(altered > memo.len() / 2);
    }

    #[test]
    fn test_any_hex_wrapped_byte_change_fails() {
        let memo = format!("0x{}", hex::encode(encoded_envelope()));
        let altered =
            count_refused_variants(&memo, |c| if c == b'0' { b'1' } else { b'0' });
        assert!(altered > memo.len() / 2);
    }

    #[test]
    fn test_tampered_amount_reports_mismatch() {
        let mut envelope = seal(&payload(), 1).unwrap();
        envelope["payload"]["amount"] = json!(1000);
        let err = EnvelopeVerifier::new(true)
            .verify(&envelope.to_string())
            .unwrap_err();
        assert!(matches!(err, EnvelopeError::HashMismatch { .. }));
    }

    #[test]
    fn test_unhashed_envelope_requires_legacy_mode() {
        let bare = payload().to_string();
        let wrapped = json!({ "payload": payload() }).to_string();

        for memo in [&bare, &wrapped] {
            assert_eq!(
                EnvelopeVerifier::new(false).verify(memo),
                Err(EnvelopeError::LegacyDisallowed)
            );
            let verified = EnvelopeVerifier::new(true).verify(memo).unwrap();
            assert_eq!(verified.trust, TrustLevel::Legacy);
        }
    }

    #[test]
    fn test_authentic_but_incomplete_payload_fails_closed() {
        let mut incomplete = payload();
        incomplete.as_object_mut().unwrap().remove("destination");
        let memo = seal(&incomplete, 1).unwrap().to_string();
        assert_eq!(
            EnvelopeVerifier::new(true).verify(&memo),
            Err(EnvelopeError::MissingField("destination"))
        );
    }
}
