//! Canonical JSON and payload digests

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Recursively sort object keys so equal payloads serialize identically
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys = map.keys().cloned().collect::<Vec<_>>();
            keys.sort();
            let mut ordered = Map::new();
            for key in keys {
                if let Some(v) = map.get(&key) {
                    ordered.insert(key, canonicalize(v));
                }
            }
            Value::Object(ordered)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        _ => value.clone(),
    }
}

pub fn canonical_string(value: &Value) -> Result<String, serde_json::Error> {
    serde_json::to_string(&canonicalize(value))
}

/// Lowercase hex SHA-256 of the canonical payload
pub fn payload_digest(payload: &Value) -> Result<String, serde_json::Error> {
    let canonical = canonical_string(payload)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Compare a declared digest against a computed one, ignoring case and an
/// optional `0x` prefix
pub fn digest_matches(declared: &str, computed: &str) -> bool {
    let declared = declared
        .trim()
        .strip_prefix("0x")
        .or_else(|| declared.trim().strip_prefix("0X"))
        .unwrap_or(declared.trim());
    declared.eq_ignore_ascii_case(computed)
}
