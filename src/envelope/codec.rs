//! Memo encoding detection and decoding
//!
//! Deposits carry the intent in a free-form memo or call-data field. Three
//! shapes are accepted and all of them normalize to the same
//! [`EnvelopeParts`]:
//! - `0x`-prefixed hex, wrapping either of the other two
//! - base64 of the envelope JSON
//! - plain JSON

use super::EnvelopeError;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

lazy_static! {
    static ref BASE64_RE: Regex = Regex::new(r"^[A-Za-z0-9+/]+={0,2}$").unwrap();
    static ref HEX_RE: Regex = Regex::new(r"^0[xX]([0-9a-fA-F]{2})+$").unwrap();
}

/// Hex wrapping may nest at most this deep before the memo is refused
const MAX_HEX_DEPTH: usize = 2;

/// Detected memo encoding
#[derive(Debug, Clone, PartialEq)]
pub enum MemoEncoding<'a> {
    Hex(&'a str),
    Base64(&'a str),
    Json(&'a str),
}

impl<'a> MemoEncoding<'a> {
    /// Classify raw memo content
    pub fn detect(memo: &'a str) -> Self {
        let trimmed = memo.trim();
        if HEX_RE.is_match(trimmed) {
            MemoEncoding::Hex(trimmed)
        } else if !trimmed.starts_with('{') && BASE64_RE.is_match(trimmed) {
            MemoEncoding::Base64(trimmed)
        } else {
            MemoEncoding::Json(trimmed)
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MemoEncoding::Hex(_) => "hex",
            MemoEncoding::Base64(_) => "base64",
            MemoEncoding::Json(_) => "json",
        }
    }
}

/// Envelope contents once the transport encoding is stripped
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeParts {
    pub payload: Value,
    pub declared_hash: Option<String>,
    pub timestamp: Option<i64>,
    /// Outermost encoding the memo arrived in
    pub encoding: &'static str,
}

/// Strip transport encodings and return the envelope JSON text
pub fn decode_text(memo: &str) -> Result<(String, &'static str), EnvelopeError> {
    let outer = MemoEncoding::detect(memo).name();
    let mut current = memo.trim().to_string();

    for _ in 0..=MAX_HEX_DEPTH {
        match MemoEncoding::detect(&current) {
            MemoEncoding::Hex(hex_str) => {
                let bytes = hex::decode(&hex_str[2..])
                    .map_err(|e| EnvelopeError::InvalidEncoding(format!("hex: {}", e)))?;
                current = String::from_utf8(bytes)
                    .map_err(|e| EnvelopeError::InvalidEncoding(format!("hex utf-8: {}", e)))?
                    .trim()
                    .trim_end_matches('\0')
                    .to_string();
            }
            MemoEncoding::Base64(b64) => {
                let bytes = STANDARD
                    .decode(b64)
                    .map_err(|e| EnvelopeError::InvalidEncoding(format!("base64: {}", e)))?;
                let text = String::from_utf8(bytes).map_err(|e| {
                    EnvelopeError::InvalidEncoding(format!("base64 utf-8: {}", e))
                })?;
                return Ok((text, outer));
            }
            MemoEncoding::Json(json) => return Ok((json.to_string(), outer)),
        }
    }

    Err(EnvelopeError::InvalidEncoding(
        "hex wrapping nested too deep".to_string(),
    ))
}

/// Decode a memo into envelope parts
pub fn normalize(memo: &str) -> Result<EnvelopeParts, EnvelopeError> {
    if memo.trim().is_empty() {
        return Err(EnvelopeError::EmptyMemo);
    }

    let (text, encoding) = decode_text(memo)?;
    let value: Value =
        serde_json::from_str(&text).map_err(|e| EnvelopeError::MalformedJson(e.to_string()))?;

    let Value::Object(mut outer) = value else {
        return Err(EnvelopeError::MalformedJson(
            "envelope must be a JSON object".to_string(),
        ));
    };

    // Bare payloads (no wrapper) are the legacy shape
    if !outer.contains_key("payload") {
        return Ok(EnvelopeParts {
            payload: Value::Object(outer),
            declared_hash: None,
            timestamp: None,
            encoding,
        });
    }

    let payload = outer.remove("payload").unwrap_or(Value::Null);
    let declared_hash = match outer.remove("hash") {
        None | Some(Value::Null) => None,
        Some(Value::String(h)) => Some(h),
        Some(other) => {
            return Err(EnvelopeError::InvalidField {
                field: "hash",
                reason: format!("expected string, got {}", other),
            })
        }
    };
    let timestamp = match outer.remove("timestamp") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => n.as_i64(),
        Some(other) => {
            return Err(EnvelopeError::InvalidField {
                field: "timestamp",
                reason: format!("expected integer, got {}", other),
            })
        }
    };

    if !payload.is_object() {
        return Err(EnvelopeError::InvalidField {
            field: "payload",
            reason: "expected object".to_string(),
        });
    }

    Ok(EnvelopeParts {
        payload,
        declared_hash,
        timestamp,
        encoding,
    })
}
