//! Bearer token payload decoding.
//!
//! Tokens are three dot-separated base64url segments. Only the payload
//! segment is decoded and only its `exp` claim is consumed; the signature
//! is never checked here. Every failure maps to `None`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Claims decoded from a token's payload segment.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenPayload {
    claims: Map<String, Value>,
}

impl TokenPayload {
    /// Raw `exp` claim in Unix seconds, if it is a JSON number
    pub fn exp(&self) -> Option<f64> {
        self.claims.get("exp").and_then(Value::as_f64)
    }

    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }

    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }
}

/// Decode the payload segment of `token`.
///
/// Returns `None` when the token has fewer than two segments, the payload is
/// not valid base64url, or it does not hold a JSON object.
pub fn decode_token_payload(token: &str) -> Option<TokenPayload> {
    let mut segments = token.split('.');
    let _header = segments.next()?;
    let payload = segments.next()?;

    let mut encoded: String = payload
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            c => c,
        })
        .collect();
    while encoded.len() % 4 != 0 {
        encoded.push('=');
    }

    let bytes = STANDARD.decode(encoded.as_bytes()).ok()?;
    match serde_json::from_slice(&bytes).ok()? {
        Value::Object(claims) => Some(TokenPayload { claims }),
        _ => None,
    }
}

/// Expiry of `token` in milliseconds since the Unix epoch.
///
/// `None` if the token cannot be decoded or its `exp` is missing,
/// non-numeric, non-finite, not positive, or outside the representable
/// date range.
pub fn expiry_instant(token: &str) -> Option<i64> {
    let exp = decode_token_payload(token)?.exp()?;
    if !exp.is_finite() || exp <= 0.0 {
        return None;
    }
    let millis = exp * 1000.0;
    if millis >= i64::MAX as f64 {
        return None;
    }
    let millis = millis as i64;
    DateTime::<Utc>::from_timestamp_millis(millis)?;
    Some(millis)
}
