//! Request Signing
//!
//! Signed requests carry `apiKey`, `timestamp` and `signature` next to the
//! method's own parameters. The signature is the hex HMAC-SHA256, keyed by
//! the API secret, of every other parameter rendered as URL-encoded
//! `key=value` pairs sorted by key and joined with `&`.
//!
//! Parameters are built through [`Params`], a typed builder. Zero and empty
//! values are treated as absent and never signed or sent, so optional fields
//! can be set unconditionally.

use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use sha2::Sha256;

use crate::infrastructure::config::Credentials;

type HmacSha256 = Hmac<Sha256>;

/// Parameter name of the API key.
pub const API_KEY_PARAM: &str = "apiKey";
/// Parameter name of the request timestamp.
pub const TIMESTAMP_PARAM: &str = "timestamp";
/// Parameter name of the signature. Never part of the signed payload.
pub const SIGNATURE_PARAM: &str = "signature";

/// Signing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The secret could not initialize the MAC.
    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    /// Query string encoding failed.
    #[error("failed to encode parameters: {0}")]
    Encoding(String),
}

// =============================================================================
// Typed Parameters
// =============================================================================

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// Free text (symbols, enums, client ids).
    Text(String),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer (exchange order ids).
    UInt(u64),
    /// Decimal quantity or price.
    Decimal(Decimal),
    /// Flag.
    Bool(bool),
}

impl ParamValue {
    /// Wire rendering, or `None` when the value is zero or empty.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        match self {
            Self::Text(s) if s.is_empty() => None,
            Self::Text(s) => Some(s.clone()),
            Self::Int(0) | Self::UInt(0) | Self::Bool(false) => None,
            Self::Int(n) => Some(n.to_string()),
            Self::UInt(n) => Some(n.to_string()),
            Self::Decimal(d) if d.is_zero() => None,
            Self::Decimal(d) => Some(d.normalize().to_string()),
            Self::Bool(true) => Some("true".to_string()),
        }
    }

    fn to_json(&self, rendered: String) -> Value {
        match self {
            Self::Int(n) => Value::from(*n),
            Self::UInt(n) => Value::from(*n),
            Self::Text(_) | Self::Decimal(_) | Self::Bool(_) => Value::String(rendered),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u64> for ParamValue {
    fn from(value: u64) -> Self {
        Self::UInt(value)
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        Self::UInt(u64::from(value))
    }
}

impl From<Decimal> for ParamValue {
    fn from(value: Decimal) -> Self {
        Self::Decimal(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl<T: Into<Self>> From<Option<T>> for ParamValue {
    fn from(value: Option<T>) -> Self {
        value.map_or_else(|| Self::Text(String::new()), Into::into)
    }
}

/// One flattened parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamEntry {
    /// Parameter name.
    pub key: String,
    /// Rendered value, empty when absent.
    pub value: String,
    /// Whether the value is sent and signed.
    pub present: bool,
}

/// Ordered, typed request parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    entries: Vec<(String, ParamValue)>,
}

impl Params {
    /// Create an empty parameter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Self::set`].
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.set(key, value);
        self
    }

    /// Set a parameter, replacing any previous value under the same key.
    pub fn set(&mut self, key: &str, value: impl Into<ParamValue>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    /// Value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Flatten into `(key, value, present)` entries in insertion order.
    #[must_use]
    pub fn flatten(&self) -> Vec<ParamEntry> {
        self.entries
            .iter()
            .map(|(key, value)| {
                let rendered = value.render();
                ParamEntry {
                    key: key.clone(),
                    present: rendered.is_some(),
                    value: rendered.unwrap_or_default(),
                }
            })
            .collect()
    }

    /// Present parameters other than `signature`, sorted by key.
    #[must_use]
    pub fn signable(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .flatten()
            .into_iter()
            .filter(|entry| entry.present && entry.key != SIGNATURE_PARAM)
            .map(|entry| (entry.key, entry.value))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        pairs
    }

    /// URL-encoded, sorted `key=value&...` payload that gets signed.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Encoding`] if encoding fails.
    pub fn canonical_query(&self) -> Result<String, AuthError> {
        serde_urlencoded::to_string(self.signable()).map_err(|e| AuthError::Encoding(e.to_string()))
    }

    /// Present parameters as a JSON object. Integers stay numeric.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (key, value) in &self.entries {
            if let Some(rendered) = value.render() {
                map.insert(key.clone(), value.to_json(rendered));
            }
        }
        Value::Object(map)
    }
}

// =============================================================================
// Signer
// =============================================================================

/// Signs parameter sets with the account's API secret.
#[derive(Debug, Clone)]
pub struct Signer {
    credentials: Credentials,
}

impl Signer {
    /// Create a signer.
    #[must_use]
    pub const fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    /// API key sent with every signed request.
    #[must_use]
    pub fn api_key(&self) -> &str {
        self.credentials.api_key()
    }

    /// Hex HMAC-SHA256 over [`Params::canonical_query`].
    ///
    /// # Errors
    ///
    /// Returns an error if the MAC cannot be initialized or encoding fails.
    pub fn sign(&self, params: &Params) -> Result<String, AuthError> {
        let payload = params.canonical_query()?;
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret().as_bytes())
            .map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Add `apiKey` and `timestamp`, then sign and attach `signature`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::sign`].
    pub fn sign_params(&self, mut params: Params, timestamp_ms: i64) -> Result<Params, AuthError> {
        params.set(API_KEY_PARAM, self.api_key());
        params.set(TIMESTAMP_PARAM, timestamp_ms);
        let signature = self.sign(&params)?;
        params.set(SIGNATURE_PARAM, signature);
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use test_case::test_case;

    use super::*;

    fn signer() -> Signer {
        Signer::new(Credentials::new("key123".to_string(), "secret456".to_string()))
    }

    fn order_params() -> Params {
        Params::new()
            .with("symbol", "BTCUSDT")
            .with("side", "BUY")
            .with("type", "LIMIT")
            .with("quantity", Decimal::from_str("0.010").unwrap())
            .with("price", Decimal::from_str("50000").unwrap())
            .with("timeInForce", "GTC")
    }

    #[test_case(ParamValue::Text(String::new()), None ; "empty text")]
    #[test_case(ParamValue::Int(0), None ; "zero int")]
    #[test_case(ParamValue::UInt(0), None ; "zero uint")]
    #[test_case(ParamValue::Decimal(Decimal::ZERO), None ; "zero decimal")]
    #[test_case(ParamValue::Bool(false), None ; "false flag")]
    #[test_case(ParamValue::Bool(true), Some("true") ; "true flag")]
    #[test_case(ParamValue::Int(-5), Some("-5") ; "negative int")]
    #[test_case(ParamValue::Decimal(Decimal::from_str("1.2500").unwrap()), Some("1.25") ; "trailing zeros")]
    fn render_omits_zero_values(value: ParamValue, expected: Option<&str>) {
        assert_eq!(value.render().as_deref(), expected);
    }

    #[test]
    fn canonical_query_is_sorted_and_skips_absent() {
        let params = Params::new()
            .with("symbol", "BTCUSDT")
            .with("orderId", 0_u64)
            .with("clientOrderId", "")
            .with("newClientOrderId", "abc def")
            .with("signature", "ignored");

        assert_eq!(
            params.canonical_query().unwrap(),
            "newClientOrderId=abc+def&symbol=BTCUSDT"
        );
    }

    #[test]
    fn flatten_keeps_insertion_order_and_presence() {
        let params = Params::new().with("b", 1_i64).with("a", "").with("b", 2_i64);
        let entries = params.flatten();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, "b");
        assert_eq!(entries[0].value, "2");
        assert!(entries[0].present);
        assert!(!entries[1].present);
    }

    #[test]
    fn sign_is_deterministic() {
        let a = signer().sign(&order_params()).unwrap();
        let b = signer().sign(&order_params()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn sign_is_sensitive_to_every_value() {
        let base = signer().sign(&order_params()).unwrap();
        for (key, value) in [
            ("symbol", ParamValue::from("ETHUSDT")),
            ("side", ParamValue::from("SELL")),
            ("quantity", ParamValue::from(Decimal::from_str("0.011").unwrap())),
            ("price", ParamValue::from(Decimal::from_str("50001").unwrap())),
        ] {
            let changed = order_params().with(key, value);
            assert_ne!(signer().sign(&changed).unwrap(), base, "{key}");
        }

        let other_secret = Signer::new(Credentials::new("key123".to_string(), "other".to_string()));
        assert_ne!(other_secret.sign(&order_params()).unwrap(), base);
    }

    #[test]
    fn sign_ignores_signature_and_insertion_order() {
        let base = signer().sign(&order_params()).unwrap();

        let with_signature = order_params().with("signature", "deadbeef");
        assert_eq!(signer().sign(&with_signature).unwrap(), base);

        let reordered = Params::new()
            .with("timeInForce", "GTC")
            .with("price", Decimal::from_str("50000").unwrap())
            .with("quantity", Decimal::from_str("0.010").unwrap())
            .with("type", "LIMIT")
            .with("side", "BUY")
            .with("symbol", "BTCUSDT");
        assert_eq!(signer().sign(&reordered).unwrap(), base);
    }

    #[test]
    fn known_vector() {
        // HMAC-SHA256("secret456", "apiKey=key123&symbol=BTCUSDT&timestamp=1700000000000")
        let params = Params::new()
            .with("symbol", "BTCUSDT")
            .with("apiKey", "key123")
            .with("timestamp", 1_700_000_000_000_i64);
        let mut mac = HmacSha256::new_from_slice(b"secret456").unwrap();
        mac.update(b"apiKey=key123&symbol=BTCUSDT&timestamp=1700000000000");
        let expected = hex::encode(mac.finalize().into_bytes());

        assert_eq!(signer().sign(&params).unwrap(), expected);
    }

    #[test]
    fn sign_params_attaches_auth_fields() {
        let signed = signer().sign_params(order_params(), 1_700_000_000_000).unwrap();

        let json = signed.to_json();
        assert_eq!(json["apiKey"], "key123");
        assert_eq!(json["timestamp"], 1_700_000_000_000_i64);
        assert_eq!(json["quantity"], "0.01");

        let signature = json["signature"].as_str().unwrap();
        assert_eq!(signer().sign(&signed).unwrap(), signature);
    }
}
