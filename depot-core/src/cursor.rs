//! Opaque resume-position cursors for paginated iteration.
//!
//! A cursor is an order-independent map of named keys to JSON scalars,
//! reversibly encoded as url-safe base64 over canonical JSON. Equal maps
//! produce equal tokens regardless of insertion order.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::InvalidCursorError;

/// Opaque, serializable resume-position marker.
///
/// Supported value types are string, number, bool and null; encode→decode
/// is lossless for all of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(BTreeMap<String, Value>);

impl Cursor {
    /// Create an empty cursor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key, builder style.
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    /// Insert a key.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Look up a key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the cursor carries no keys.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encode into an opaque token.
    ///
    /// The payload is canonical JSON (keys sorted by the underlying
    /// `BTreeMap`), so equal cursors always produce identical tokens.
    pub fn encode(&self) -> String {
        let map: serde_json::Map<String, Value> =
            self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        URL_SAFE_NO_PAD.encode(Value::Object(map).to_string())
    }

    /// Decode a token produced by [`Cursor::encode`].
    pub fn decode(token: &str) -> Result<Self, InvalidCursorError> {
        if token.is_empty() {
            return Err(InvalidCursorError::EmptyInput);
        }

        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| InvalidCursorError::BadEncoding {
                reason: e.to_string(),
            })?;

        let text = String::from_utf8(bytes).map_err(|e| InvalidCursorError::MalformedPayload {
            reason: e.to_string(),
        })?;

        let value: Value =
            serde_json::from_str(&text).map_err(|e| InvalidCursorError::MalformedPayload {
                reason: e.to_string(),
            })?;

        match value {
            Value::Object(map) => Ok(Self(map.into_iter().collect())),
            _ => Err(InvalidCursorError::NotAnObject),
        }
    }
}

impl FromIterator<(String, Value)> for Cursor {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// =============================================================================
// TESTS
// =============================================================================
