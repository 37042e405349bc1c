use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A self-describing value carried over the wire.
///
/// `serde_json::Value` cannot distinguish a byte string from a UTF-8 string
/// once both round-trip through JSON, so action payloads use this type
/// instead and encode it with MessagePack, which preserves the distinction
/// natively.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    Array(Vec<WireValue>),
    Map(Vec<(String, WireValue)>),
}

impl WireValue {
    pub fn as_map(&self) -> Option<&[(String, WireValue)]> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&WireValue> {
        self.as_map()?.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    pub fn map_from(entries: impl IntoIterator<Item = (impl Into<String>, WireValue)>) -> Self {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Encodes a value as MessagePack bytes for the `application/vnd.msgpack`
/// request/response bodies.
pub fn encode(value: &WireValue) -> Result<Vec<u8>, EnvelopeError> {
    rmp_serde::to_vec_named(value).map_err(|e| EnvelopeError::Encode(e.to_string()))
}

pub fn decode(bytes: &[u8]) -> Result<WireValue, EnvelopeError> {
    rmp_serde::from_slice(bytes).map_err(|e| EnvelopeError::Decode(e.to_string()))
}

pub const CONTENT_TYPE: &str = "application/vnd.msgpack";

#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum EnvelopeError {
    #[error("failed to encode wire value: {0}")]
    Encode(String),
    #[error("failed to decode wire value: {0}")]
    Decode(String),
}

/// Ordered-key rendering used when a `WireValue::Map` needs deterministic
/// iteration (e.g. for logging or test fixtures) without pulling `serde_json`
/// in as a second value type.
pub fn to_sorted_btree(value: &WireValue) -> Option<BTreeMap<String, WireValue>> {
    value
        .as_map()
        .map(|entries| entries.iter().cloned().collect())
}

/// Converts to [`serde_json::Value`] for schema validation and typed
/// deserialization. `Bytes` has no JSON representation, so it round-trips as
/// a hex string; callers that need raw bytes back out should work with
/// `WireValue` directly instead of going through JSON.
pub fn to_json(value: &WireValue) -> serde_json::Value {
    use serde_json::Value;
    match value {
        WireValue::Null => Value::Null,
        WireValue::Bool(b) => Value::Bool(*b),
        WireValue::Int(i) => Value::Number((*i).into()),
        WireValue::Float(f) => {
            serde_json::Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null)
        }
        WireValue::Str(s) => Value::String(s.clone()),
        WireValue::Bytes(b) => Value::String(hex::encode(b)),
        WireValue::Array(items) => Value::Array(items.iter().map(to_json).collect()),
        WireValue::Map(entries) => {
            Value::Object(entries.iter().map(|(k, v)| (k.clone(), to_json(v))).collect())
        }
    }
}

/// Converts a [`serde_json::Value`] into a [`WireValue`], used when a caller
/// only has JSON-shaped input (e.g. a typed request struct serialized via
/// `serde_json`) and needs to hand it to [`encode`].
pub fn from_json(value: serde_json::Value) -> WireValue {
    use serde_json::Value;
    match value {
        Value::Null => WireValue::Null,
        Value::Bool(b) => WireValue::Bool(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                WireValue::Int(i)
            } else {
                WireValue::Float(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => WireValue::Str(s),
        Value::Array(items) => WireValue::Array(items.into_iter().map(from_json).collect()),
        Value::Object(map) => {
            WireValue::Map(map.into_iter().map(|(k, v)| (k, from_json(v))).collect())
        }
    }
}
