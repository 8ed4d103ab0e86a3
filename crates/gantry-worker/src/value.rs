//! Language-level values exchanged with user functions.
//!
//! [`Value`] is the engine-side "any": every wire `TypedValue` decodes into
//! one, function inputs and outputs are expressed as them, and the mutable
//! `bindings` map on an invocation context stores them. Conversions to and
//! from `serde_json::Value` are total; byte payloads cross the JSON text
//! boundary as base64.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use indexmap::IndexMap;

/// A dynamically-typed engine value.
///
/// Unlike `serde_json::Value` this keeps raw bytes as a first-class variant
/// (wire `bytes` inputs must round-trip without a text encoding) and keeps
/// object key order (binding declarations and trigger metadata are ordered
/// on the wire).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
}

impl Value {
    /// Build an object value from key/value pairs, preserving order.
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Whether this value is one of the "explicit falsy" shapes (`0`,
    /// `false`, `""`, `0.0`) that a general truthiness check would discard.
    ///
    /// Durable activity triggers treat these as meaningful return values;
    /// see the output resolution rules in `convert`.
    pub fn is_explicit_falsy(&self) -> bool {
        match self {
            Value::Bool(false) => true,
            Value::Int(0) => true,
            Value::Double(d) => *d == 0.0,
            Value::String(s) => s.is_empty(),
            _ => false,
        }
    }

    /// JavaScript-style truthiness: null, `false`, numeric zero, and the
    /// empty string are falsy; everything else (including empty arrays and
    /// objects) is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Double(d) => *d != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Bytes(_) | Value::Array(_) | Value::Object(_) => true,
        }
    }

    /// Convert a `serde_json::Value` into an engine value. Total.
    ///
    /// JSON has no bytes variant, so nothing maps to [`Value::Bytes`] here;
    /// byte payloads enter the engine only through the wire `bytes` variants.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::Array(items.into_iter().map(Value::from_json).collect()),
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect())
            }
        }
    }

    /// Convert to a `serde_json::Value`. Total; bytes become base64 text.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Double(d) => serde_json::Number::from_f64(*d)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(bytes) => serde_json::Value::String(BASE64.encode(bytes)),
            Value::Array(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(map) => {
                serde_json::Value::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            }
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
