//! Canonical record serialization for checksum and shape comparison.
//!
//! Source and target stores round-trip values differently: the legacy store
//! writes `2.0` where the relational backend reads back `2`, editors on
//! Windows leave CRLF line endings, and absent optional fields come back as
//! explicit nulls. Normalization rules:
//! - Object keys: sorted (serde_json's default map is ordered)
//! - Numbers: floats with no fractional part collapse to integers
//! - Strings: CRLF becomes LF
//! - Nulls: null-valued object fields are dropped
//! - Volatile fields (`ingested_at`, `checksum`, plus configured ones) are removed

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::core::Record;

/// Fields that never take part in content comparison.
pub const ALWAYS_VOLATILE: [&str; 2] = ["ingested_at", "checksum"];

/// Normalize a JSON value recursively.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, v) in map {
                if v.is_null() {
                    continue;
                }
                out.insert(key.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Number(n) => {
            if n.is_f64() {
                if let Some(f) = n.as_f64() {
                    if f.fract() == 0.0 && f.abs() < 9.0e15 {
                        return Value::from(f as i64);
                    }
                }
            }
            value.clone()
        }
        Value::String(s) => Value::String(s.replace("\r\n", "\n")),
        other => other.clone(),
    }
}

/// Canonical JSON form of a record with volatile fields removed.
///
/// A volatile name without a dot is removed from the record envelope and from
/// the payload; `extensions.<key>` removes a single extension attribute.
pub fn canonical_record(record: &Record, volatile: &[String]) -> Value {
    let mut value = serde_json::to_value(record).unwrap_or_default();

    if let Value::Object(envelope) = &mut value {
        for name in ALWAYS_VOLATILE {
            envelope.remove(name);
        }
        for name in volatile {
            match name.strip_prefix("extensions.") {
                Some(key) => {
                    if let Some(Value::Object(ext)) = envelope.get_mut("extensions") {
                        ext.remove(key);
                    }
                }
                None => {
                    envelope.remove(name.as_str());
                    if let Some(Value::Object(payload)) = envelope.get_mut("payload") {
                        payload.remove(name.as_str());
                    }
                }
            }
        }
        if matches!(envelope.get("extensions"), Some(Value::Object(ext)) if ext.is_empty()) {
            envelope.remove("extensions");
        }
    }

    canonicalize(&value)
}

/// SHA-256 hex digest of the canonical record form.
pub fn canonical_checksum(record: &Record, volatile: &[String]) -> String {
    let canonical = canonical_record(record, volatile);
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// JSON type name of a value.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Find the first path where two values have incompatible shapes.
///
/// Nulls are compatible with anything. Objects are compared on their common
/// keys, arrays element-wise over the shorter length. Returns the dotted path
/// of the conflict with the two type names, or `None` when compatible.
pub fn shape_conflict(path: &str, a: &Value, b: &Value) -> Option<(String, &'static str, &'static str)> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Object(left), Value::Object(right)) => {
            for (key, lv) in left {
                if let Some(rv) = right.get(key) {
                    let child = format!("{}.{}", path, key);
                    if let Some(conflict) = shape_conflict(&child, lv, rv) {
                        return Some(conflict);
                    }
                }
            }
            None
        }
        (Value::Array(left), Value::Array(right)) => {
            for (i, (lv, rv)) in left.iter().zip(right.iter()).enumerate() {
                let child = format!("{}[{}]", path, i);
                if let Some(conflict) = shape_conflict(&child, lv, rv) {
                    return Some(conflict);
                }
            }
            None
        }
        _ => {
            let (ta, tb) = (type_name(a), type_name(b));
            if ta == tb {
                None
            } else {
                Some((path.to_string(), ta, tb))
            }
        }
    }
}
