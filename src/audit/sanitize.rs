//! Audit payload sanitisation and canonical hashing.
//!
//! Payloads are untrusted. Before they are hashed and chained they are
//! stripped of control characters and bounded in depth, width and string
//! length. The canonical form sorts object keys recursively so that the
//! digest does not depend on insertion order.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Marker substituted for content beyond the depth limit.
pub const TRUNCATED_MARKER: &str = "[truncated]";

/// Key recording how many fields or elements were dropped.
///
/// Starts with a control character, which sanitised keys and strings never
/// contain, so it cannot collide with payload content.
pub const TRUNCATED_KEY: &str = "\u{1}truncated";

/// Sanitisation error types.
#[derive(Debug, Error)]
pub enum SanitizeError {
    /// The payload cannot be represented as JSON.
    #[error("payload is not serializable: {0}")]
    Unserializable(#[from] serde_json::Error),
}

/// Bounds applied by [`sanitize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SanitizeLimits {
    /// Maximum nesting depth of objects and arrays.
    pub max_depth: usize,
    /// Maximum fields per object and elements per array.
    pub max_fields: usize,
    /// Maximum characters per string.
    pub max_string_len: usize,
}

impl Default for SanitizeLimits {
    fn default() -> Self {
        Self {
            max_depth: 8,
            max_fields: 64,
            max_string_len: 4096,
        }
    }
}

/// Convert any serializable payload to JSON.
///
/// # Errors
///
/// Returns [`SanitizeError::Unserializable`] for values JSON cannot
/// represent, such as maps with non-string keys.
pub fn to_payload<T: Serialize>(payload: &T) -> Result<Value, SanitizeError> {
    Ok(serde_json::to_value(payload)?)
}

/// Return a bounded, control-character-free copy of `value`.
pub fn sanitize(value: &Value, limits: &SanitizeLimits) -> Value {
    sanitize_at(value, limits, 0)
}

fn sanitize_at(value: &Value, limits: &SanitizeLimits, depth: usize) -> Value {
    match value {
        Value::String(s) => Value::String(clean_string(s, limits.max_string_len)),
        Value::Array(items) => {
            if depth >= limits.max_depth {
                return Value::String(TRUNCATED_MARKER.to_owned());
            }
            let next = depth.saturating_add(1);
            let mut out: Vec<Value> = items
                .iter()
                .take(limits.max_fields)
                .map(|v| sanitize_at(v, limits, next))
                .collect();
            let dropped = items.len().saturating_sub(limits.max_fields);
            if dropped > 0 {
                out.push(Value::String(format!("{TRUNCATED_KEY}:{dropped}")));
            }
            Value::Array(out)
        }
        Value::Object(fields) => {
            if depth >= limits.max_depth {
                return Value::String(TRUNCATED_MARKER.to_owned());
            }
            let next = depth.saturating_add(1);
            let mut out = Map::new();
            let mut dropped = fields.len().saturating_sub(limits.max_fields);
            for (key, v) in fields.iter().take(limits.max_fields) {
                let key = clean_string(key, limits.max_string_len);
                // Keys that collapse onto an earlier one are dropped, not merged.
                if out.contains_key(&key) {
                    dropped = dropped.saturating_add(1);
                    continue;
                }
                out.insert(key, sanitize_at(v, limits, next));
            }
            if dropped > 0 {
                out.insert(TRUNCATED_KEY.to_owned(), Value::from(dropped));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn clean_string(s: &str, max_len: usize) -> String {
    s.chars().filter(|c| !c.is_control()).take(max_len).collect()
}

/// Canonical JSON bytes: object keys sorted recursively, no whitespace.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(fields) => {
            let mut keys: Vec<&String> = fields.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_scalar(&Value::String(key.clone()), out);
                out.push(b':');
                if let Some(v) = fields.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => write_scalar(scalar, out),
    }
}

fn write_scalar(value: &Value, out: &mut Vec<u8>) {
    // Scalars serialise infallibly; fall back to null for completeness.
    match serde_json::to_vec(value) {
        Ok(bytes) => out.extend_from_slice(&bytes),
        Err(_) => out.extend_from_slice(b"null"),
    }
}

/// SHA-256 hex digest of the canonical form.
pub fn digest(value: &Value) -> String {
    hex::encode(Sha256::digest(canonical_bytes(value)))
}
