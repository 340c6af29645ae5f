//! Canonical content hashing.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Drop excluded keys at every depth and sort arrays found under unordered
/// keys. Object keys are re-inserted in sorted order so serialization is
/// stable whatever map ordering serde_json was built with.
pub fn canonicalize(value: &Value, excluded: &HashSet<String>, unordered: &HashSet<String>) -> Value {
    match value {
        Value::Object(obj) => {
            let mut keys: Vec<&String> = obj.keys().filter(|k| !excluded.contains(*k)).collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                let mut child = canonicalize(&obj[k], excluded, unordered);
                if unordered.contains(k) {
                    if let Value::Array(items) = &mut child {
                        sort_values(items);
                    }
                }
                out.insert(k.clone(), child);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| canonicalize(v, excluded, unordered))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Order values by their compact JSON encoding.
pub(crate) fn sort_values(items: &mut [Value]) {
    items.sort_by_cached_key(|v| serde_json::to_string(v).unwrap_or_default());
}

/// SHA-256 (lowercase hex) of an already canonical value.
pub fn digest(canonical: &Value) -> String {
    let encoded = serde_json::to_string(canonical).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(encoded.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Top-level keys whose values differ between two canonical projections.
pub fn changed_fields(previous: &Value, next: &Value) -> Vec<String> {
    match (previous, next) {
        (Value::Object(a), Value::Object(b)) => {
            let mut keys: Vec<String> = a
                .keys()
                .chain(b.keys())
                .filter(|k| a.get(*k) != b.get(*k))
                .cloned()
                .collect();
            keys.sort();
            keys.dedup();
            keys
        }
        _ if previous != next => vec!["$".to_string()],
        _ => Vec::new(),
    }
}
