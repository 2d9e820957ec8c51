//! Request fingerprinting
//!
//! A fingerprint is a SHA-256 digest of the *normalized* request parameters.
//! Normalization sorts object keys and list elements so that two requests
//! that differ only in list ordering (e.g. `["AAPL", "MSFT"]` vs
//! `["MSFT", "AAPL"]`) hash to the same cache key.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Compute the cache fingerprint for a request
///
/// Returns a fixed-width lowercase hex string (64 chars).
pub fn fingerprint(params: &Value) -> String {
    let canonical = canonicalize(params);
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Normalize a JSON value for hashing
///
/// Objects already iterate in key order (serde_json's default map is a
/// BTreeMap); arrays are sorted by the canonical serialization of their
/// elements, recursively.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Array(items) => {
            let mut normalized: Vec<Value> = items.iter().map(canonicalize).collect();
            normalized.sort_by_key(|v| v.to_string());
            Value::Array(normalized)
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}
