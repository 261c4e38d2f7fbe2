//! Canonical JSON and content checksums.
//!
//! Checksums decide whether a function or flow stored remotely still matches
//! the local object, so the serialized form must not depend on map insertion
//! order: object keys are sorted recursively before hashing.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::Result;

/// Rebuild `value` with every object's keys in sorted order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Canonical (sorted-key, compact) JSON text of any serializable value.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&canonicalize(&value))?)
}

/// SHA-256 of the canonical JSON form, hex encoded.
pub fn checksum<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(hex_digest(canonical_json(value)?.as_bytes()))
}

/// Compute the SHA-256 hex digest of `data`.
pub fn hex_digest(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    hex_encode(&hash)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
