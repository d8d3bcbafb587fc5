// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical JSON normalization and SHA-256 hashing.
//!
//! The spec requires "same IR ⇒ same checksum" but leaves the exact
//! canonical form unspecified (§9, Open Questions). This module fixes one
//! deterministic form, used everywhere a checksum, hash, or signature input
//! is computed: the preloader's artifact checksum (C2), the audit chain's
//! event hashes (C6), and the version lifecycle's DAG checksum (C12).
//!
//! Canonical form: object keys are sorted lexicographically by UTF-8 byte
//! value (recursively, at every nesting level), array order is preserved,
//! there is no insignificant whitespace, and numbers are rendered through
//! `serde_json`'s own formatting (no leading zeros or explicit `+` signs are
//! ever produced by that formatter). The output is always valid UTF-8.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::EyeflowError;

/// Serialize `value` to its canonical JSON string form.
///
/// # Errors
///
/// Returns [`EyeflowError::Serialization`] if `value` cannot be represented
/// as JSON at all (e.g. a map with non-string keys after substitution).
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, EyeflowError> {
    let v = serde_json::to_value(value).map_err(EyeflowError::from_serde)?;
    let sorted = sort_value(v);
    serde_json::to_string(&sorted).map_err(EyeflowError::from_serde)
}

/// Hex-encoded SHA-256 digest of the canonical JSON form of `value`.
///
/// # Errors
///
/// Propagates [`canonical_json`]'s errors.
pub fn sha256_of_canonical<T: Serialize>(value: &T) -> Result<String, EyeflowError> {
    let s = canonical_json(value)?;
    Ok(sha256_hex(s.as_bytes()))
}

/// Hex-encoded SHA-256 digest of raw bytes.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Recursively sort every JSON object's keys, leaving arrays and scalars
/// untouched in order/value.
fn sort_value(value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<String> = map.keys().cloned().collect();
            keys.sort();
            for k in keys {
                let v = map[&k].clone();
                sorted.insert(k, sort_value(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_value).collect()),
        other => other,
    }
}

/// Minimal hex encoding so this crate does not need the `hex` dependency
/// just for a handful of digest formats.
mod hex {
    const TABLE: &[u8; 16] = b"0123456789abcdef";

    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        let bytes = bytes.as_ref();
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            out.push(TABLE[(b >> 4) as usize] as char);
            out.push(TABLE[(b & 0x0f) as usize] as char);
        }
        out
    }
}

/// 64 ASCII zero characters — the `previousEventHash` of the genesis audit
/// event.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_recursively() {
        let v = json!({"b": 1, "a": {"d": 2, "c": 3}});
        let s = canonical_json(&v).unwrap();
        assert_eq!(s, r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn preserves_array_order() {
        let v = json!({"a": [3, 1, 2]});
        let s = canonical_json(&v).unwrap();
        assert_eq!(s, r#"{"a":[3,1,2]}"#);
    }

    #[test]
    fn identical_structure_hashes_identically_regardless_of_key_order() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(
            sha256_of_canonical(&a).unwrap(),
            sha256_of_canonical(&b).unwrap()
        );
    }

    #[test]
    fn genesis_hash_is_64_chars() {
        assert_eq!(GENESIS_HASH.len(), 64);
        assert!(GENESIS_HASH.chars().all(|c| c == '0'));
    }

    #[test]
    fn hex_encode_matches_known_vector() {
        // SHA-256("") = e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855
        let digest = sha256_hex(b"");
        assert_eq!(
            digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
