//! Content digests over compact JSON.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// SHA-256 of the compact serialization of `value`, as `sha256:<hex>`.
///
/// Objects serialize with sorted keys, so key order does not affect the
/// result.
pub fn content_digest(value: &Value) -> String {
    let digest = Sha256::digest(value.to_string().as_bytes());
    format!("sha256:{}", hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_digest_ignores_key_order() {
        let a = json!({"b": 2, "a": {"y": [1, 2], "x": "q\"uote"}});
        let b = json!({"a": {"x": "q\"uote", "y": [1, 2]}, "b": 2});
        assert_eq!(content_digest(&a), content_digest(&b));
        assert!(content_digest(&a).starts_with("sha256:"));
        assert_eq!(content_digest(&a).len(), "sha256:".len() + 64);
    }

    #[test]
    fn test_digest_hashes_sorted_compact_form() {
        let value = json!({"b": [true, null], "a": "x"});
        let expected = hex::encode(Sha256::digest(br#"{"a":"x","b":[true,null]}"#));
        assert_eq!(content_digest(&value), format!("sha256:{expected}"));
    }

    #[test]
    fn test_digest_sees_array_order() {
        assert_ne!(
            content_digest(&json!([1, 2])),
            content_digest(&json!([2, 1]))
        );
    }
}
