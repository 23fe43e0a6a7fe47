#![forbid(unsafe_code)]

//! Canonical values and the codec seam used by caching layers.
//!
//! Cells carry dynamically shaped values. [`Value`] (an alias for
//! [`serde_json::Value`]) is the canonical representation: its object maps are
//! ordered, so structural equality between two values is exactly "serialises
//! to the same canonical text". The equality gate in
//! [`Cell::changed`](crate::Cell::changed) relies on this.
//!
//! [`Codec`] is the seam between a cell and any layer that needs a textual
//! form of its value (the shared cache, the cross-frame proxy). The default
//! [`JsonCodec`] round-trips through canonical JSON.

use std::fmt;

/// The canonical dynamic value held by a cell.
///
/// `serde_json::Value` compares maps with stable key ordering, so `a == b`
/// holds iff `canonical_string(&a) == canonical_string(&b)`.
pub type Value = serde_json::Value;

/// Canonical textual form of a value.
///
/// Deterministic for equal inputs: object keys serialise in sorted order.
#[must_use]
pub fn canonical_string(value: &Value) -> String {
    // Serialization of `Value` cannot fail: there are no non-string keys and
    // no foreign types involved.
    serde_json::to_string(value).unwrap_or_else(|_| String::from("null"))
}

/// Canonical deep equality between two proposed values.
///
/// Two values that serialise identically are equal; equal proposals do not
/// trigger a cell transition.
#[must_use]
pub fn canonical_eq(a: &Value, b: &Value) -> bool {
    a == b
}

/// Encode/decode seam for value persistence and cross-frame transport.
///
/// Implementations must be deterministic: encoding equal values yields equal
/// text. `decode` returns `None` for text it cannot understand; callers treat
/// that as "no stored value" rather than an error.
pub trait Codec {
    /// Serialise a value to its stored textual form.
    fn encode(&self, value: &Value) -> String;

    /// Parse a stored textual form back into a value.
    fn decode(&self, text: &str) -> Option<Value>;
}

impl fmt::Debug for dyn Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec").finish_non_exhaustive()
    }
}

/// The default codec: canonical JSON text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> String {
        canonical_string(value)
    }

    fn decode(&self, text: &str) -> Option<Value> {
        serde_json::from_str(text).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_string_is_deterministic() {
        let a = json!({"b": 1, "a": [2, {"z": null, "y": true}]});
        let b = json!({"a": [2, {"y": true, "z": null}], "b": 1});
        assert_eq!(canonical_string(&a), canonical_string(&b));
    }

    #[test]
    fn canonical_eq_matches_serialised_form() {
        let a = json!({"x": 1, "y": "two"});
        let b = json!({"y": "two", "x": 1});
        assert!(canonical_eq(&a, &b));
        assert_eq!(canonical_string(&a), canonical_string(&b));

        let c = json!({"x": 1, "y": "three"});
        assert!(!canonical_eq(&a, &c));
    }

    #[test]
    fn json_codec_round_trips() {
        let v = json!({"nested": {"list": [1, 2, 3]}, "ok": true});
        let text = JsonCodec.encode(&v);
        assert_eq!(JsonCodec.decode(&text), Some(v));
    }

    #[test]
    fn json_codec_rejects_garbage() {
        assert_eq!(JsonCodec.decode("not json at all {"), None);
    }

    #[test]
    fn null_and_absent_are_distinct_values() {
        // `null` is a legal value with a canonical form; absence of a value
        // is modelled as `Option::None` upstream and never reaches a codec.
        assert_eq!(JsonCodec.encode(&Value::Null), "null");
        assert_eq!(JsonCodec.decode("null"), Some(Value::Null));
    }
}
