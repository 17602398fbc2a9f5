//! Core value model: rows, keys, content hashing, and the total value order.
//!
//! This module defines:
//!
//! - [`Data`]: the blanket trait bound for elements flowing through the graph.
//! - [`KeyValue`]: the key extracted from a row (string or integer), plus the
//!   composite rendering used for join results.
//! - [`ContentHash`]: stable 64-bit content hashing, the equality notion used
//!   by consolidation and the hybrid index.
//! - [`value_compare`] / [`value_eq`]: the total order and equality over JSON
//!   values used by comparators, range indexes, and ordered windows.
//!
//! Rows at the query layer are plain [`serde_json::Value`] objects. The
//! default `serde_json` map is sorted by key, so serializing a row yields
//! canonical text; content hashes are FNV-1a over that text.

use fnv::FnvHasher;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::hash::Hasher;

/// The standard trait bound for elements carried on a difference stream.
///
/// Elements may be buffered, cloned into operator state, and shared with
/// callbacks, so they must be `'static + Send + Sync + Clone`.
pub trait Data: 'static + Send + Sync + Clone {}
impl<T> Data for T where T: 'static + Send + Sync + Clone {}

/// A key extracted from a row: a string or an integer.
///
/// Composite keys produced by joins are rendered as strings of the form
/// `"[left_key,right_key]"` via [`KeyValue::composite`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyValue {
    /// Integer key.
    Int(i64),
    /// String key.
    Str(String),
}

impl KeyValue {
    /// Extract a key from a JSON value. Only strings and integer numbers are
    /// valid keys; anything else returns `None`.
    pub fn from_value(v: &Value) -> Option<KeyValue> {
        match v {
            Value::String(s) => Some(KeyValue::Str(s.clone())),
            Value::Number(n) => n.as_i64().map(KeyValue::Int),
            _ => None,
        }
    }

    /// Render the composite key for a joined row: `"[left,right]"`.
    pub fn composite(parts: &[KeyValue]) -> KeyValue {
        let mut s = String::from("[");
        for (i, p) in parts.iter().enumerate() {
            if i > 0 {
                s.push(',');
            }
            match p {
                KeyValue::Int(n) => s.push_str(&n.to_string()),
                KeyValue::Str(t) => s.push_str(t),
            }
        }
        s.push(']');
        KeyValue::Str(s)
    }

    /// The key as a JSON value (used when keys re-enter expressions).
    pub fn to_value(&self) -> Value {
        match self {
            KeyValue::Int(n) => Value::from(*n),
            KeyValue::Str(s) => Value::from(s.clone()),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(n) => write!(f, "{n}"),
            KeyValue::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for KeyValue {
    fn from(s: &str) -> Self {
        KeyValue::Str(s.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(s: String) -> Self {
        KeyValue::Str(s)
    }
}

impl From<i64> for KeyValue {
    fn from(n: i64) -> Self {
        KeyValue::Int(n)
    }
}

// |-----------------|
// | Content hashing |
// |-----------------|

/// Stable, deterministic 64-bit content hash.
///
/// Consolidation and the hybrid index treat two values as equal exactly when
/// their content hashes are equal; the hash must therefore be stable across
/// runs and collision-resistant for practical purposes.
pub trait ContentHash {
    /// The 64-bit content hash of `self`.
    fn content_hash(&self) -> u64;
}

fn fnv64(bytes: &[u8]) -> u64 {
    let mut h = FnvHasher::default();
    h.write(bytes);
    h.finish()
}

/// Combine two hashes order-dependently.
pub(crate) fn mix(a: u64, b: u64) -> u64 {
    let mut h = FnvHasher::with_key(a);
    h.write(&b.to_le_bytes());
    h.finish()
}

impl ContentHash for Value {
    fn content_hash(&self) -> u64 {
        // serde_json's default map is ordered by key, so this text is
        // canonical for structurally equal objects.
        let text = serde_json::to_string(self).unwrap_or_default();
        fnv64(text.as_bytes())
    }
}

impl ContentHash for KeyValue {
    fn content_hash(&self) -> u64 {
        match self {
            KeyValue::Int(n) => mix(1, *n as u64),
            KeyValue::Str(s) => mix(2, fnv64(s.as_bytes())),
        }
    }
}

impl ContentHash for String {
    fn content_hash(&self) -> u64 {
        fnv64(self.as_bytes())
    }
}

impl ContentHash for &str {
    fn content_hash(&self) -> u64 {
        fnv64(self.as_bytes())
    }
}

impl ContentHash for u64 {
    fn content_hash(&self) -> u64 {
        mix(3, *self)
    }
}

impl ContentHash for i64 {
    fn content_hash(&self) -> u64 {
        mix(4, *self as u64)
    }
}

impl ContentHash for bool {
    fn content_hash(&self) -> u64 {
        mix(5, *self as u64)
    }
}

impl<T: ContentHash> ContentHash for Option<T> {
    fn content_hash(&self) -> u64 {
        match self {
            None => mix(6, 0),
            Some(t) => mix(7, t.content_hash()),
        }
    }
}

impl<A: ContentHash, B: ContentHash> ContentHash for (A, B) {
    fn content_hash(&self) -> u64 {
        mix(self.0.content_hash(), self.1.content_hash())
    }
}

impl<A: ContentHash, B: ContentHash, C: ContentHash> ContentHash for (A, B, C) {
    fn content_hash(&self) -> u64 {
        mix(mix(self.0.content_hash(), self.1.content_hash()), self.2.content_hash())
    }
}

// |-------------------|
// | Total value order |
// |-------------------|

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: null < bool < number < string < array <
/// object. Numbers compare as floats with a total order; arrays compare
/// lexicographically; objects compare by canonical text.
pub fn value_compare(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let fx = OrderedFloat(x.as_f64().unwrap_or(f64::NAN));
            let fy = OrderedFloat(y.as_f64().unwrap_or(f64::NAN));
            fx.cmp(&fy)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (ex, ey) in x.iter().zip(y.iter()) {
                let ord = value_compare(ex, ey);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => {
            let sx = serde_json::to_string(a).unwrap_or_default();
            let sy = serde_json::to_string(b).unwrap_or_default();
            sx.cmp(&sy)
        }
    }
}

/// Equality under the value order: numbers compare numerically, so `1` and
/// `1.0` are equal even though `serde_json` distinguishes them.
pub fn value_eq(a: &Value, b: &Value) -> bool {
    value_compare(a, b) == Ordering::Equal
}

/// A JSON value wrapper that is `Ord` under [`value_compare`], usable as a
/// `BTreeMap` key in range indexes and ordered windows.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrdValue(pub Value);

impl PartialEq for OrdValue {
    fn eq(&self, other: &Self) -> bool {
        value_compare(&self.0, &other.0) == Ordering::Equal
    }
}

impl Eq for OrdValue {}

impl PartialOrd for OrdValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrdValue {
    fn cmp(&self, other: &Self) -> Ordering {
        value_compare(&self.0, &other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_hash_is_stable_across_key_order() {
        let a = json!({"b": 2, "a": 1});
        let b = json!({"a": 1, "b": 2});
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn content_hash_distinguishes_values() {
        assert_ne!(json!({"a": 1}).content_hash(), json!({"a": 2}).content_hash());
        assert_ne!(KeyValue::Int(1).content_hash(), KeyValue::Str("1".into()).content_hash());
    }

    #[test]
    fn value_order_ranks_types() {
        let mut vals = vec![
            json!({"k": 1}),
            json!("x"),
            json!([1, 2]),
            json!(3.5),
            json!(true),
            Value::Null,
        ];
        vals.sort_by(value_compare);
        assert_eq!(vals[0], Value::Null);
        assert_eq!(vals[1], json!(true));
        assert_eq!(vals[2], json!(3.5));
        assert_eq!(vals[3], json!("x"));
        assert_eq!(vals[4], json!([1, 2]));
    }

    #[test]
    fn numeric_equality_crosses_representations() {
        assert!(value_eq(&json!(1), &json!(1.0)));
        assert!(!value_eq(&json!(1), &json!("1")));
    }

    #[test]
    fn composite_key_rendering() {
        let k = KeyValue::composite(&[KeyValue::Int(1), KeyValue::Str("a".into())]);
        assert_eq!(k, KeyValue::Str("[1,a]".into()));
    }
}
