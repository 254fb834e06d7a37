//! Structural key model.
//!
//! [`Value`] is a JSON-like value with one addition over `serde_json::Value`:
//! a dedicated [`Value::Set`] variant whose equality and hash are
//! order-insensitive, next to [`Value::Array`] whose equality and hash stay
//! order-sensitive. [`Key`] is an ordered sequence of `Value`s used to index
//! the query and mutation caches; `Key::starts_with` implements the prefix
//! matching used by cache filters (see `query::cache::Filter`).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A JSON-like value used to build cache [`Key`]s and opaque `meta` maps.
///
/// Equality and hashing are deep/structural: [`Value::Array`] is
/// order-sensitive, [`Value::Set`] and [`Value::Map`] are not. Two values
/// with equal structure always produce equal hashes (required by
/// `spec.md` §3.1 / §8 property 1-2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    /// Unordered collection; duplicates are preserved (multiset semantics).
    Set(Vec<Value>),
    /// Unordered key/value collection; keys are assumed unique.
    Map(Vec<(String, Value)>),
}

fn sub_hash(v: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    v.hash(&mut hasher);
    hasher.finish()
}

fn multiset_eq(a: &[Value], b: &[Value]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut remaining: Vec<&Value> = b.iter().collect();
    for item in a {
        match remaining.iter().position(|v| *v == item) {
            Some(pos) => {
                remaining.remove(pos);
            }
            None => return false,
        }
    }
    true
}

fn map_eq(a: &[(String, Value)], b: &[(String, Value)]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|(k, v)| {
        b.iter()
            .find(|(bk, _)| bk == k)
            .is_some_and(|(_, bv)| bv == v)
    })
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            // Structural equality is bitwise so Eq/Hash stay consistent
            // (IEEE NaN != NaN would otherwise violate the Hash contract).
            (Value::Number(a), Value::Number(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => multiset_eq(a, b),
            (Value::Map(a), Value::Map(b)) => map_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => 0u8.hash(state),
            Value::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Value::Number(n) => {
                2u8.hash(state);
                n.to_bits().hash(state);
            }
            Value::String(s) => {
                3u8.hash(state);
                s.hash(state);
            }
            Value::Array(items) => {
                4u8.hash(state);
                items.len().hash(state);
                for item in items {
                    item.hash(state);
                }
            }
            Value::Set(items) => {
                5u8.hash(state);
                items.len().hash(state);
                // XOR-fold so permutations of the same elements hash equal.
                let combined = items.iter().map(sub_hash).fold(0u64, |acc, h| acc ^ h);
                combined.hash(state);
            }
            Value::Map(entries) => {
                6u8.hash(state);
                entries.len().hash(state);
                let combined = entries
                    .iter()
                    .map(|(k, v)| {
                        let mut h = DefaultHasher::new();
                        k.hash(&mut h);
                        v.hash(&mut h);
                        h.finish()
                    })
                    .fold(0u64, |acc, h| acc ^ h);
                combined.hash(state);
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

macro_rules! impl_value_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(n: $ty) -> Self {
                    Value::Number(n as f64)
                }
            }
        )*
    };
}

impl_value_from_int!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Ordered, deeply-structural cache key. Two keys with equal structure are
/// equal and hash equal, regardless of how they were constructed.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Key(pub Vec<Value>);

impl Key {
    pub fn new(parts: Vec<Value>) -> Self {
        Self(parts)
    }

    pub fn from_parts<I, V>(parts: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    pub fn parts(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True iff `self`'s first `prefix.len()` elements deeply equal `prefix`.
    pub fn starts_with(&self, prefix: &Key) -> bool {
        prefix.0.len() <= self.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key(vec![Value::String(s.to_string())])
    }
}

impl<const N: usize> From<[&str; N]> for Key {
    fn from(parts: [&str; N]) -> Self {
        Key(parts.iter().map(|s| Value::String(s.to_string())).collect())
    }
}

/// Build a [`Key`] from heterogeneous parts: `key!["users", user_id, true]`.
#[macro_export]
macro_rules! key {
    ($($part:expr),* $(,)?) => {
        $crate::Key::new(vec![$($crate::Value::from($part)),*])
    };
}

/// Deep-merge `meta` maps per the meta aggregation rule (`spec.md` §4.5
/// step 3): later additions win on scalars, nested maps merge recursively.
/// `Set`/`Array`/scalar values are simply replaced by the incoming side.
pub fn deep_merge(base: &Value, incoming: &Value) -> Value {
    match (base, incoming) {
        (Value::Map(base_entries), Value::Map(incoming_entries)) => {
            let mut merged: Vec<(String, Value)> = base_entries.clone();
            for (key, incoming_value) in incoming_entries {
                if let Some(existing) = merged.iter_mut().find(|(k, _)| k == key) {
                    existing.1 = deep_merge(&existing.1, incoming_value);
                } else {
                    merged.push((key.clone(), incoming_value.clone()));
                }
            }
            Value::Map(merged)
        }
        (_, incoming) => incoming.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_is_order_sensitive() {
        let a = Value::Array(vec![Value::from(1), Value::from(2)]);
        let b = Value::Array(vec![Value::from(2), Value::from(1)]);
        assert_ne!(a, b);
    }

    #[test]
    fn set_is_order_insensitive() {
        let a = Value::Set(vec![Value::from(1), Value::from(2)]);
        let b = Value::Set(vec![Value::from(2), Value::from(1)]);
        assert_eq!(a, b);

        let mut hasher_a = DefaultHasher::new();
        a.hash(&mut hasher_a);
        let mut hasher_b = DefaultHasher::new();
        b.hash(&mut hasher_b);
        assert_eq!(hasher_a.finish(), hasher_b.finish());
    }

    #[test]
    fn map_is_key_order_insensitive() {
        let a = Value::Map(vec![("a".into(), Value::from(1)), ("b".into(), Value::from(2))]);
        let b = Value::Map(vec![("b".into(), Value::from(2)), ("a".into(), Value::from(1))]);
        assert_eq!(a, b);
    }

    #[test]
    fn key_starts_with_matches_prefix_law() {
        let key = key!["users", 1, "profile"];
        assert!(key.starts_with(&key!["users", 1]));
        assert!(key.starts_with(&key!["users"]));
        assert!(key.starts_with(&Key::default()));
        assert!(!key.starts_with(&key!["users", 2]));
        assert!(!key.starts_with(&key!["users", 1, "profile", "extra"]));
    }

    #[test]
    fn key_equality_is_structural_not_by_reference() {
        let a = key!["users", 1];
        let b = key!["users", 1];
        assert_eq!(a, b);

        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(a, "value");
        assert_eq!(map.get(&b), Some(&"value"));
    }

    #[test]
    fn deep_merge_scalars_take_incoming_nested_maps_merge() {
        let base = Value::Map(vec![
            ("a".into(), Value::from(1)),
            (
                "nested".into(),
                Value::Map(vec![("x".into(), Value::from(1))]),
            ),
        ]);
        let incoming = Value::Map(vec![
            ("a".into(), Value::from(2)),
            (
                "nested".into(),
                Value::Map(vec![("y".into(), Value::from(2))]),
            ),
        ]);
        let merged = deep_merge(&base, &incoming);
        match merged {
            Value::Map(entries) => {
                assert_eq!(
                    entries.iter().find(|(k, _)| k == "a").unwrap().1,
                    Value::from(2)
                );
                let nested = &entries.iter().find(|(k, _)| k == "nested").unwrap().1;
                match nested {
                    Value::Map(nested_entries) => {
                        assert_eq!(nested_entries.len(), 2);
                    }
                    _ => panic!("expected nested map"),
                }
            }
            _ => panic!("expected map"),
        }
    }
}
