//! The tagged sum of everything the framework treats as data.
//!
//! A [`Value`] is either a plain leaf (scalars, strings, bytes), a structural
//! node (sequence or string-keyed map), a reference to a not-yet-computed
//! task output ([`Value::Ref`]), or a user object reduced to its declared
//! canonical form and wrapped with a type tag ([`Value::Custom`]).
//!
//! Values are owned trees, so they are acyclic by construction; sharing
//! between values is expressed through future references, never through
//! aliasing.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::ValueError;
use crate::hash::Hash;

/// A hashable value, possibly containing embedded future references.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Seq(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// A handle to the output of another task, identified by fingerprint.
    Ref(Hash),
    /// A user object in its declared canonical form, wrapped with a type
    /// tag so that distinct types with identical structure do not collide.
    Custom { tag: String, inner: Box<Value> },
}

/// User objects that declare their own canonical form.
pub trait ToValue {
    /// Stable tag distinguishing this type from structurally identical ones.
    fn type_tag(&self) -> &'static str;

    fn to_value(&self) -> Result<Value, ValueError>;
}

impl Value {
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(bytes.into())
    }

    pub fn seq(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Seq(items.into_iter().collect())
    }

    /// Wrap a user object in its tagged canonical form.
    pub fn custom(obj: &dyn ToValue) -> Result<Self, ValueError> {
        Ok(Value::Custom {
            tag: obj.type_tag().to_string(),
            inner: Box::new(obj.to_value()?),
        })
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::Seq(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_ref_hash(&self) -> Option<Hash> {
        match self {
            Value::Ref(hash) => Some(*hash),
            _ => None,
        }
    }

    /// Fingerprints of every embedded future, in traversal order, deduplicated.
    pub fn refs(&self) -> Vec<Hash> {
        let mut found = Vec::new();
        self.visit_refs(&mut |hash| {
            if !found.contains(&hash) {
                found.push(hash);
            }
        });
        found
    }

    pub fn contains_refs(&self) -> bool {
        let mut any = false;
        self.visit_refs(&mut |_| any = true);
        any
    }

    fn visit_refs(&self, visit: &mut impl FnMut(Hash)) {
        match self {
            Value::Ref(hash) => visit(*hash),
            Value::Seq(items) => {
                for item in items {
                    item.visit_refs(visit);
                }
            }
            Value::Map(map) => {
                for item in map.values() {
                    item.visit_refs(visit);
                }
            }
            Value::Custom { inner, .. } => inner.visit_refs(visit),
            _ => {}
        }
    }

    /// Replace every embedded future reference by its resolved value.
    ///
    /// Substitution is shallow-to-deep: a replacement that is itself a
    /// composite is substituted again, so the output never contains a
    /// reference the mapping can resolve.
    pub fn substitute(
        &self,
        resolve: &impl Fn(&Hash) -> Option<Value>,
    ) -> Result<Value, ValueError> {
        Ok(match self {
            Value::Ref(hash) => {
                let replacement =
                    resolve(hash).ok_or(ValueError::UnresolvedRef(*hash))?;
                replacement.substitute(resolve)?
            }
            Value::Seq(items) => Value::Seq(
                items
                    .iter()
                    .map(|item| item.substitute(resolve))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Map(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.substitute(resolve)?)))
                    .collect::<Result<_, ValueError>>()?,
            ),
            Value::Custom { tag, inner } => Value::Custom {
                tag: tag.clone(),
                inner: Box::new(inner.substitute(resolve)?),
            },
            plain => plain.clone(),
        })
    }

    /// Build a value from a JSON document.
    ///
    /// Integers outside the `i64` range cannot be canonicalised and are
    /// rejected.
    pub fn from_json(json: serde_json::Value) -> Result<Self, ValueError> {
        Ok(match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    return Err(ValueError::Unsupported(format!(
                        "number out of range: {n}"
                    )));
                }
            }
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => Value::Seq(
                items
                    .into_iter()
                    .map(Value::from_json)
                    .collect::<Result<_, _>>()?,
            ),
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| Ok((k, Value::from_json(v)?)))
                    .collect::<Result<_, ValueError>>()?,
            ),
        })
    }

    /// Render a fully substituted value as JSON.
    ///
    /// Bytes, future references and tagged user objects have no JSON
    /// counterpart and are rejected.
    pub fn to_json(&self) -> Result<serde_json::Value, ValueError> {
        Ok(match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or_else(|| {
                    ValueError::Unsupported(format!("non-finite float: {f}"))
                })?,
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Seq(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(Value::to_json)
                    .collect::<Result<_, _>>()?,
            ),
            Value::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.to_json()?)))
                    .collect::<Result<_, ValueError>>()?,
            ),
            other => {
                return Err(ValueError::Unsupported(format!(
                    "no JSON form for {other}"
                )))
            }
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Seq(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Ref(hash) => write!(f, "@{}", hash.tag()),
            Value::Custom { tag, inner } => write!(f, "{tag}({inner})"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Seq(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ref() -> Hash {
        Hash::digest(b"some task")
    }

    #[test]
    fn refs_are_collected_deduplicated() {
        let hash = sample_ref();
        let value = Value::seq([
            Value::Ref(hash),
            Value::Map(BTreeMap::from([("x".to_string(), Value::Ref(hash))])),
            Value::Int(3),
        ]);
        assert_eq!(value.refs(), vec![hash]);
        assert!(value.contains_refs());
        assert!(!Value::Int(3).contains_refs());
    }

    #[test]
    fn substitute_replaces_refs_deeply() {
        let inner = sample_ref();
        let outer = Hash::digest(b"outer task");
        // The replacement of `outer` itself embeds `inner`.
        let resolve = |hash: &Hash| {
            if *hash == outer {
                Some(Value::seq([Value::Ref(inner), Value::Int(1)]))
            } else if *hash == inner {
                Some(Value::Int(42))
            } else {
                None
            }
        };

        let substituted = Value::Ref(outer).substitute(&resolve).unwrap();
        assert_eq!(substituted, Value::seq([Value::Int(42), Value::Int(1)]));
    }

    #[test]
    fn substitute_fails_on_unknown_ref() {
        let err = Value::Ref(sample_ref()).substitute(&|_| None).unwrap_err();
        assert!(matches!(err, ValueError::UnresolvedRef(_)));
    }

    #[test]
    fn accessors_match_their_variant() {
        let hash = sample_ref();
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::Int(3).as_float(), Some(3.0));
        assert_eq!(Value::Float(2.5).as_float(), Some(2.5));
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert_eq!(Value::bytes([1u8, 2]).as_bytes(), Some(&[1u8, 2][..]));
        assert_eq!(Value::Ref(hash).as_ref_hash(), Some(hash));
        assert_eq!(
            Value::Map(BTreeMap::new()).as_map(),
            Some(&BTreeMap::new())
        );
        assert_eq!(Value::Null.as_int(), None);
    }

    #[test]
    fn custom_values_carry_their_type_tag() {
        struct Basis(i64);

        impl ToValue for Basis {
            fn type_tag(&self) -> &'static str {
                "basis"
            }

            fn to_value(&self) -> Result<Value, ValueError> {
                Ok(Value::Int(self.0))
            }
        }

        let value = Value::custom(&Basis(7)).unwrap();
        assert_eq!(
            value,
            Value::Custom {
                tag: "basis".to_string(),
                inner: Box::new(Value::Int(7)),
            }
        );
    }

    #[test]
    fn json_round_trip() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"a": [1, 2.5, "x", null, true]}"#).unwrap();
        let value = Value::from_json(json.clone()).unwrap();
        assert_eq!(value.to_json().unwrap(), json);
    }

    #[test]
    fn json_rejects_out_of_range_integers() {
        let json = serde_json::json!(u64::MAX);
        assert!(matches!(
            Value::from_json(json),
            Err(ValueError::Unsupported(_))
        ));
    }
}
