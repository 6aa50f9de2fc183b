//! Canonical serialisation and content fingerprints.
//!
//! The canonical form of a structural node embeds the *fingerprints* of its
//! children rather than their serialised values. This makes the hash of a
//! composite independent of whether its embedded futures have resolved,
//! which is what allows a task fingerprint to be computed before any of its
//! dependencies have run.

use crate::hash::Hash;
use crate::value::Value;

/// Compute the stable content hash of a value's canonical form.
///
/// Equal canonical forms hash equal in every process.
pub fn fingerprint(value: &Value) -> Hash {
    Hash::digest(canonical_bytes(value))
}

/// Fingerprint of a rule invocation: rule identity plus input fingerprint.
pub(crate) fn task_fingerprint(rule_id: &str, input: &Hash) -> Hash {
    let mut buf = Vec::with_capacity(rule_id.len() + 40);
    buf.extend_from_slice(b"task\x00");
    write_len(&mut buf, rule_id.len());
    buf.extend_from_slice(rule_id.as_bytes());
    buf.extend_from_slice(input.as_bytes());
    Hash::digest(buf)
}

pub(crate) fn canonical_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

fn write_len(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(&(len as u64).to_le_bytes());
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(b'n'),
        Value::Bool(b) => {
            out.push(b'b');
            out.push(u8::from(*b));
        }
        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b';');
        }
        Value::Float(f) => {
            out.push(b'f');
            out.extend_from_slice(canonical_float(*f).as_bytes());
            out.push(b';');
        }
        Value::Str(s) => {
            out.push(b's');
            write_len(out, s.len());
            out.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(bytes) => {
            out.push(b'y');
            write_len(out, bytes.len());
            out.extend_from_slice(bytes);
        }
        Value::Seq(items) => {
            out.push(b'l');
            write_len(out, items.len());
            for item in items {
                out.extend_from_slice(fingerprint(item).as_bytes());
            }
        }
        Value::Map(map) => {
            // BTreeMap iterates keys in byte order already.
            out.push(b'm');
            write_len(out, map.len());
            for (key, item) in map {
                write_len(out, key.len());
                out.extend_from_slice(key.as_bytes());
                out.extend_from_slice(fingerprint(item).as_bytes());
            }
        }
        Value::Ref(hash) => {
            out.push(b'r');
            out.extend_from_slice(hash.as_bytes());
        }
        Value::Custom { tag, inner } => {
            out.push(b't');
            write_len(out, tag.len());
            out.extend_from_slice(tag.as_bytes());
            out.extend_from_slice(fingerprint(inner).as_bytes());
        }
    }
}

/// Shortest round-trip decimal, with `-0.0` normalised to `0.0` and
/// `nan`/`inf` spelled out.
fn canonical_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let f = if f == 0.0 { 0.0 } else { f };
    format!("{f}")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn scalars_fingerprint_deterministically() {
        assert_eq!(fingerprint(&Value::Int(7)), fingerprint(&Value::Int(7)));
        assert_ne!(fingerprint(&Value::Int(7)), fingerprint(&Value::Int(8)));
        assert_ne!(
            fingerprint(&Value::Int(1)),
            fingerprint(&Value::Float(1.0)),
        );
        assert_ne!(
            fingerprint(&Value::Str("1".into())),
            fingerprint(&Value::Int(1)),
        );
    }

    #[test]
    fn negative_zero_is_normalised() {
        assert_eq!(
            fingerprint(&Value::Float(-0.0)),
            fingerprint(&Value::Float(0.0)),
        );
    }

    #[test]
    fn non_finite_floats_are_spelled_out() {
        assert_eq!(canonical_float(f64::NAN), "nan");
        assert_eq!(canonical_float(f64::INFINITY), "inf");
        assert_eq!(canonical_float(f64::NEG_INFINITY), "-inf");
        assert_eq!(
            fingerprint(&Value::Float(f64::NAN)),
            fingerprint(&Value::Float(f64::NAN)),
        );
    }

    #[test]
    fn empty_composites_are_stable_and_distinct() {
        assert_eq!(
            fingerprint(&Value::Seq(vec![])),
            fingerprint(&Value::Seq(vec![])),
        );
        assert_ne!(
            fingerprint(&Value::Seq(vec![])),
            fingerprint(&Value::Map(BTreeMap::new())),
        );
    }

    #[test]
    fn composite_hash_embeds_child_fingerprints() {
        let child = Value::seq([Value::Int(1), Value::Int(2)]);
        let parent = Value::seq([child.clone()]);

        let mut expected = vec![b'l'];
        expected.extend_from_slice(&1u64.to_le_bytes());
        expected.extend_from_slice(fingerprint(&child).as_bytes());
        assert_eq!(canonical_bytes(&parent), expected);
    }

    #[test]
    fn ref_contributes_its_fingerprint_not_a_value() {
        let hash = fingerprint(&Value::Int(5));
        assert_ne!(
            fingerprint(&Value::Ref(hash)),
            fingerprint(&Value::Int(5)),
        );
        assert_eq!(
            fingerprint(&Value::seq([Value::Ref(hash)])),
            fingerprint(&Value::seq([Value::Ref(hash)])),
        );
    }

    #[test]
    fn custom_tag_separates_identical_structures() {
        let inner = Value::seq([Value::Int(1)]);
        let a = Value::Custom {
            tag: "geometry".into(),
            inner: Box::new(inner.clone()),
        };
        let b = Value::Custom {
            tag: "basis".into(),
            inner: Box::new(inner),
        };
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn task_fingerprints_are_keyed_by_rule_identity() {
        let input = fingerprint(&Value::seq([Value::Int(3)]));
        assert_eq!(
            task_fingerprint("fib@v0", &input),
            task_fingerprint("fib@v0", &input),
        );
        assert_ne!(
            task_fingerprint("fib@v0", &input),
            task_fingerprint("fib@v1", &input),
        );
    }

    #[test]
    fn substituted_done_futures_match_plain_data() {
        // A composite over resolved futures substitutes to a value whose
        // canonical form equals that of the directly constructed data.
        let result = Value::Int(42);
        let hash = fingerprint(&result);
        let composite = Value::seq([Value::Ref(hash), Value::Int(1)]);
        let substituted = composite
            .substitute(&|h| (*h == hash).then(|| result.clone()))
            .unwrap();
        let direct = Value::seq([Value::Int(42), Value::Int(1)]);
        assert_eq!(canonical_bytes(&substituted), canonical_bytes(&direct));
    }
}
