//! Versioned binary encoding for cache blobs.
//!
//! Results and input composites are stored as CBOR: self-describing,
//! byte-stable, and able to carry raw bytes and tagged structure. Embedded
//! future references and user type tags travel as CBOR tags so the composite
//! shape survives a round trip through the store.

use ciborium::value::Value as Cbor;

use crate::error::CodecError;
use crate::hash::Hash;
use crate::value::Value;

const FORMAT_VERSION: u64 = 1;

/// Private CBOR tag carrying an embedded future fingerprint.
const TAG_FUTURE_REF: u64 = 0x4d47;
/// Private CBOR tag carrying a user type tag plus canonical form.
const TAG_CUSTOM: u64 = 0x4d48;

pub(crate) fn encode(value: &Value) -> Result<Vec<u8>, CodecError> {
    let envelope = Cbor::Array(vec![
        Cbor::Integer(FORMAT_VERSION.into()),
        to_cbor(value),
    ]);
    let mut buf = Vec::new();
    ciborium::ser::into_writer(&envelope, &mut buf)
        .map_err(|err| CodecError::Encode(err.to_string()))?;
    Ok(buf)
}

pub(crate) fn decode(bytes: &[u8]) -> Result<Value, CodecError> {
    let envelope: Cbor = ciborium::de::from_reader(bytes)
        .map_err(|err| CodecError::Decode(err.to_string()))?;

    let items = match envelope {
        Cbor::Array(items) if items.len() == 2 => items,
        _ => return Err(CodecError::Decode("missing envelope".to_string())),
    };
    let mut items = items.into_iter();

    let version = match items.next() {
        Some(Cbor::Integer(v)) => u64::try_from(i128::from(v))
            .map_err(|_| CodecError::Decode("negative version".to_string()))?,
        _ => return Err(CodecError::Decode("missing version".to_string())),
    };
    if version != FORMAT_VERSION {
        return Err(CodecError::Version(version));
    }

    from_cbor(items.next().expect("length checked above"))
}

fn to_cbor(value: &Value) -> Cbor {
    match value {
        Value::Null => Cbor::Null,
        Value::Bool(b) => Cbor::Bool(*b),
        Value::Int(i) => Cbor::Integer((*i).into()),
        Value::Float(f) => Cbor::Float(*f),
        Value::Str(s) => Cbor::Text(s.clone()),
        Value::Bytes(b) => Cbor::Bytes(b.clone()),
        Value::Seq(items) => Cbor::Array(items.iter().map(to_cbor).collect()),
        Value::Map(map) => Cbor::Map(
            map.iter()
                .map(|(k, v)| (Cbor::Text(k.clone()), to_cbor(v)))
                .collect(),
        ),
        Value::Ref(hash) => Cbor::Tag(
            TAG_FUTURE_REF,
            Box::new(Cbor::Bytes(hash.as_bytes().to_vec())),
        ),
        Value::Custom { tag, inner } => Cbor::Tag(
            TAG_CUSTOM,
            Box::new(Cbor::Array(vec![Cbor::Text(tag.clone()), to_cbor(inner)])),
        ),
    }
}

fn from_cbor(cbor: Cbor) -> Result<Value, CodecError> {
    Ok(match cbor {
        Cbor::Null => Value::Null,
        Cbor::Bool(b) => Value::Bool(b),
        Cbor::Integer(i) => Value::Int(
            i64::try_from(i128::from(i))
                .map_err(|_| CodecError::Decode("integer out of range".to_string()))?,
        ),
        Cbor::Float(f) => Value::Float(f),
        Cbor::Text(s) => Value::Str(s),
        Cbor::Bytes(b) => Value::Bytes(b),
        Cbor::Array(items) => Value::Seq(
            items
                .into_iter()
                .map(from_cbor)
                .collect::<Result<_, _>>()?,
        ),
        Cbor::Map(entries) => {
            let mut map = std::collections::BTreeMap::new();
            for (key, item) in entries {
                let key = match key {
                    Cbor::Text(s) => s,
                    _ => {
                        return Err(CodecError::Decode(
                            "non-text map key".to_string(),
                        ))
                    }
                };
                map.insert(key, from_cbor(item)?);
            }
            Value::Map(map)
        }
        Cbor::Tag(TAG_FUTURE_REF, inner) => match *inner {
            Cbor::Bytes(bytes) => {
                let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
                    CodecError::Decode("fingerprint is not 32 bytes".to_string())
                })?;
                Value::Ref(Hash::from_bytes(bytes))
            }
            _ => return Err(CodecError::Decode("malformed future ref".to_string())),
        },
        Cbor::Tag(TAG_CUSTOM, inner) => match *inner {
            Cbor::Array(items) if items.len() == 2 => {
                let mut items = items.into_iter();
                let tag = match items.next() {
                    Some(Cbor::Text(tag)) => tag,
                    _ => {
                        return Err(CodecError::Decode(
                            "malformed type tag".to_string(),
                        ))
                    }
                };
                Value::Custom {
                    tag,
                    inner: Box::new(from_cbor(
                        items.next().expect("length checked above"),
                    )?),
                }
            }
            _ => return Err(CodecError::Decode("malformed tagged value".to_string())),
        },
        other => {
            return Err(CodecError::Decode(format!(
                "unsupported CBOR item: {other:?}"
            )))
        }
    })
}
