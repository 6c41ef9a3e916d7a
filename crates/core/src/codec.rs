//! Value codec: native [`Value`]s to stored `(text, tag)` pairs and back.
//!
//! Primitives keep their plain textual form. Compounds go through the
//! tuple-safe interchange encoder. Anything without an interchange form can
//! only be stored as an opaque CBOR blob, and only when the store was opened
//! with opaque serialization enabled; the flag is checked again on every
//! read because rows outlive the configuration that wrote them.

use crate::interchange::InterchangeCache;
use crate::value::Value;
use crate::{Result, RevgraphError};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Type tag stored beside every value row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tag {
    Bool,
    Int,
    Float,
    Text,
    Structured,
    Blob,
    /// Tombstone: the key was deleted as of this row.
    Unset,
}

impl Tag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::Bool => "bool",
            Tag::Int => "int",
            Tag::Float => "float",
            Tag::Text => "text",
            Tag::Structured => "structured",
            Tag::Blob => "blob",
            Tag::Unset => "unset",
        }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The stored representation of one value row.
///
/// `value` is `None` only for tombstones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredValue {
    pub value: Option<String>,
    pub tag: Tag,
}

impl StoredValue {
    /// The tombstone row written by deletes.
    pub fn tombstone() -> Self {
        Self {
            value: None,
            tag: Tag::Unset,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.tag == Tag::Unset
    }

    fn new(text: String, tag: Tag) -> Self {
        Self {
            value: Some(text),
            tag,
        }
    }
}

/// Encoder/decoder bound to one store's opaque-serialization capability.
#[derive(Debug)]
pub struct ValueCodec {
    interchange: InterchangeCache,
    opaque: bool,
}

impl ValueCodec {
    pub fn new(interchange: InterchangeCache, opaque: bool) -> Self {
        Self {
            interchange,
            opaque,
        }
    }

    /// Whether `blob` rows may be written and read.
    pub fn opaque_enabled(&self) -> bool {
        self.opaque
    }

    /// Encode a value for storage.
    ///
    /// # Errors
    ///
    /// [`RevgraphError::NotSerializable`] when the value has no interchange
    /// form and opaque serialization is disabled.
    pub fn encode(&self, value: &Value) -> Result<StoredValue> {
        let stored = match value {
            Value::Bool(b) => StoredValue::new(b.to_string(), Tag::Bool),
            Value::Int(n) => StoredValue::new(n.to_string(), Tag::Int),
            Value::Float(f) => StoredValue::new(f.to_string(), Tag::Float),
            Value::Text(s) => StoredValue::new(s.clone(), Tag::Text),
            compound => match self.interchange.encode(compound) {
                Ok(text) => StoredValue::new(text, Tag::Structured),
                Err(RevgraphError::NotSerializable(reason)) => {
                    if !self.opaque {
                        return Err(RevgraphError::NotSerializable(reason));
                    }
                    warn!(kind = compound.kind(), %reason, "falling back to opaque serialization");
                    StoredValue::new(encode_blob(compound)?, Tag::Blob)
                }
                Err(e) => return Err(e),
            },
        };
        Ok(stored)
    }

    /// Decode a stored row. Tombstones decode to `None`.
    ///
    /// # Errors
    ///
    /// [`RevgraphError::SerializationDisabled`] for a `blob` row when opaque
    /// serialization is disabled; [`RevgraphError::MalformedEncoding`] when
    /// the text does not parse under its tag.
    pub fn decode(&self, stored: &StoredValue) -> Result<Option<Value>> {
        if stored.tag == Tag::Unset {
            return Ok(None);
        }
        let text = stored.value.as_deref().ok_or_else(|| {
            RevgraphError::MalformedEncoding(format!("{} row without a value", stored.tag))
        })?;
        let value = match stored.tag {
            Tag::Bool => Value::Bool(parse(text, stored.tag)?),
            Tag::Int => Value::Int(parse(text, stored.tag)?),
            Tag::Float => Value::Float(parse(text, stored.tag)?),
            Tag::Text => Value::Text(text.to_string()),
            Tag::Structured => self.interchange.decode(text)?,
            Tag::Blob => {
                if !self.opaque {
                    return Err(RevgraphError::SerializationDisabled);
                }
                decode_blob(text)?
            }
            Tag::Unset => return Ok(None),
        };
        Ok(Some(value))
    }
}

fn parse<T: std::str::FromStr>(text: &str, tag: Tag) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    text.parse()
        .map_err(|e| RevgraphError::MalformedEncoding(format!("{tag} row {text:?}: {e}")))
}

/// Deepest container nesting accepted as an opaque blob.
const MAX_BLOB_DEPTH: usize = 160;

/// CBOR nesting allowed on read: each value level is an adjacently tagged
/// map around its content.
const BLOB_RECURSION_LIMIT: usize = 2 * MAX_BLOB_DEPTH + 8;

fn encode_blob(value: &Value) -> Result<String> {
    if value.depth() > MAX_BLOB_DEPTH {
        return Err(RevgraphError::NotSerializable(format!(
            "containers nested deeper than {MAX_BLOB_DEPTH} levels"
        )));
    }
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| RevgraphError::NotSerializable(e.to_string()))?;
    Ok(hex::encode(buf))
}

fn decode_blob(text: &str) -> Result<Value> {
    let bytes = hex::decode(text)
        .map_err(|e| RevgraphError::MalformedEncoding(format!("blob row: {e}")))?;
    ciborium::de::from_reader_with_recursion_limit(bytes.as_slice(), BLOB_RECURSION_LIMIT)
        .map_err(|e| RevgraphError::MalformedEncoding(format!("blob row: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn codec(opaque: bool) -> ValueCodec {
        ValueCodec::new(InterchangeCache::new(), opaque)
    }

    fn round_trip(c: &ValueCodec, v: Value) {
        let stored = c.encode(&v).unwrap();
        assert_eq!(c.decode(&stored).unwrap(), Some(v));
    }

    #[test]
    fn primitives_use_plain_text() {
        let c = codec(false);
        assert_eq!(
            c.encode(&Value::Int(42)).unwrap(),
            StoredValue::new("42".into(), Tag::Int)
        );
        assert_eq!(
            c.encode(&Value::Bool(true)).unwrap(),
            StoredValue::new("true".into(), Tag::Bool)
        );
        assert_eq!(
            c.encode(&Value::from("red")).unwrap(),
            StoredValue::new("red".into(), Tag::Text)
        );
        round_trip(&c, Value::Float(0.1));
        round_trip(&c, Value::Float(-0.0));
        round_trip(&c, Value::Float(f64::NAN));
        round_trip(&c, Value::Float(f64::NEG_INFINITY));
    }

    #[test]
    fn compounds_are_structured() {
        let c = codec(false);
        let mut map = BTreeMap::new();
        map.insert(Value::from("xs"), Value::List(vec![Value::Int(1)]));
        let v = Value::Map(map);
        let stored = c.encode(&v).unwrap();
        assert_eq!(stored.tag, Tag::Structured);
        round_trip(&c, v);
        round_trip(&c, Value::Null);
    }

    #[test]
    fn structurally_equal_values_encode_identically() {
        let c = codec(false);
        let mut a = BTreeMap::new();
        a.insert(Value::from("b"), Value::Int(2));
        a.insert(Value::from("a"), Value::Int(1));
        let mut b = BTreeMap::new();
        b.insert(Value::from("a"), Value::Int(1));
        b.insert(Value::from("b"), Value::Int(2));
        assert_eq!(
            c.encode(&Value::Map(a)).unwrap(),
            c.encode(&Value::Map(b)).unwrap()
        );
    }

    #[test]
    fn tombstone_decodes_to_no_value() {
        let c = codec(false);
        assert_eq!(c.decode(&StoredValue::tombstone()).unwrap(), None);
    }

    #[test]
    fn bytes_need_opaque_serialization() {
        let v = Value::Bytes(vec![0xde, 0xad]);
        let err = codec(false).encode(&v).unwrap_err();
        assert!(matches!(err, RevgraphError::NotSerializable(_)));

        let c = codec(true);
        let stored = c.encode(&v).unwrap();
        assert_eq!(stored.tag, Tag::Blob);
        round_trip(&c, v);
        round_trip(&c, Value::List(vec![Value::Float(f64::INFINITY)]));
    }

    #[test]
    fn blob_rows_are_refused_when_opaque_is_off() {
        let stored = codec(true).encode(&Value::Bytes(vec![1, 2, 3])).unwrap();
        let err = codec(false).decode(&stored).unwrap_err();
        assert!(matches!(err, RevgraphError::SerializationDisabled));
    }

    fn nested_lists(levels: usize) -> Value {
        let mut v = Value::Int(0);
        for _ in 0..levels {
            v = Value::List(vec![v]);
        }
        v
    }

    #[test]
    fn over_deep_values_are_never_stored_unreadable() {
        let deep = nested_lists(130);
        assert!(matches!(
            codec(false).encode(&deep).unwrap_err(),
            RevgraphError::NotSerializable(_)
        ));

        let stored = codec(true).encode(&deep).unwrap();
        assert_eq!(stored.tag, Tag::Blob);
        // A fresh codec reads it back without any cached text.
        assert_eq!(codec(true).decode(&stored).unwrap(), Some(deep));

        assert!(matches!(
            codec(true).encode(&nested_lists(MAX_BLOB_DEPTH + 1)).unwrap_err(),
            RevgraphError::NotSerializable(_)
        ));
    }

    #[test]
    fn mistagged_text_is_malformed() {
        let c = codec(false);
        let bad = StoredValue::new("seven".into(), Tag::Int);
        assert!(matches!(
            c.decode(&bad).unwrap_err(),
            RevgraphError::MalformedEncoding(_)
        ));
        let missing = StoredValue {
            value: None,
            tag: Tag::Text,
        };
        assert!(matches!(
            c.decode(&missing).unwrap_err(),
            RevgraphError::MalformedEncoding(_)
        ));
    }
}
