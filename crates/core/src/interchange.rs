//! Tuple-safe JSON interchange.
//!
//! Plain JSON cannot tell a growable list from a fixed-arity tuple, and only
//! allows text map keys. Every sequence is therefore written with a leading
//! marker element:
//!
//! ```text
//! List([1, 2])          -> ["list",1,2]
//! Tuple([1, List([])])  -> ["tuple",1,["list"]]
//! ```
//!
//! Map keys are written verbatim when they are text that does not itself
//! parse as JSON; any other key (including text that would parse as JSON) is
//! written as the compact JSON of its tuple-safe encoding. Decoding parses a
//! key as JSON when it can and takes it verbatim otherwise.
//!
//! An [`InterchangeCache`] memoises both directions keyed by the literal
//! form. It only grows: entries are never evicted, and an optional admission
//! limit merely stops new entries from being cached.

use crate::value::Value;
use crate::{Result, RevgraphError};
use serde_json::{Map as JsonMap, Number, Value as Json};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

const LIST_MARKER: &str = "list";
const TUPLE_MARKER: &str = "tuple";

/// Deepest container nesting written as JSON. Kept below serde_json's
/// parser recursion limit (128) so every encoded text can be read back.
pub const MAX_DEPTH: usize = 100;

/// Encode a value to its tuple-safe JSON text, bypassing any cache.
///
/// # Errors
///
/// [`RevgraphError::NotSerializable`] for raw bytes, non-finite floats, and
/// containers nested deeper than [`MAX_DEPTH`].
pub fn to_text(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(&to_json(value, 0)?)?)
}

/// Decode tuple-safe JSON text, bypassing any cache.
pub fn from_text(text: &str) -> Result<Value> {
    let json: Json = serde_json::from_str(text)
        .map_err(|e| RevgraphError::MalformedEncoding(format!("invalid JSON {text:?}: {e}")))?;
    from_json(json)
}

fn to_json(value: &Value, depth: usize) -> Result<Json> {
    let nests = matches!(value, Value::List(_) | Value::Tuple(_) | Value::Map(_));
    if nests && depth >= MAX_DEPTH {
        return Err(RevgraphError::NotSerializable(format!(
            "containers nested deeper than {MAX_DEPTH} levels"
        )));
    }
    Ok(match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(n) => Json::Number(Number::from(*n)),
        Value::Float(f) => Json::Number(Number::from_f64(*f).ok_or_else(|| {
            RevgraphError::NotSerializable(format!("non-finite float {f} has no JSON form"))
        })?),
        Value::Text(s) => Json::String(s.clone()),
        Value::Bytes(_) => {
            return Err(RevgraphError::NotSerializable(
                "raw bytes have no JSON form".to_string(),
            ))
        }
        Value::List(items) => marked(LIST_MARKER, items, depth)?,
        Value::Tuple(items) => marked(TUPLE_MARKER, items, depth)?,
        Value::Map(map) => {
            let mut out = JsonMap::new();
            for (k, v) in map {
                out.insert(key_to_text(k)?, to_json(v, depth + 1)?);
            }
            Json::Object(out)
        }
    })
}

fn marked(marker: &str, items: &[Value], depth: usize) -> Result<Json> {
    let mut out = Vec::with_capacity(items.len() + 1);
    out.push(Json::String(marker.to_string()));
    for item in items {
        out.push(to_json(item, depth + 1)?);
    }
    Ok(Json::Array(out))
}

fn key_to_text(key: &Value) -> Result<String> {
    match key {
        Value::Text(s) if serde_json::from_str::<Json>(s).is_err() => Ok(s.clone()),
        other => to_text(other),
    }
}

fn key_from_text(text: &str) -> Result<Value> {
    match serde_json::from_str::<Json>(text) {
        Ok(json) => from_json(json),
        Err(_) => Ok(Value::Text(text.to_string())),
    }
}

fn from_json(json: Json) -> Result<Value> {
    Ok(match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().ok_or_else(|| {
                RevgraphError::MalformedEncoding(format!("unrepresentable number {n}"))
            })?),
        },
        Json::String(s) => Value::Text(s),
        Json::Array(items) => {
            let mut items = items.into_iter();
            let marker = match items.next() {
                Some(Json::String(m)) => m,
                Some(other) => {
                    return Err(RevgraphError::MalformedEncoding(format!(
                        "sequence marker must be \"list\" or \"tuple\", got {other}"
                    )))
                }
                None => {
                    return Err(RevgraphError::MalformedEncoding(
                        "empty array has no sequence marker".to_string(),
                    ))
                }
            };
            let decoded = items.map(from_json).collect::<Result<Vec<_>>>()?;
            match marker.as_str() {
                LIST_MARKER => Value::List(decoded),
                TUPLE_MARKER => Value::Tuple(decoded),
                _ => {
                    return Err(RevgraphError::MalformedEncoding(format!(
                        "unknown sequence marker {marker:?}"
                    )))
                }
            }
        }
        Json::Object(obj) => {
            let mut map = BTreeMap::new();
            for (k, v) in obj {
                map.insert(key_from_text(&k)?, from_json(v)?);
            }
            Value::Map(map)
        }
    })
}

/// Bidirectional memo of tuple-safe encodings.
///
/// Safe for concurrent readers; writers take a short exclusive lock on a
/// miss. Grows for the lifetime of its owner unless `limit` is set, in which
/// case entries past the limit are computed but not retained.
#[derive(Debug, Default)]
pub struct InterchangeCache {
    encoded: RwLock<HashMap<Value, String>>,
    decoded: RwLock<HashMap<String, Value>>,
    limit: Option<usize>,
}

impl InterchangeCache {
    /// An unbounded cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache that stops admitting entries once `limit` texts are held.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Encode `value`, consulting and filling the cache.
    pub fn encode(&self, value: &Value) -> Result<String> {
        if let Some(hit) = self.read_encoded()?.get(value) {
            return Ok(hit.clone());
        }
        let text = to_text(value)?;
        self.remember(&text, value)?;
        Ok(text)
    }

    /// Decode `text`, consulting and filling the cache.
    pub fn decode(&self, text: &str) -> Result<Value> {
        if let Some(hit) = self.read_decoded()?.get(text) {
            return Ok(hit.clone());
        }
        let value = from_text(text)?;
        self.remember(text, &value)?;
        Ok(value)
    }

    /// Number of distinct literal texts held.
    pub fn len(&self) -> usize {
        self.decoded.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remember(&self, text: &str, value: &Value) -> Result<()> {
        let mut decoded = self
            .decoded
            .write()
            .map_err(|_| RevgraphError::Internal("interchange cache lock poisoned".into()))?;
        if self.limit.is_some_and(|l| decoded.len() >= l) && !decoded.contains_key(text) {
            return Ok(());
        }
        decoded.insert(text.to_string(), value.clone());
        drop(decoded);
        self.encoded
            .write()
            .map_err(|_| RevgraphError::Internal("interchange cache lock poisoned".into()))?
            .insert(value.clone(), text.to_string());
        Ok(())
    }

    fn read_encoded(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<Value, String>>> {
        self.encoded
            .read()
            .map_err(|_| RevgraphError::Internal("interchange cache lock poisoned".into()))
    }

    fn read_decoded(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Value>>> {
        self.decoded
            .read()
            .map_err(|_| RevgraphError::Internal("interchange cache lock poisoned".into()))
    }
}
