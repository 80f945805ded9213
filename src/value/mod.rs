//! Dynamic document values, the self-describing payload codec, and the
//! order-preserving record-key codec.
//!
//! ## Value space
//!
//! Documents are string-keyed maps of [`Value`], a tagged variant covering
//! null, bool, 64-bit integers and floats, strings, raw bytes, lists, and
//! nested maps. The same codec carries both stored documents and request /
//! response payloads on the wire.
//!
//! ## Payload wire format
//!
//! Each value is a one-byte tag followed by its body:
//!
//! ```text
//! 0x00 Null
//! 0x01 Bool   [u8]
//! 0x02 Int    [i64 LE]
//! 0x03 Float  [f64 LE]
//! 0x04 Str    [u32 len][utf-8]
//! 0x05 Bytes  [u32 len][raw]
//! 0x06 List   [u32 count][value…]
//! 0x07 Map    [u32 count][(str key, value)…]
//! ```
//!
//! Encoding is deterministic for equal logical values: maps are ordered
//! containers, so equal maps encode to equal bytes. Decoding fails with
//! [`EncodingError`] on truncation or an unknown tag — there is no silent
//! coercion.
//!
//! ## Record keys
//!
//! A document's storage key is `(database, collection, _id)` flattened to a
//! single byte string `[db] 0x00 [collection] 0x00 [id]`. The NUL
//! separators sort below any permitted name byte, so byte-wise comparison
//! of record keys orders first by database, then collection, then
//! lexicographically by `_id` — which is what range queries rely on.
//! Database and collection names must not contain NUL (see [`valid_name`]).

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;

use crate::encoding::{self, Decode, Encode, EncodingError};

// ------------------------------------------------------------------------------------------------
// Value
// ------------------------------------------------------------------------------------------------

/// A dynamically-typed document value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent / null.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit IEEE-754 float.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Ordered list of values.
    List(Vec<Value>),
    /// String-keyed map of values.
    Map(BTreeMap<String, Value>),
}

/// A document: the top-level string-keyed map stored in a collection.
pub type Document = BTreeMap<String, Value>;

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_STR: u8 = 0x04;
const TAG_BYTES: u8 = 0x05;
const TAG_LIST: u8 = 0x06;
const TAG_MAP: u8 = 0x07;

impl Value {
    /// Human-readable type name, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Borrow as `&str` if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Read as `i64` if this is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Read as `f64` if this is numeric (int or float).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Read as `bool` if this is a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Borrow as a list if this is a list.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Borrow as a map if this is a map.
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Ordering used by query range operators (`$gt`, `$gte`, `$lt`, `$lte`).
    ///
    /// Ints and floats compare numerically across the two types; strings
    /// compare lexicographically; bools and bytes compare within their own
    /// type. Everything else — including any other cross-type pair — is
    /// unordered and yields `None`.
    pub fn compare(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                let a = self.as_f64()?;
                let b = other.as_f64()?;
                a.partial_cmp(&b)
            }
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Payload codec
// ------------------------------------------------------------------------------------------------

impl Encode for Value {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            Value::Null => TAG_NULL.encode_to(buf),
            Value::Bool(b) => {
                TAG_BOOL.encode_to(buf)?;
                b.encode_to(buf)
            }
            Value::Int(i) => {
                TAG_INT.encode_to(buf)?;
                i.encode_to(buf)
            }
            Value::Float(f) => {
                TAG_FLOAT.encode_to(buf)?;
                f.encode_to(buf)
            }
            Value::Str(s) => {
                TAG_STR.encode_to(buf)?;
                s.encode_to(buf)
            }
            Value::Bytes(b) => {
                TAG_BYTES.encode_to(buf)?;
                b.encode_to(buf)
            }
            Value::List(items) => {
                TAG_LIST.encode_to(buf)?;
                encoding::encode_vec(items, buf)
            }
            Value::Map(map) => {
                TAG_MAP.encode_to(buf)?;
                u32::try_from(map.len())
                    .map_err(|_| {
                        EncodingError::LengthOverflow("map entry count exceeds u32::MAX".into())
                    })?
                    .encode_to(buf)?;
                for (key, value) in map {
                    key.encode_to(buf)?;
                    value.encode_to(buf)?;
                }
                Ok(())
            }
        }
    }
}

impl Decode for Value {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u8::decode_from(buf)?;
        let value = match tag {
            TAG_NULL => Value::Null,
            TAG_BOOL => {
                let (b, n) = bool::decode_from(&buf[offset..])?;
                offset += n;
                Value::Bool(b)
            }
            TAG_INT => {
                let (i, n) = i64::decode_from(&buf[offset..])?;
                offset += n;
                Value::Int(i)
            }
            TAG_FLOAT => {
                let (f, n) = f64::decode_from(&buf[offset..])?;
                offset += n;
                Value::Float(f)
            }
            TAG_STR => {
                let (s, n) = String::decode_from(&buf[offset..])?;
                offset += n;
                Value::Str(s)
            }
            TAG_BYTES => {
                let (b, n) = Vec::<u8>::decode_from(&buf[offset..])?;
                offset += n;
                Value::Bytes(b)
            }
            TAG_LIST => {
                let (items, n) = encoding::decode_vec::<Value>(&buf[offset..])?;
                offset += n;
                Value::List(items)
            }
            TAG_MAP => {
                let (count, n) = u32::decode_from(&buf[offset..])?;
                offset += n;
                if count > encoding::MAX_VEC_ELEMENTS {
                    return Err(EncodingError::LengthOverflow(format!(
                        "map entry count {count} exceeds limit"
                    )));
                }
                let mut map = BTreeMap::new();
                for _ in 0..count {
                    let (key, n) = String::decode_from(&buf[offset..])?;
                    offset += n;
                    let (value, n) = Value::decode_from(&buf[offset..])?;
                    offset += n;
                    map.insert(key, value);
                }
                Value::Map(map)
            }
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: other as u32,
                    type_name: "Value",
                });
            }
        };
        Ok((value, offset))
    }
}

/// Pack a value into its self-describing byte form.
pub fn pack(value: &Value) -> Result<Vec<u8>, EncodingError> {
    encoding::encode_to_vec(value)
}

/// Unpack a value, requiring the buffer to contain exactly one value.
pub fn unpack(buf: &[u8]) -> Result<Value, EncodingError> {
    let (value, consumed) = Value::decode_from(buf)?;
    if consumed != buf.len() {
        return Err(EncodingError::LengthOverflow(format!(
            "{} trailing bytes after value",
            buf.len() - consumed
        )));
    }
    Ok(value)
}

/// Pack a document (a top-level map).
pub fn pack_document(doc: &Document) -> Result<Vec<u8>, EncodingError> {
    pack(&Value::Map(doc.clone()))
}

/// Unpack a buffer that must contain a top-level map.
pub fn unpack_document(buf: &[u8]) -> Result<Document, EncodingError> {
    match unpack(buf)? {
        Value::Map(map) => Ok(map),
        other => Err(EncodingError::InvalidTag {
            tag: u32::from(tag_of(&other)),
            type_name: "Document (expected map)",
        }),
    }
}

fn tag_of(value: &Value) -> u8 {
    match value {
        Value::Null => TAG_NULL,
        Value::Bool(_) => TAG_BOOL,
        Value::Int(_) => TAG_INT,
        Value::Float(_) => TAG_FLOAT,
        Value::Str(_) => TAG_STR,
        Value::Bytes(_) => TAG_BYTES,
        Value::List(_) => TAG_LIST,
        Value::Map(_) => TAG_MAP,
    }
}

// ------------------------------------------------------------------------------------------------
// Record keys
// ------------------------------------------------------------------------------------------------

/// Separator between record-key components. Sorts below every byte allowed
/// in a name, preserving lexicographic order on `_id` within a collection.
const KEY_SEPARATOR: u8 = 0x00;

/// True when `name` is usable as a database or collection name: non-empty
/// and free of NUL bytes.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.bytes().any(|b| b == KEY_SEPARATOR)
}

/// Flatten `(database, collection, _id)` into a single ordered byte key.
pub fn record_key(database: &str, collection: &str, id: &str) -> Vec<u8> {
    let mut key =
        Vec::with_capacity(database.len() + collection.len() + id.len() + 2);
    key.extend_from_slice(database.as_bytes());
    key.push(KEY_SEPARATOR);
    key.extend_from_slice(collection.as_bytes());
    key.push(KEY_SEPARATOR);
    key.extend_from_slice(id.as_bytes());
    key
}

/// The inclusive lower bound of a collection's key range.
pub fn collection_prefix(database: &str, collection: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(database.len() + collection.len() + 2);
    prefix.extend_from_slice(database.as_bytes());
    prefix.push(KEY_SEPARATOR);
    prefix.extend_from_slice(collection.as_bytes());
    prefix.push(KEY_SEPARATOR);
    prefix
}

/// The exclusive upper bound of a collection's key range.
pub fn collection_end(database: &str, collection: &str) -> Vec<u8> {
    let mut end = collection_prefix(database, collection);
    // The prefix ends in the separator; bumping it bounds every id above.
    let last = end.len() - 1;
    end[last] = KEY_SEPARATOR + 1;
    end
}

/// Split a record key back into `(database, collection, _id)`.
///
/// Returns `None` when the key is not in record-key form or a component is
/// not valid UTF-8.
pub fn split_record_key(key: &[u8]) -> Option<(&str, &str, &str)> {
    let first = key.iter().position(|&b| b == KEY_SEPARATOR)?;
    let rest = &key[first + 1..];
    let second = rest.iter().position(|&b| b == KEY_SEPARATOR)?;

    let database = std::str::from_utf8(&key[..first]).ok()?;
    let collection = std::str::from_utf8(&rest[..second]).ok()?;
    let id = std::str::from_utf8(&rest[second + 1..]).ok()?;
    Some((database, collection, id))
}
