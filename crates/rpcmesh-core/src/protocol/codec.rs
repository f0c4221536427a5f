//! Canonical binary form for [`Value`] (panic-free).
//!
//! Layout: `[tag: u8][body]`, all integers little-endian.
//! - scalars carry a fixed-width body
//! - strings and blobs carry `[len: u32][data]`
//! - lists carry `[count: u32]` followed by `count` values
//! - maps carry `[count: u32]` followed by `count` `[key][value]` pairs, keys
//!   in ascending order so equal values always encode to equal bytes
//!
//! Parsing rules:
//! - Never index into the buffer; check `remaining()` before every read.
//! - Nesting is bounded by [`MAX_DEPTH`].
//! - Trailing bytes after the top-level value are rejected.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, RpcError};
use crate::protocol::value::{Timestamp, Value};

/// Maximum nesting of lists/maps, enforced identically by encoder and decoder.
pub const MAX_DEPTH: usize = 64;

const TAG_ABSENT: u8 = 0x00;
const TAG_NULL: u8 = 0x01;
const TAG_FALSE: u8 = 0x02;
const TAG_TRUE: u8 = 0x03;
const TAG_INT: u8 = 0x04;
const TAG_FLOAT: u8 = 0x05;
const TAG_STR: u8 = 0x06;
const TAG_BYTES: u8 = 0x07;
const TAG_TIMESTAMP: u8 = 0x08;
const TAG_LIST: u8 = 0x09;
const TAG_MAP: u8 = 0x0A;

/// Encode a value to its canonical bytes.
pub fn encode_value(v: &Value) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(64);
    encode_into(v, &mut buf)?;
    Ok(buf.freeze())
}

/// Append a value's canonical bytes to `buf`.
pub fn encode_into(v: &Value, buf: &mut BytesMut) -> Result<()> {
    encode_at(v, buf, 0)
}

fn encode_at(v: &Value, buf: &mut BytesMut, depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(RpcError::Codec("value nested too deeply".into()));
    }
    match v {
        Value::Absent => buf.put_u8(TAG_ABSENT),
        Value::Null => buf.put_u8(TAG_NULL),
        Value::Bool(false) => buf.put_u8(TAG_FALSE),
        Value::Bool(true) => buf.put_u8(TAG_TRUE),
        Value::Int(i) => {
            buf.put_u8(TAG_INT);
            buf.put_i64_le(*i);
        }
        Value::Float(f) => {
            buf.put_u8(TAG_FLOAT);
            buf.put_u64_le(f.to_bits());
        }
        Value::Str(s) => {
            buf.put_u8(TAG_STR);
            put_str(buf, s)?;
        }
        Value::Bytes(b) => {
            buf.put_u8(TAG_BYTES);
            put_blob(buf, b)?;
        }
        Value::Timestamp(t) => {
            buf.put_u8(TAG_TIMESTAMP);
            buf.put_i64_le(t.secs());
            buf.put_u32_le(t.nanos());
        }
        Value::List(items) => {
            buf.put_u8(TAG_LIST);
            put_len(buf, items.len())?;
            for item in items {
                encode_at(item, buf, depth + 1)?;
            }
        }
        Value::Map(entries) => {
            buf.put_u8(TAG_MAP);
            put_len(buf, entries.len())?;
            for (k, item) in entries {
                put_str(buf, k)?;
                encode_at(item, buf, depth + 1)?;
            }
        }
    }
    Ok(())
}

/// Decode exactly one value; trailing bytes are an error.
pub fn decode_value(mut buf: Bytes) -> Result<Value> {
    let v = decode_from(&mut buf)?;
    if buf.has_remaining() {
        return Err(RpcError::Codec(format!(
            "{} trailing bytes after value",
            buf.remaining()
        ).into()));
    }
    Ok(v)
}

/// Decode one value from the front of `buf`, leaving the rest.
pub fn decode_from(buf: &mut Bytes) -> Result<Value> {
    decode_at(buf, 0)
}

fn decode_at(buf: &mut Bytes, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(RpcError::Codec("value nested too deeply".into()));
    }
    let tag = get_u8(buf, "value tag")?;
    let v = match tag {
        TAG_ABSENT => Value::Absent,
        TAG_NULL => Value::Null,
        TAG_FALSE => Value::Bool(false),
        TAG_TRUE => Value::Bool(true),
        TAG_INT => {
            need(buf, 8, "int")?;
            Value::Int(buf.get_i64_le())
        }
        TAG_FLOAT => {
            need(buf, 8, "float")?;
            Value::Float(f64::from_bits(buf.get_u64_le()))
        }
        TAG_STR => Value::Str(get_str(buf)?),
        TAG_BYTES => Value::Bytes(get_blob(buf)?),
        TAG_TIMESTAMP => {
            need(buf, 12, "timestamp")?;
            let secs = buf.get_i64_le();
            let nanos = buf.get_u32_le();
            Value::Timestamp(Timestamp::new(secs, nanos)?)
        }
        TAG_LIST => {
            let count = get_count(buf)?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_at(buf, depth + 1)?);
            }
            Value::List(items)
        }
        TAG_MAP => {
            let count = get_count(buf)?;
            let mut entries = BTreeMap::new();
            for _ in 0..count {
                let key = get_str(buf)?;
                let item = decode_at(buf, depth + 1)?;
                if entries.insert(key, item).is_some() {
                    return Err(RpcError::Codec("duplicate map key".into()));
                }
            }
            Value::Map(entries)
        }
        other => return Err(RpcError::Codec(format!("unknown value tag: {other:#04x}").into())),
    };
    Ok(v)
}

// ---- primitives shared with the frame codec ----

pub(crate) fn need(buf: &Bytes, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(RpcError::Codec(format!("truncated {what}").into()));
    }
    Ok(())
}

pub(crate) fn put_len(buf: &mut BytesMut, len: usize) -> Result<()> {
    let len = u32::try_from(len).map_err(|_| RpcError::Codec(format!("length {len} exceeds u32").into()))?;
    buf.put_u32_le(len);
    Ok(())
}

pub(crate) fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    put_blob(buf, s.as_bytes())
}

pub(crate) fn put_blob(buf: &mut BytesMut, b: &[u8]) -> Result<()> {
    put_len(buf, b.len())?;
    buf.put_slice(b);
    Ok(())
}

pub(crate) fn put_opt_str(buf: &mut BytesMut, s: Option<&str>) -> Result<()> {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_str(buf, s)
        }
        None => {
            buf.put_u8(0);
            Ok(())
        }
    }
}

pub(crate) fn get_u8(buf: &mut Bytes, what: &str) -> Result<u8> {
    need(buf, 1, what)?;
    Ok(buf.get_u8())
}

pub(crate) fn get_u32(buf: &mut Bytes, what: &str) -> Result<u32> {
    need(buf, 4, what)?;
    Ok(buf.get_u32_le())
}

/// Element count, sanity-checked against the bytes left (each element takes
/// at least one byte) so a hostile count cannot force a huge allocation.
pub(crate) fn get_count(buf: &mut Bytes) -> Result<usize> {
    let count = get_u32(buf, "count")? as usize;
    if count > buf.remaining() {
        return Err(RpcError::Codec(format!("count {count} exceeds remaining bytes").into()));
    }
    Ok(count)
}

pub(crate) fn get_blob(buf: &mut Bytes) -> Result<Bytes> {
    let len = get_u32(buf, "length")? as usize;
    need(buf, len, "blob")?;
    Ok(buf.copy_to_bytes(len))
}

pub(crate) fn get_str(buf: &mut Bytes) -> Result<String> {
    let raw = get_blob(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| RpcError::Codec("invalid utf-8".into()))
}

pub(crate) fn get_opt_str(buf: &mut Bytes) -> Result<Option<String>> {
    match get_u8(buf, "option flag")? {
        0 => Ok(None),
        1 => get_str(buf).map(Some),
        other => Err(RpcError::Codec(format!("bad option flag: {other}").into())),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn map_encoding_is_canonical() {
        let a = Value::map([("b", 2i64), ("a", 1i64)]);
        let b = Value::map([("a", 1i64), ("b", 2i64)]);
        assert_eq!(encode_value(&a).unwrap(), encode_value(&b).unwrap());
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut raw = encode_value(&Value::Null).unwrap().to_vec();
        raw.push(0);
        assert!(decode_value(Bytes::from(raw)).is_err());
    }

    #[test]
    fn rejects_hostile_count() {
        let raw = Bytes::from_static(&[TAG_LIST, 0xff, 0xff, 0xff, 0xff]);
        assert!(decode_value(raw).is_err());
    }

    #[test]
    fn rejects_excessive_nesting() {
        let mut v = Value::Null;
        for _ in 0..=MAX_DEPTH {
            v = Value::List(vec![v]);
        }
        assert!(matches!(encode_value(&v), Err(RpcError::Codec(_))));

        let mut raw = BytesMut::new();
        for _ in 0..=MAX_DEPTH {
            raw.put_u8(TAG_LIST);
            put_len(&mut raw, 1).unwrap();
        }
        raw.put_u8(TAG_NULL);
        assert!(decode_value(raw.freeze()).is_err());
    }
}
