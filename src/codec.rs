/// Wire-level codec for the primitive values the core exchanges in probe and
/// session documents. Each recognized value encodes as a one-byte type tag
/// plus a payload; the sentinel bounds carry no payload at all.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Wire-level type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeTag {
    Boolean = 0x08,
    Int64 = 0x12,
    /// Maximum-bound sentinel, zero-byte payload
    MaxKey = 0x7f,
    /// Minimum-bound sentinel, zero-byte payload
    MinKey = 0xff,
}

impl TypeTag {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x08 => Some(TypeTag::Boolean),
            0x12 => Some(TypeTag::Int64),
            0x7f => Some(TypeTag::MaxKey),
            0xff => Some(TypeTag::MinKey),
            _ => None,
        }
    }
}

/// Primitive values recognized by the core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Boolean(bool),
    Int64(i64),
    MaxKey,
    MinKey,
}

impl Value {
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Boolean(_) => TypeTag::Boolean,
            Value::Int64(_) => TypeTag::Int64,
            Value::MaxKey => TypeTag::MaxKey,
            Value::MinKey => TypeTag::MinKey,
        }
    }
}

/// Encode a value as its type tag followed by the payload
pub fn encode(value: &Value) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(value.type_tag() as u8);
    match value {
        Value::Boolean(b) => buf.put_u8(u8::from(*b)),
        Value::Int64(n) => buf.put_i64_le(*n),
        Value::MaxKey | Value::MinKey => {}
    }
    buf.freeze()
}

/// Decode a value from its tagged wire form
pub fn decode(mut bytes: Bytes) -> Result<Value> {
    if bytes.is_empty() {
        return Err(Error::format("empty input"));
    }
    let tag_byte = bytes.get_u8();
    let tag = TypeTag::from_byte(tag_byte)
        .ok_or_else(|| Error::format(format!("unrecognized type tag 0x{:02x}", tag_byte)))?;
    decode_payload(tag, bytes)
}

/// Decode the payload of an already-read type tag
pub fn decode_payload(tag: TypeTag, mut payload: Bytes) -> Result<Value> {
    match tag {
        TypeTag::Boolean => {
            if payload.len() != 1 {
                return Err(Error::format("boolean payload must be 1 byte"));
            }
            match payload.get_u8() {
                0 => Ok(Value::Boolean(false)),
                1 => Ok(Value::Boolean(true)),
                other => Err(Error::format(format!("invalid boolean byte 0x{:02x}", other))),
            }
        }
        TypeTag::Int64 => {
            if payload.len() != 8 {
                return Err(Error::format("int64 payload must be 8 bytes"));
            }
            Ok(Value::Int64(payload.get_i64_le()))
        }
        TypeTag::MaxKey => {
            if !payload.is_empty() {
                return Err(Error::format("max-key sentinel carries no payload"));
            }
            Ok(Value::MaxKey)
        }
        TypeTag::MinKey => {
            if !payload.is_empty() {
                return Err(Error::format("min-key sentinel carries no payload"));
            }
            Ok(Value::MinKey)
        }
    }
}

/// Decode specifically a max-key sentinel; any other tag is a format error
pub fn decode_max_key(tag: TypeTag, payload: Bytes) -> Result<Value> {
    if tag != TypeTag::MaxKey {
        return Err(Error::format(format!(
            "cannot decode max-key sentinel from type tag {:?}",
            tag
        )));
    }
    decode_payload(tag, payload)
}
