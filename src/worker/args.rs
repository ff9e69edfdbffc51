//! The binary argument format.
//!
//! A compact tagged encoding for handler arguments crossing the worker
//! transport: magic byte `0xFA`, a little-endian `u16` parameter count,
//! then per parameter `{u8 name_len, name, u8 tag, value}`. Integers
//! are little-endian; strings and byte blobs pick the shortest of three
//! length widths; values with no native tag ride the text fallback.

use crate::error::{Error, Parse};
use crate::runtime::pool::PooledBuffer;

pub(crate) const MAGIC: u8 = 0xFA;

mod tag {
    pub(super) const NULL: u8 = 0;
    pub(super) const FALSE: u8 = 1;
    pub(super) const TRUE: u8 = 2;
    pub(super) const I8: u8 = 3;
    pub(super) const I16: u8 = 4;
    pub(super) const I32: u8 = 5;
    pub(super) const I64: u8 = 6;
    pub(super) const U8: u8 = 7;
    pub(super) const U16: u8 = 8;
    pub(super) const U32: u8 = 9;
    pub(super) const U64: u8 = 10;
    pub(super) const F32: u8 = 11;
    pub(super) const F64: u8 = 12;
    pub(super) const STR8: u8 = 13;
    pub(super) const STR16: u8 = 14;
    pub(super) const STR32: u8 = 15;
    pub(super) const BYTES8: u8 = 16;
    pub(super) const BYTES16: u8 = 17;
    pub(super) const BYTES32: u8 = 18;
    pub(super) const TEXT: u8 = 19;
}

/// One argument value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Fallback rendering for values with no native tag (JSON text).
    Text(String),
}

/// Encodes parameters into a pooled buffer; the encode path does not
/// allocate while a slot is free and the payload fits.
pub fn encode(params: &[(String, Value)]) -> PooledBuffer {
    let mut buf = PooledBuffer::acquire();
    buf.put_u8(MAGIC);
    buf.put_u16_le(params.len() as u16);
    for (name, value) in params {
        debug_assert!(name.len() <= u8::MAX as usize, "parameter name too long");
        buf.put_u8(name.len() as u8);
        buf.extend_from_slice(name.as_bytes());
        encode_value(&mut buf, value);
    }
    buf
}

fn encode_value(buf: &mut PooledBuffer, value: &Value) {
    match value {
        Value::Null => buf.put_u8(tag::NULL),
        Value::Bool(false) => buf.put_u8(tag::FALSE),
        Value::Bool(true) => buf.put_u8(tag::TRUE),
        Value::I8(v) => {
            buf.put_u8(tag::I8);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::I16(v) => {
            buf.put_u8(tag::I16);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::I32(v) => {
            buf.put_u8(tag::I32);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::I64(v) => {
            buf.put_u8(tag::I64);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::U8(v) => {
            buf.put_u8(tag::U8);
            buf.put_u8(*v);
        }
        Value::U16(v) => {
            buf.put_u8(tag::U16);
            buf.put_u16_le(*v);
        }
        Value::U32(v) => {
            buf.put_u8(tag::U32);
            buf.put_u32_le(*v);
        }
        Value::U64(v) => {
            buf.put_u8(tag::U64);
            buf.put_u64_le(*v);
        }
        Value::F32(v) => {
            buf.put_u8(tag::F32);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::F64(v) => {
            buf.put_u8(tag::F64);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::Str(s) => encode_blob(buf, s.as_bytes(), [tag::STR8, tag::STR16, tag::STR32]),
        Value::Bytes(b) => encode_blob(buf, b, [tag::BYTES8, tag::BYTES16, tag::BYTES32]),
        Value::Text(s) => {
            buf.put_u8(tag::TEXT);
            buf.put_u32_le(s.len() as u32);
            buf.extend_from_slice(s.as_bytes());
        }
    }
}

fn encode_blob(buf: &mut PooledBuffer, bytes: &[u8], tags: [u8; 3]) {
    match bytes.len() {
        len if len <= u8::MAX as usize => {
            buf.put_u8(tags[0]);
            buf.put_u8(len as u8);
        }
        len if len <= u16::MAX as usize => {
            buf.put_u8(tags[1]);
            buf.put_u16_le(len as u16);
        }
        len => {
            buf.put_u8(tags[2]);
            buf.put_u32_le(len as u32);
        }
    }
    buf.extend_from_slice(bytes);
}

struct Cursor<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> crate::Result<&'a [u8]> {
        if self.at + n > self.bytes.len() {
            return Err(Error::new_parse(Parse::Ipc));
        }
        let slice = &self.bytes[self.at..self.at + n];
        self.at += n;
        Ok(slice)
    }

    fn u8(&mut self) -> crate::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16_le(&mut self) -> crate::Result<u16> {
        let raw = self.take(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn u32_le(&mut self) -> crate::Result<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn u64_le(&mut self) -> crate::Result<u64> {
        let raw = self.take(8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(raw);
        Ok(u64::from_le_bytes(out))
    }
}

/// Decodes an encoded parameter list.
pub fn decode(bytes: &[u8]) -> crate::Result<Vec<(String, Value)>> {
    let mut cursor = Cursor { bytes, at: 0 };
    if cursor.u8()? != MAGIC {
        return Err(Error::new_parse(Parse::Ipc));
    }
    let count = cursor.u16_le()? as usize;
    let mut params = Vec::with_capacity(count);
    for _ in 0..count {
        let name_len = cursor.u8()? as usize;
        let name = std::str::from_utf8(cursor.take(name_len)?)
            .map_err(|_| Error::new_parse(Parse::Ipc))?
            .to_owned();
        let value = decode_value(&mut cursor)?;
        params.push((name, value));
    }
    if cursor.at != bytes.len() {
        return Err(Error::new_parse(Parse::Ipc));
    }
    Ok(params)
}

fn decode_value(cursor: &mut Cursor<'_>) -> crate::Result<Value> {
    let tag = cursor.u8()?;
    Ok(match tag {
        tag::NULL => Value::Null,
        tag::FALSE => Value::Bool(false),
        tag::TRUE => Value::Bool(true),
        tag::I8 => Value::I8(cursor.u8()? as i8),
        tag::I16 => Value::I16(cursor.u16_le()? as i16),
        tag::I32 => Value::I32(cursor.u32_le()? as i32),
        tag::I64 => Value::I64(cursor.u64_le()? as i64),
        tag::U8 => Value::U8(cursor.u8()?),
        tag::U16 => Value::U16(cursor.u16_le()?),
        tag::U32 => Value::U32(cursor.u32_le()?),
        tag::U64 => Value::U64(cursor.u64_le()?),
        tag::F32 => Value::F32(f32::from_le_bytes({
            let raw = cursor.take(4)?;
            [raw[0], raw[1], raw[2], raw[3]]
        })),
        tag::F64 => Value::F64(f64::from_le_bytes({
            let raw = cursor.take(8)?;
            let mut out = [0u8; 8];
            out.copy_from_slice(raw);
            out
        })),
        tag::STR8 => {
            let len = cursor.u8()? as usize;
            Value::Str(decode_str(cursor.take(len)?)?)
        }
        tag::STR16 => {
            let len = cursor.u16_le()? as usize;
            Value::Str(decode_str(cursor.take(len)?)?)
        }
        tag::STR32 => {
            let len = cursor.u32_le()? as usize;
            Value::Str(decode_str(cursor.take(len)?)?)
        }
        tag::BYTES8 => {
            let len = cursor.u8()? as usize;
            Value::Bytes(cursor.take(len)?.to_vec())
        }
        tag::BYTES16 => {
            let len = cursor.u16_le()? as usize;
            Value::Bytes(cursor.take(len)?.to_vec())
        }
        tag::BYTES32 => {
            let len = cursor.u32_le()? as usize;
            Value::Bytes(cursor.take(len)?.to_vec())
        }
        tag::TEXT => {
            let len = cursor.u32_le()? as usize;
            Value::Text(decode_str(cursor.take(len)?)?)
        }
        _ => return Err(Error::new_parse(Parse::Ipc)),
    })
}

fn decode_str(bytes: &[u8]) -> crate::Result<String> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| Error::new_parse(Parse::Ipc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(params: Vec<(String, Value)>) -> Vec<(String, Value)> {
        let encoded = encode(&params);
        decode(encoded.as_slice()).unwrap()
    }

    #[test]
    fn scalar_tags_roundtrip() {
        let params = vec![
            ("null".into(), Value::Null),
            ("yes".into(), Value::Bool(true)),
            ("no".into(), Value::Bool(false)),
            ("i8".into(), Value::I8(-5)),
            ("i16".into(), Value::I16(-3000)),
            ("i32".into(), Value::I32(-2_000_000)),
            ("i64".into(), Value::I64(i64::MIN)),
            ("u8".into(), Value::U8(200)),
            ("u16".into(), Value::U16(60_000)),
            ("u32".into(), Value::U32(4_000_000_000)),
            ("u64".into(), Value::U64(u64::MAX)),
        ];
        assert_eq!(roundtrip(params.clone()), params);
    }

    #[test]
    fn floats_roundtrip_bitwise() {
        let params = vec![
            ("pi".into(), Value::F32(std::f32::consts::PI)),
            ("e".into(), Value::F64(std::f64::consts::E)),
            ("tiny".into(), Value::F64(f64::MIN_POSITIVE)),
        ];
        let decoded = roundtrip(params.clone());
        for ((_, a), (_, b)) in params.iter().zip(decoded.iter()) {
            match (a, b) {
                (Value::F32(x), Value::F32(y)) => assert_eq!(x.to_bits(), y.to_bits()),
                (Value::F64(x), Value::F64(y)) => assert_eq!(x.to_bits(), y.to_bits()),
                _ => panic!("tag changed in roundtrip"),
            }
        }
    }

    #[test]
    fn string_width_promotion() {
        let short = "s".repeat(10);
        let medium = "m".repeat(300);
        let long = "l".repeat(70_000);
        let params = vec![
            ("short".into(), Value::Str(short.clone())),
            ("medium".into(), Value::Str(medium.clone())),
            ("long".into(), Value::Str(long.clone())),
            ("blob".into(), Value::Bytes(vec![7u8; 300])),
            ("fallback".into(), Value::Text("{\"a\":1}".into())),
        ];
        assert_eq!(roundtrip(params.clone()), params);
    }

    #[test]
    fn magic_byte_enforced() {
        let encoded = encode(&[("a".into(), Value::Null)]);
        let mut bytes = encoded.as_slice().to_vec();
        bytes[0] = 0x00;
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn truncated_input_rejected() {
        let encoded = encode(&[("key".into(), Value::Str("value".into()))]);
        let bytes = encoded.as_slice();
        for cut in 1..bytes.len() {
            assert!(decode(&bytes[..cut]).is_err(), "cut at {}", cut);
        }
    }

    #[test]
    fn trailing_garbage_rejected() {
        let encoded = encode(&[("a".into(), Value::U8(1))]);
        let mut bytes = encoded.as_slice().to_vec();
        bytes.push(0xFF);
        assert!(decode(&bytes).is_err());
    }
}
