//! QPACK header compression (RFC 9204), static table only.
//!
//! The SETTINGS this server advertises pin the dynamic table to zero
//! capacity, so every peer-encoded field section must have a Required
//! Insert Count of zero and reference only the static table or carry
//! literals. Responses are encoded the same way: indexed static fields
//! where one exists, literal field lines otherwise, never huffman.

use super::huffman;
use crate::error::{Error, Parse};

/// RFC 9204 Appendix A.
pub(crate) const STATIC_TABLE: [(&str, &str); 99] = [
    (":authority", ""),
    (":path", "/"),
    ("age", "0"),
    ("content-disposition", ""),
    ("content-length", "0"),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("referer", ""),
    ("set-cookie", ""),
    (":method", "CONNECT"),
    (":method", "DELETE"),
    (":method", "GET"),
    (":method", "HEAD"),
    (":method", "OPTIONS"),
    (":method", "POST"),
    (":method", "PUT"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "103"),
    (":status", "200"),
    (":status", "304"),
    (":status", "404"),
    (":status", "503"),
    ("accept", "*/*"),
    ("accept", "application/dns-message"),
    ("accept-encoding", "gzip, deflate, br"),
    ("accept-ranges", "bytes"),
    ("access-control-allow-headers", "cache-control"),
    ("access-control-allow-headers", "content-type"),
    ("access-control-allow-origin", "*"),
    ("cache-control", "max-age=0"),
    ("cache-control", "max-age=2592000"),
    ("cache-control", "max-age=604800"),
    ("cache-control", "no-cache"),
    ("cache-control", "no-store"),
    ("cache-control", "public, max-age=31536000"),
    ("content-encoding", "br"),
    ("content-encoding", "gzip"),
    ("content-type", "application/dns-message"),
    ("content-type", "application/javascript"),
    ("content-type", "application/json"),
    ("content-type", "application/x-www-form-urlencoded"),
    ("content-type", "image/gif"),
    ("content-type", "image/jpeg"),
    ("content-type", "image/png"),
    ("content-type", "text/css"),
    ("content-type", "text/html; charset=utf-8"),
    ("content-type", "text/plain"),
    ("content-type", "text/plain;charset=utf-8"),
    ("range", "bytes=0-"),
    ("strict-transport-security", "max-age=31536000"),
    ("strict-transport-security", "max-age=31536000; includesubdomains"),
    (
        "strict-transport-security",
        "max-age=31536000; includesubdomains; preload",
    ),
    ("vary", "accept-encoding"),
    ("vary", "origin"),
    ("x-content-type-options", "nosniff"),
    ("x-xss-protection", "1; mode=block"),
    (":status", "100"),
    (":status", "204"),
    (":status", "206"),
    (":status", "302"),
    (":status", "400"),
    (":status", "403"),
    (":status", "421"),
    (":status", "425"),
    (":status", "500"),
    ("accept-ch", ""),
    ("accept-ch-lifetime", ""),
    ("accept-charset", ""),
    ("access-control-allow-credentials", "FALSE"),
    ("access-control-allow-credentials", "TRUE"),
    ("access-control-allow-headers", "*"),
    ("access-control-allow-methods", "get"),
    ("access-control-allow-methods", "get, post, options"),
    ("access-control-allow-methods", "options"),
    ("access-control-expose-headers", "content-length"),
    ("access-control-request-headers", "content-type"),
    ("access-control-request-method", "get"),
    ("access-control-request-method", "post"),
    ("alt-svc", "clear"),
    ("authorization", ""),
    (
        "content-security-policy",
        "script-src 'none'; object-src 'none'; base-uri 'none'",
    ),
    ("early-data", "1"),
    ("expect-ct", ""),
    ("forwarded", ""),
    ("if-range", ""),
    ("origin", ""),
    ("purpose", "prefetch"),
    ("server", ""),
    ("timing-allow-origin", "*"),
    ("upgrade-insecure-requests", "1"),
    ("user-agent", ""),
    ("x-forwarded-for", ""),
];

/// Decodes an N-bit-prefix integer (RFC 7541 §5.1), returning the
/// value and bytes consumed.
fn decode_prefix_int(bytes: &[u8], prefix: u8) -> crate::Result<(u64, usize)> {
    if bytes.is_empty() {
        return Err(Error::new_parse(Parse::Header));
    }
    let mask = (1u16 << prefix) as u64 - 1;
    let mut value = u64::from(bytes[0]) & mask;
    if value < mask {
        return Ok((value, 1));
    }
    let mut shift = 0u32;
    for (i, &byte) in bytes[1..].iter().enumerate() {
        value = value
            .checked_add(u64::from(byte & 0x7F) << shift)
            .ok_or_else(|| Error::new_parse(Parse::Header))?;
        if byte & 0x80 == 0 {
            return Ok((value, i + 2));
        }
        shift += 7;
        if shift > 56 {
            return Err(Error::new_parse(Parse::Header));
        }
    }
    Err(Error::new_parse(Parse::Header))
}

/// Encodes an N-bit-prefix integer with `high` or-ed into the first
/// byte's non-prefix bits.
fn encode_prefix_int(out: &mut Vec<u8>, high: u8, prefix: u8, mut value: u64) {
    let mask = (1u16 << prefix) as u64 - 1;
    if value < mask {
        out.push(high | value as u8);
        return;
    }
    out.push(high | mask as u8);
    value -= mask;
    while value >= 0x80 {
        out.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Reads a string literal: huffman bit + length prefix + bytes.
fn decode_string(bytes: &[u8], prefix: u8) -> crate::Result<(String, usize)> {
    if bytes.is_empty() {
        return Err(Error::new_parse(Parse::Header));
    }
    let huffman_bit = 1u8 << prefix;
    let is_huffman = bytes[0] & huffman_bit != 0;
    let (len, consumed) = decode_prefix_int(bytes, prefix)?;
    let len = len as usize;
    if bytes.len() < consumed + len {
        return Err(Error::new_parse(Parse::Header));
    }
    let raw = &bytes[consumed..consumed + len];
    let decoded = if is_huffman {
        huffman::decode(raw)?
    } else {
        raw.to_vec()
    };
    let text = String::from_utf8(decoded).map_err(|_| Error::new_parse(Parse::Header))?;
    Ok((text, consumed + len))
}

fn encode_string(out: &mut Vec<u8>, high: u8, prefix: u8, value: &str) {
    // Never huffman on the encode side: the H bit stays clear.
    encode_prefix_int(out, high, prefix, value.len() as u64);
    out.extend_from_slice(value.as_bytes());
}

fn static_entry(index: u64) -> crate::Result<(&'static str, &'static str)> {
    STATIC_TABLE
        .get(index as usize)
        .copied()
        .ok_or_else(|| Error::new_parse(Parse::Header))
}

/// Decodes a complete encoded field section into name/value pairs.
pub(crate) fn decode_field_section(bytes: &[u8]) -> crate::Result<Vec<(String, String)>> {
    // Prefix: Required Insert Count (8-bit prefix), then S + Delta Base
    // (7-bit prefix). With a zero-capacity dynamic table both must be
    // zero.
    let (required_insert_count, consumed) = decode_prefix_int(bytes, 8)?;
    if required_insert_count != 0 {
        return Err(Error::new_parse(Parse::Header));
    }
    let rest = &bytes[consumed..];
    let (_, base_consumed) = decode_prefix_int(rest, 7)?;
    let mut at = consumed + base_consumed;

    let mut fields = Vec::new();
    while at < bytes.len() {
        let b = bytes[at];
        let rest = &bytes[at..];
        if b & 0x80 != 0 {
            // Indexed field line; T must point at the static table.
            if b & 0x40 == 0 {
                return Err(Error::new_parse(Parse::Header));
            }
            let (index, consumed) = decode_prefix_int(rest, 6)?;
            let (name, value) = static_entry(index)?;
            fields.push((name.to_owned(), value.to_owned()));
            at += consumed;
        } else if b & 0x40 != 0 {
            // Literal field line with name reference.
            if b & 0x10 == 0 {
                return Err(Error::new_parse(Parse::Header));
            }
            let (index, consumed) = decode_prefix_int(rest, 4)?;
            let (name, _) = static_entry(index)?;
            let (value, value_consumed) = decode_string(&rest[consumed..], 7)?;
            fields.push((name.to_owned(), value));
            at += consumed + value_consumed;
        } else if b & 0x20 != 0 {
            // Literal field line with literal name.
            let name_huffman = b & 0x08 != 0;
            let (name_len, consumed) = decode_prefix_int(rest, 3)?;
            let name_len = name_len as usize;
            if rest.len() < consumed + name_len {
                return Err(Error::new_parse(Parse::Header));
            }
            let raw_name = &rest[consumed..consumed + name_len];
            let name_bytes = if name_huffman {
                huffman::decode(raw_name)?
            } else {
                raw_name.to_vec()
            };
            let name =
                String::from_utf8(name_bytes).map_err(|_| Error::new_parse(Parse::Header))?;
            let (value, value_consumed) = decode_string(&rest[consumed + name_len..], 7)?;
            fields.push((name, value));
            at += consumed + name_len + value_consumed;
        } else {
            // Post-base forms require a dynamic table we do not have.
            return Err(Error::new_parse(Parse::Header));
        }
    }
    Ok(fields)
}

fn static_index_for(name: &str, value: &str) -> Option<u64> {
    STATIC_TABLE
        .iter()
        .position(|&(n, v)| n == name && v == value)
        .map(|index| index as u64)
}

fn static_name_index(name: &str) -> Option<u64> {
    STATIC_TABLE
        .iter()
        .position(|&(n, _)| n == name)
        .map(|index| index as u64)
}

/// Encodes a field section: full static matches as indexed lines, known
/// names as name references, everything else literal.
pub(crate) fn encode_field_section(fields: &[(String, String)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + fields.len() * 32);
    // Required Insert Count 0, Delta Base 0.
    out.push(0);
    out.push(0);
    for (name, value) in fields {
        encode_field_line(&mut out, name, value);
    }
    out
}

fn encode_field_line(out: &mut Vec<u8>, name: &str, value: &str) {
    if let Some(index) = static_index_for(name, value) {
        // 1 T=1 + 6-bit index.
        encode_prefix_int(out, 0b1100_0000, 6, index);
        return;
    }
    if let Some(index) = static_name_index(name) {
        // 01 N=0 T=1 + 4-bit index, then the value literal.
        encode_prefix_int(out, 0b0101_0000, 4, index);
        encode_string(out, 0, 7, value);
        return;
    }
    // 001 N=0 H=0 + 3-bit name length, then name and value literals.
    encode_string(out, 0b0010_0000, 3, name);
    encode_string(out, 0, 7, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(fields: &[(&str, &str)]) -> Vec<(String, String)> {
        fields
            .iter()
            .map(|&(n, v)| (n.to_owned(), v.to_owned()))
            .collect()
    }

    #[test]
    fn roundtrip_static_and_literals() {
        let fields = owned(&[
            (":status", "200"),
            ("content-type", "application/json"),
            ("content-length", "42"),
            ("x-custom", "hello world"),
        ]);
        let encoded = encode_field_section(&fields);
        let decoded = decode_field_section(&encoded).unwrap();
        assert_eq!(decoded, fields);
    }

    #[test]
    fn roundtrip_request_shape() {
        let fields = owned(&[
            (":method", "GET"),
            (":scheme", "https"),
            (":path", "/items/7?full=1"),
            (":authority", "example.com"),
            ("user-agent", "velox-test/1"),
        ]);
        let encoded = encode_field_section(&fields);
        let decoded = decode_field_section(&encoded).unwrap();
        assert_eq!(decoded, fields);
    }

    #[test]
    fn decodes_huffman_values() {
        // Build a literal-with-literal-name line whose value is
        // huffman coded, as real clients emit.
        let mut encoded = vec![0u8, 0u8];
        encode_string(&mut encoded, 0b0010_0000, 3, "x-h");
        let coded = huffman::encode(b"www.example.com");
        encode_prefix_int(&mut encoded, 0x80, 7, coded.len() as u64);
        encoded.extend_from_slice(&coded);

        let decoded = decode_field_section(&encoded).unwrap();
        assert_eq!(decoded, owned(&[("x-h", "www.example.com")]));
    }

    #[test]
    fn nonzero_required_insert_count_rejected() {
        // A peer referencing the dynamic table we disabled.
        assert!(decode_field_section(&[0x05, 0x00, 0xC0]).is_err());
    }

    #[test]
    fn prefix_int_continuation() {
        let mut out = Vec::new();
        encode_prefix_int(&mut out, 0, 5, 1337);
        // RFC 7541 C.1.2.
        assert_eq!(out, vec![0x1F, 0x9A, 0x0A]);
        let (value, consumed) = decode_prefix_int(&out, 5).unwrap();
        assert_eq!(value, 1337);
        assert_eq!(consumed, 3);
    }

    #[test]
    fn truncated_sections_rejected() {
        let fields = owned(&[(":status", "200"), ("x-custom", "value")]);
        let encoded = encode_field_section(&fields);
        for cut in 1..encoded.len() {
            assert!(
                decode_field_section(&encoded[..cut]).is_err()
                    || decode_field_section(&encoded[..cut])
                        .map(|f| f.len() < fields.len())
                        .unwrap_or(false),
                "cut at {}",
                cut
            );
        }
    }
}
