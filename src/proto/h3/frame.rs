//! HTTP/3 frame and varint codec (RFC 9114 §7, RFC 9000 §16).

use crate::error::{Error, Parse};

pub(crate) const FRAME_DATA: u64 = 0x0;
pub(crate) const FRAME_HEADERS: u64 = 0x1;
pub(crate) const FRAME_CANCEL_PUSH: u64 = 0x3;
pub(crate) const FRAME_SETTINGS: u64 = 0x4;
pub(crate) const FRAME_PUSH_PROMISE: u64 = 0x5;
pub(crate) const FRAME_GOAWAY: u64 = 0x7;
pub(crate) const FRAME_MAX_PUSH_ID: u64 = 0xD;

pub(crate) const STREAM_TYPE_CONTROL: u64 = 0x0;
pub(crate) const STREAM_TYPE_PUSH: u64 = 0x1;
pub(crate) const STREAM_TYPE_QPACK_ENCODER: u64 = 0x2;
pub(crate) const STREAM_TYPE_QPACK_DECODER: u64 = 0x3;

pub(crate) const SETTING_QPACK_MAX_TABLE_CAPACITY: u64 = 0x1;
pub(crate) const SETTING_MAX_FIELD_SECTION_SIZE: u64 = 0x6;
pub(crate) const SETTING_QPACK_BLOCKED_STREAMS: u64 = 0x7;

/// Decodes a QUIC variable-length integer, returning the value and the
/// bytes consumed, or `None` when the buffer is short.
pub(crate) fn decode_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    let first = *bytes.first()?;
    let len = 1usize << (first >> 6);
    if bytes.len() < len {
        return None;
    }
    let mut value = u64::from(first & 0x3F);
    for &byte in &bytes[1..len] {
        value = (value << 8) | u64::from(byte);
    }
    Some((value, len))
}

/// Encodes a QUIC variable-length integer.
pub(crate) fn encode_varint(out: &mut Vec<u8>, value: u64) {
    if value < 1 << 6 {
        out.push(value as u8);
    } else if value < 1 << 14 {
        out.extend_from_slice(&((value as u16) | 0x4000).to_be_bytes());
    } else if value < 1 << 30 {
        out.extend_from_slice(&((value as u32) | 0x8000_0000).to_be_bytes());
    } else {
        debug_assert!(value < 1 << 62, "varint out of range");
        out.extend_from_slice(&(value | 0xC000_0000_0000_0000).to_be_bytes());
    }
}

/// One parsed frame.
#[derive(Debug, PartialEq)]
pub(crate) struct H3Frame {
    pub(crate) kind: u64,
    pub(crate) payload: Vec<u8>,
}

/// Parses one frame from the front of `bytes`, returning it and the
/// bytes consumed, or `None` when more input is needed.
pub(crate) fn parse_frame(bytes: &[u8]) -> crate::Result<Option<(H3Frame, usize)>> {
    let (kind, kind_len) = match decode_varint(bytes) {
        Some(parsed) => parsed,
        None => return Ok(None),
    };
    let (len, len_len) = match decode_varint(&bytes[kind_len..]) {
        Some(parsed) => parsed,
        None => return Ok(None),
    };
    let len = usize::try_from(len).map_err(|_| Error::new_parse(Parse::Header))?;
    let header = kind_len + len_len;
    if bytes.len() < header + len {
        return Ok(None);
    }
    // Push frames are never valid toward a server.
    if kind == FRAME_PUSH_PROMISE {
        return Err(Error::new_parse(Parse::Header));
    }
    Ok(Some((
        H3Frame {
            kind,
            payload: bytes[header..header + len].to_vec(),
        },
        header + len,
    )))
}

/// Serializes a frame header followed by `payload`.
pub(crate) fn encode_frame(out: &mut Vec<u8>, kind: u64, payload: &[u8]) {
    encode_varint(out, kind);
    encode_varint(out, payload.len() as u64);
    out.extend_from_slice(payload);
}

/// The SETTINGS payload this server sends: dynamic QPACK disabled.
pub(crate) fn server_settings() -> Vec<u8> {
    let mut payload = Vec::new();
    encode_varint(&mut payload, SETTING_QPACK_MAX_TABLE_CAPACITY);
    encode_varint(&mut payload, 0);
    encode_varint(&mut payload, SETTING_QPACK_BLOCKED_STREAMS);
    encode_varint(&mut payload, 0);
    encode_varint(&mut payload, SETTING_MAX_FIELD_SECTION_SIZE);
    encode_varint(&mut payload, 64 * 1024);
    payload
}

/// Parses a SETTINGS payload into identifier/value pairs.
pub(crate) fn parse_settings(payload: &[u8]) -> crate::Result<Vec<(u64, u64)>> {
    let mut settings = Vec::new();
    let mut at = 0usize;
    while at < payload.len() {
        let (id, id_len) =
            decode_varint(&payload[at..]).ok_or_else(|| Error::new_parse(Parse::Header))?;
        at += id_len;
        let (value, value_len) =
            decode_varint(&payload[at..]).ok_or_else(|| Error::new_parse(Parse::Header))?;
        at += value_len;
        settings.push((id, value));
    }
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_widths() {
        for &(value, width) in &[
            (0u64, 1usize),
            (63, 1),
            (64, 2),
            (16_383, 2),
            (16_384, 4),
            (1_073_741_823, 4),
            (1_073_741_824, 8),
        ] {
            let mut out = Vec::new();
            encode_varint(&mut out, value);
            assert_eq!(out.len(), width, "value {}", value);
            assert_eq!(decode_varint(&out), Some((value, width)));
        }
    }

    #[test]
    fn varint_rfc_vector() {
        // RFC 9000 A.1: 0x25 = 37, 0x7bbd = 15293.
        assert_eq!(decode_varint(&[0x25]), Some((37, 1)));
        assert_eq!(decode_varint(&[0x7b, 0xbd]), Some((15_293, 2)));
    }

    #[test]
    fn frame_roundtrip() {
        let mut out = Vec::new();
        encode_frame(&mut out, FRAME_HEADERS, b"section");
        let (frame, consumed) = parse_frame(&out).unwrap().expect("complete");
        assert_eq!(consumed, out.len());
        assert_eq!(frame.kind, FRAME_HEADERS);
        assert_eq!(frame.payload, b"section");
    }

    #[test]
    fn partial_frame_needs_more() {
        let mut out = Vec::new();
        encode_frame(&mut out, FRAME_DATA, &[9u8; 100]);
        for cut in 0..out.len() {
            assert!(parse_frame(&out[..cut]).unwrap().is_none(), "cut {}", cut);
        }
    }

    #[test]
    fn push_promise_toward_server_rejected() {
        let mut out = Vec::new();
        encode_frame(&mut out, FRAME_PUSH_PROMISE, b"x");
        assert!(parse_frame(&out).is_err());
    }

    #[test]
    fn settings_roundtrip() {
        let payload = server_settings();
        let settings = parse_settings(&payload).unwrap();
        assert!(settings.contains(&(SETTING_QPACK_MAX_TABLE_CAPACITY, 0)));
        assert!(settings.contains(&(SETTING_MAX_FIELD_SECTION_SIZE, 64 * 1024)));
    }

}
