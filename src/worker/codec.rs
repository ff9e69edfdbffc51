//! Worker-transport message framing.
//!
//! Every message starts with a packed little-endian header whose first
//! byte is the message type and which carries the total message length,
//! so readers can frame without lookahead. Request/response headers
//! carry a 32-bit correlation id restoring pairing across workers;
//! WebSocket events and responses are correlated by connection id
//! instead.

use std::io::{self, Read, Write};

use tracing::trace;

use crate::runtime::pool::PooledBuffer;

pub(crate) mod msg_type {
    pub(crate) const REQUEST: u8 = 1;
    pub(crate) const RESPONSE: u8 = 2;
    pub(crate) const SHUTDOWN: u8 = 3;
    pub(crate) const WS_CONNECT: u8 = 10;
    pub(crate) const WS_MESSAGE: u8 = 11;
    pub(crate) const WS_DISCONNECT: u8 = 12;
    pub(crate) const WS_SEND: u8 = 20;
    pub(crate) const WS_CLOSE: u8 = 21;
}

const REQUEST_HEADER_LEN: usize = 1 + 4 + 4 + 4 + 4 + 4 + 1;
const RESPONSE_HEADER_LEN: usize = 1 + 4 + 4 + 2 + 4 + 4 + 1 + 1;
const WS_EVENT_HEADER_LEN: usize = 1 + 8 + 4 + 4 + 4 + 1;
const WS_RESPONSE_HEADER_LEN: usize = 1 + 8 + 4 + 4 + 2 + 1;

/// Largest message accepted from the wire. Guards the reader threads
/// against a corrupt length field.
const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

/// Serialization of handler arguments and response bodies. Receivers
/// auto-detect from the one-byte format field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ArgsFormat {
    /// JSON text.
    Text = 0,
    /// The tagged binary format in [`super::args`].
    Binary = 1,
    /// Opaque bytes in a worker-defined encoding, passed through.
    Alternate = 2,
}

impl ArgsFormat {
    fn from_byte(byte: u8) -> io::Result<ArgsFormat> {
        match byte {
            0 => Ok(ArgsFormat::Text),
            1 => Ok(ArgsFormat::Binary),
            2 => Ok(ArgsFormat::Alternate),
            _ => Err(bad("unknown args format")),
        }
    }
}

fn bad(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_owned())
}

/// A framed transport message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Request {
        correlation: u32,
        module: String,
        function: String,
        format: ArgsFormat,
        args: Vec<u8>,
    },
    Response {
        correlation: u32,
        status: u16,
        success: bool,
        format: ArgsFormat,
        body: Vec<u8>,
        error: String,
    },
    Shutdown,
    WsConnect {
        connection: u64,
        path: String,
    },
    WsMessage {
        connection: u64,
        path: String,
        payload: Vec<u8>,
        binary: bool,
    },
    WsDisconnect {
        connection: u64,
    },
    WsSend {
        connection: u64,
        payload: Vec<u8>,
        binary: bool,
    },
    WsClose {
        connection: u64,
        code: u16,
    },
}

/// Encodes `msg` into a pooled buffer ready for one `write_all`.
pub fn encode(msg: &Message) -> PooledBuffer {
    let mut buf = PooledBuffer::acquire();
    match msg {
        Message::Request {
            correlation,
            module,
            function,
            format,
            args,
        } => {
            let total =
                REQUEST_HEADER_LEN + module.len() + function.len() + args.len();
            buf.put_u8(msg_type::REQUEST);
            buf.put_u32_le(*correlation);
            buf.put_u32_le(total as u32);
            buf.put_u32_le(module.len() as u32);
            buf.put_u32_le(function.len() as u32);
            buf.put_u32_le(args.len() as u32);
            buf.put_u8(*format as u8);
            buf.extend_from_slice(module.as_bytes());
            buf.extend_from_slice(function.as_bytes());
            buf.extend_from_slice(args);
        }
        Message::Response {
            correlation,
            status,
            success,
            format,
            body,
            error,
        } => {
            let total = RESPONSE_HEADER_LEN + body.len() + error.len();
            buf.put_u8(msg_type::RESPONSE);
            buf.put_u32_le(*correlation);
            buf.put_u32_le(total as u32);
            buf.put_u16_le(*status);
            buf.put_u32_le(body.len() as u32);
            buf.put_u32_le(error.len() as u32);
            buf.put_u8(u8::from(*success));
            buf.put_u8(*format as u8);
            buf.extend_from_slice(body);
            buf.extend_from_slice(error.as_bytes());
        }
        Message::Shutdown => {
            buf.put_u8(msg_type::SHUTDOWN);
            buf.put_u32_le(0);
            buf.put_u32_le((1 + 4 + 4) as u32);
        }
        Message::WsConnect { connection, path } => {
            encode_ws_event(&mut buf, msg_type::WS_CONNECT, *connection, path, &[], false);
        }
        Message::WsMessage {
            connection,
            path,
            payload,
            binary,
        } => {
            encode_ws_event(
                &mut buf,
                msg_type::WS_MESSAGE,
                *connection,
                path,
                payload,
                *binary,
            );
        }
        Message::WsDisconnect { connection } => {
            encode_ws_event(&mut buf, msg_type::WS_DISCONNECT, *connection, "", &[], false);
        }
        Message::WsSend {
            connection,
            payload,
            binary,
        } => {
            let total = WS_RESPONSE_HEADER_LEN + payload.len();
            buf.put_u8(msg_type::WS_SEND);
            buf.put_u64_le(*connection);
            buf.put_u32_le(total as u32);
            buf.put_u32_le(payload.len() as u32);
            buf.put_u16_le(0);
            buf.put_u8(u8::from(*binary));
            buf.extend_from_slice(payload);
        }
        Message::WsClose { connection, code } => {
            let total = WS_RESPONSE_HEADER_LEN;
            buf.put_u8(msg_type::WS_CLOSE);
            buf.put_u64_le(*connection);
            buf.put_u32_le(total as u32);
            buf.put_u32_le(0);
            buf.put_u16_le(*code);
            buf.put_u8(0);
        }
    }
    buf
}

fn encode_ws_event(
    buf: &mut PooledBuffer,
    kind: u8,
    connection: u64,
    path: &str,
    payload: &[u8],
    binary: bool,
) {
    let total = WS_EVENT_HEADER_LEN + path.len() + payload.len();
    buf.put_u8(kind);
    buf.put_u64_le(connection);
    buf.put_u32_le(total as u32);
    buf.put_u32_le(path.len() as u32);
    buf.put_u32_le(payload.len() as u32);
    buf.put_u8(u8::from(binary));
    buf.extend_from_slice(path.as_bytes());
    buf.extend_from_slice(payload);
}

/// Writes one message to `writer`.
pub fn write_message(writer: &mut impl Write, msg: &Message) -> io::Result<()> {
    let buf = encode(msg);
    trace!("ipc write {} bytes", buf.len());
    writer.write_all(buf.as_slice())
}

/// Blocking read of one complete message.
pub fn read_message(reader: &mut impl Read) -> io::Result<Message> {
    let mut first = [0u8; 1];
    reader.read_exact(&mut first)?;
    let kind = first[0];

    // Everything after the type byte, up to and including the total
    // length, depends on the header family.
    match kind {
        msg_type::REQUEST => {
            let mut rest = [0u8; REQUEST_HEADER_LEN - 1];
            reader.read_exact(&mut rest)?;
            let correlation = u32_at(&rest, 0);
            let total = u32_at(&rest, 4) as usize;
            let module_len = u32_at(&rest, 8) as usize;
            let function_len = u32_at(&rest, 12) as usize;
            let args_len = u32_at(&rest, 16) as usize;
            let format = ArgsFormat::from_byte(rest[20])?;
            check_total(total, REQUEST_HEADER_LEN + module_len + function_len + args_len)?;
            let module = read_string(reader, module_len)?;
            let function = read_string(reader, function_len)?;
            let args = read_bytes(reader, args_len)?;
            Ok(Message::Request {
                correlation,
                module,
                function,
                format,
                args,
            })
        }
        msg_type::RESPONSE => {
            let mut rest = [0u8; RESPONSE_HEADER_LEN - 1];
            reader.read_exact(&mut rest)?;
            let correlation = u32_at(&rest, 0);
            let total = u32_at(&rest, 4) as usize;
            let status = u16::from_le_bytes([rest[8], rest[9]]);
            let body_len = u32_at(&rest, 10) as usize;
            let error_len = u32_at(&rest, 14) as usize;
            let success = rest[18] != 0;
            let format = ArgsFormat::from_byte(rest[19])?;
            check_total(total, RESPONSE_HEADER_LEN + body_len + error_len)?;
            let body = read_bytes(reader, body_len)?;
            let error = read_string(reader, error_len)?;
            Ok(Message::Response {
                correlation,
                status,
                success,
                format,
                body,
                error,
            })
        }
        msg_type::SHUTDOWN => {
            let mut rest = [0u8; 8];
            reader.read_exact(&mut rest)?;
            Ok(Message::Shutdown)
        }
        msg_type::WS_CONNECT | msg_type::WS_MESSAGE | msg_type::WS_DISCONNECT => {
            let mut rest = [0u8; WS_EVENT_HEADER_LEN - 1];
            reader.read_exact(&mut rest)?;
            let connection = u64_at(&rest, 0);
            let total = u32_at(&rest, 8) as usize;
            let path_len = u32_at(&rest, 12) as usize;
            let payload_len = u32_at(&rest, 16) as usize;
            let binary = rest[20] != 0;
            check_total(total, WS_EVENT_HEADER_LEN + path_len + payload_len)?;
            let path = read_string(reader, path_len)?;
            let payload = read_bytes(reader, payload_len)?;
            Ok(match kind {
                msg_type::WS_CONNECT => Message::WsConnect { connection, path },
                msg_type::WS_MESSAGE => Message::WsMessage {
                    connection,
                    path,
                    payload,
                    binary,
                },
                _ => Message::WsDisconnect { connection },
            })
        }
        msg_type::WS_SEND | msg_type::WS_CLOSE => {
            let mut rest = [0u8; WS_RESPONSE_HEADER_LEN - 1];
            reader.read_exact(&mut rest)?;
            let connection = u64_at(&rest, 0);
            let total = u32_at(&rest, 8) as usize;
            let payload_len = u32_at(&rest, 12) as usize;
            let code = u16::from_le_bytes([rest[16], rest[17]]);
            let binary = rest[18] != 0;
            check_total(total, WS_RESPONSE_HEADER_LEN + payload_len)?;
            let payload = read_bytes(reader, payload_len)?;
            Ok(if kind == msg_type::WS_SEND {
                Message::WsSend {
                    connection,
                    payload,
                    binary,
                }
            } else {
                Message::WsClose { connection, code }
            })
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown ipc message type {}", other),
        )),
    }
}

fn check_total(total: usize, expected: usize) -> io::Result<()> {
    if total != expected || total > MAX_MESSAGE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "ipc message length mismatch",
        ));
    }
    Ok(())
}

fn read_bytes(reader: &mut impl Read, len: usize) -> io::Result<Vec<u8>> {
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn read_string(reader: &mut impl Read, len: usize) -> io::Result<String> {
    String::from_utf8(read_bytes(reader, len)?)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "ipc string not utf-8"))
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn u64_at(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let encoded = encode(&msg);
        let mut reader = encoded.as_slice();
        let decoded = read_message(&mut reader).unwrap();
        assert_eq!(decoded, msg);
        assert!(reader.is_empty(), "reader fully consumed");
    }

    #[test]
    fn request_roundtrip() {
        roundtrip(Message::Request {
            correlation: 42,
            module: "shop".into(),
            function: "checkout".into(),
            format: ArgsFormat::Binary,
            args: vec![0xFA, 0, 0],
        });
    }

    #[test]
    fn response_roundtrip() {
        roundtrip(Message::Response {
            correlation: 42,
            status: 500,
            success: false,
            format: ArgsFormat::Text,
            body: b"{}".to_vec(),
            error: "boom".into(),
        });
    }

    #[test]
    fn shutdown_roundtrip() {
        roundtrip(Message::Shutdown);
    }

    #[test]
    fn ws_messages_roundtrip() {
        roundtrip(Message::WsConnect {
            connection: 7,
            path: "/feed".into(),
        });
        roundtrip(Message::WsMessage {
            connection: 7,
            path: "/feed".into(),
            payload: b"hello".to_vec(),
            binary: false,
        });
        roundtrip(Message::WsDisconnect { connection: 7 });
        roundtrip(Message::WsSend {
            connection: 7,
            payload: vec![1, 2, 3],
            binary: true,
        });
        roundtrip(Message::WsClose {
            connection: 7,
            code: 1001,
        });
    }

    #[test]
    fn unknown_type_rejected() {
        let mut reader: &[u8] = &[0xEE];
        assert!(read_message(&mut reader).is_err());
    }

    #[test]
    fn length_mismatch_rejected() {
        let encoded = encode(&Message::Request {
            correlation: 1,
            module: "m".into(),
            function: "f".into(),
            format: ArgsFormat::Text,
            args: vec![],
        });
        let mut bytes = encoded.as_slice().to_vec();
        // Corrupt the total length field.
        bytes[5] ^= 0xFF;
        let mut reader = bytes.as_slice();
        assert!(read_message(&mut reader).is_err());
    }
}
