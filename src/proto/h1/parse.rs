//! Request-head parsing over `httparse`.

use bytes::BytesMut;
use tracing::{debug, trace};

use crate::error::{Error, Parse};
use crate::proto::{Headers, Method, Request, Version};

const MAX_HEADERS: usize = 100;

/// A parsed request head plus what the framing headers said about the
/// body.
pub(crate) struct ParsedHead {
    pub(crate) request: Request,
    pub(crate) content_length: usize,
    /// Bytes the head occupied, for buffer-capacity accounting.
    pub(crate) head_len: usize,
}

pub(crate) enum ParseStatus {
    /// Head complete; `buf` has been advanced past it.
    Complete(ParsedHead),
    /// More bytes needed.
    Partial,
}

/// Parses a request head out of the front of `buf`. On success the head
/// bytes are consumed from `buf`, leaving any body bytes in place.
pub(crate) fn parse_head(buf: &mut BytesMut) -> crate::Result<ParseStatus> {
    if buf.is_empty() {
        return Ok(ParseStatus::Partial);
    }
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    trace!("Request.parse([Header; {}], [u8; {}])", MAX_HEADERS, buf.len());
    let mut req = httparse::Request::new(&mut headers);
    let status = req.parse(buf).map_err(|err| {
        debug!("parse error: {}", err);
        match err {
            httparse::Error::HeaderName | httparse::Error::HeaderValue => {
                Error::new_parse(Parse::Header)
            }
            httparse::Error::Version => Error::new_parse(Parse::Version),
            httparse::Error::Token => Error::new_parse(Parse::Method),
            httparse::Error::TooManyHeaders => Error::new_too_large(),
            _ => Error::new_parse(Parse::Uri),
        }
    })?;

    let len = match status {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(ParseStatus::Partial),
    };
    trace!("Request.parse Complete({})", len);

    let method = Method::from_str_token(req.method.expect("method after Complete"));
    let path = req.path.expect("path after Complete").to_owned();
    let version = match req.version.expect("version after Complete") {
        0 => Version::Http10,
        1 => Version::Http11,
        _ => return Err(Error::new_parse(Parse::Version)),
    };

    let mut parsed_headers = Headers::with_capacity(req.headers.len());
    let mut content_length: Option<usize> = None;
    let mut chunked = false;
    for header in req.headers.iter() {
        let value = std::str::from_utf8(header.value)
            .map_err(|_| Error::new_parse(Parse::Header))?;
        if header.name.eq_ignore_ascii_case("content-length") {
            let parsed: usize = value
                .trim()
                .parse()
                .map_err(|_| Error::new_parse(Parse::Header))?;
            // Two differing Content-Length headers is malformed.
            if let Some(existing) = content_length {
                if existing != parsed {
                    return Err(Error::new_parse(Parse::Header));
                }
            }
            content_length = Some(parsed);
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = true;
        }
        parsed_headers.append(header.name, value);
    }

    if chunked {
        // Bodies are framed by Content-Length only; see the 411 path in
        // the connection.
        debug!("request with transfer-encoding, rejecting");
        return Err(Error::new_parse(Parse::Header).with(LengthRequired));
    }

    let _ = buf.split_to(len);

    let mut request = Request::new(method, path, version);
    request.headers = parsed_headers;
    Ok(ParseStatus::Complete(ParsedHead {
        request,
        content_length: content_length.unwrap_or(0),
        head_len: len,
    }))
}

/// Marker cause distinguishing a missing-length framing error, so the
/// connection can answer 411 instead of 400.
#[derive(Debug)]
pub(crate) struct LengthRequired;

impl std::fmt::Display for LengthRequired {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("length required")
    }
}

impl std::error::Error for LengthRequired {}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(bytes: &[u8]) -> crate::Result<ParseStatus> {
        let mut buf = BytesMut::from(bytes);
        parse_head(&mut buf)
    }

    #[test]
    fn simple_get() {
        let mut buf = BytesMut::from(&b"GET /a?x=1 HTTP/1.1\r\nHost: x\r\n\r\nrest"[..]);
        match parse_head(&mut buf).unwrap() {
            ParseStatus::Complete(head) => {
                assert_eq!(head.request.method, Method::Get);
                assert_eq!(head.request.path, "/a?x=1");
                assert_eq!(head.request.version, Version::Http11);
                assert_eq!(head.request.headers.get("host"), Some("x"));
                assert_eq!(head.content_length, 0);
            }
            ParseStatus::Partial => panic!("expected complete"),
        }
        // Head consumed, body bytes remain.
        assert_eq!(&buf[..], b"rest");
    }

    #[test]
    fn partial_head() {
        match parse(b"GET / HTT").unwrap() {
            ParseStatus::Partial => {}
            ParseStatus::Complete(_) => panic!("expected partial"),
        }
    }

    #[test]
    fn content_length_parsed() {
        match parse(b"POST /u HTTP/1.1\r\nContent-Length: 5\r\n\r\n").unwrap() {
            ParseStatus::Complete(head) => assert_eq!(head.content_length, 5),
            ParseStatus::Partial => panic!("expected complete"),
        }
    }

    #[test]
    fn bad_content_length_rejected() {
        assert!(parse(b"POST /u HTTP/1.1\r\nContent-Length: nope\r\n\r\n").is_err());
    }

    #[test]
    fn conflicting_content_lengths_rejected() {
        assert!(parse(
            b"POST /u HTTP/1.1\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n"
        )
        .is_err());
    }

    #[test]
    fn chunked_rejected() {
        assert!(parse(
            b"POST /u HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n"
        )
        .is_err());
    }

    #[test]
    fn byte_by_byte_equals_whole() {
        let raw = b"POST /items HTTP/1.1\r\nHost: example\r\nContent-Length: 3\r\n\r\nabc";
        // Whole-buffer parse.
        let mut whole = BytesMut::from(&raw[..]);
        let whole_head = match parse_head(&mut whole).unwrap() {
            ParseStatus::Complete(head) => head,
            ParseStatus::Partial => panic!("expected complete"),
        };
        // Byte-by-byte accumulation parses to the same head at the same
        // boundary.
        let mut buf = BytesMut::new();
        let mut parsed = None;
        for &b in raw.iter() {
            buf.extend_from_slice(&[b]);
            match parse_head(&mut buf).unwrap() {
                ParseStatus::Complete(head) => {
                    parsed = Some(head);
                    break;
                }
                ParseStatus::Partial => continue,
            }
        }
        let incremental = parsed.expect("head should complete");
        assert_eq!(incremental.request.method, whole_head.request.method);
        assert_eq!(incremental.request.path, whole_head.request.path);
        assert_eq!(incremental.content_length, whole_head.content_length);
        assert_eq!(
            incremental.request.headers.get("host"),
            whole_head.request.headers.get("host")
        );
    }
}
