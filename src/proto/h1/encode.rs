//! Response serialization.

use crate::proto::{Response, Version};

use super::date;

// totally scientific
const AVERAGE_HEADER_SIZE: usize = 30;

/// Serializes `resp` into `dst` as a single contiguous buffer: status
/// line, headers exactly as the handler wrote them (case and order
/// preserved), then the framing headers the handler left out:
/// `Content-Length` when the body is non-empty, `Connection` per the
/// computed keep-alive decision, and `Date`.
pub(crate) fn encode_response(
    resp: &Response,
    version: Version,
    keep_alive: bool,
    dst: &mut Vec<u8>,
) {
    let init_cap = 30 + resp.body.len() + resp.headers.len() * AVERAGE_HEADER_SIZE;
    dst.reserve(init_cap);

    if version == Version::Http11 && resp.status == 200 && resp.reason.is_none() {
        dst.extend_from_slice(b"HTTP/1.1 200 OK\r\n");
    } else {
        dst.extend_from_slice(match version {
            Version::Http10 => b"HTTP/1.0 ",
            Version::Http11 => b"HTTP/1.1 ",
        });
        let mut status = itoa::Buffer::new();
        dst.extend_from_slice(status.format(resp.status).as_bytes());
        dst.push(b' ');
        dst.extend_from_slice(resp.reason_str().as_bytes());
        dst.extend_from_slice(b"\r\n");
    }

    for (name, value) in resp.headers.iter() {
        dst.extend_from_slice(name.as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }

    if !resp.body.is_empty() && !resp.headers.contains("content-length") {
        dst.extend_from_slice(b"Content-Length: ");
        let mut len = itoa::Buffer::new();
        dst.extend_from_slice(len.format(resp.body.len()).as_bytes());
        dst.extend_from_slice(b"\r\n");
    }

    if !resp.headers.contains("connection") && resp.websocket_upgrade.is_none() {
        if keep_alive {
            dst.extend_from_slice(b"Connection: keep-alive\r\n");
        } else {
            dst.extend_from_slice(b"Connection: close\r\n");
        }
    }

    if !resp.headers.contains("date") {
        dst.reserve(date::DATE_VALUE_LENGTH + 8);
        dst.extend_from_slice(b"Date: ");
        date::extend(dst);
        dst.extend_from_slice(b"\r\n");
    }

    dst.extend_from_slice(b"\r\n");
    dst.extend_from_slice(&resp.body);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Headers;

    fn encode(resp: &Response, keep_alive: bool) -> Vec<u8> {
        let mut dst = Vec::new();
        encode_response(resp, Version::Http11, keep_alive, &mut dst);
        dst
    }

    fn parse_headers(raw: &[u8]) -> (String, Headers, Vec<u8>) {
        let text = String::from_utf8(raw.to_vec()).unwrap();
        let head_end = text.find("\r\n\r\n").unwrap();
        let head = &text[..head_end];
        let body = raw[head_end + 4..].to_vec();
        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap().to_owned();
        let mut headers = Headers::new();
        for line in lines {
            let (name, value) = line.split_once(": ").unwrap();
            headers.append(name, value);
        }
        (status_line, headers, body)
    }

    #[test]
    fn adds_content_length_and_keep_alive() {
        let resp = Response::text("hello");
        let raw = encode(&resp, true);
        let (status, headers, body) = parse_headers(&raw);
        assert_eq!(status, "HTTP/1.1 200 OK");
        assert_eq!(headers.get("content-length"), Some("5"));
        assert_eq!(headers.get("connection"), Some("keep-alive"));
        assert!(headers.contains("date"));
        assert_eq!(body, b"hello");
    }

    #[test]
    fn close_when_not_keep_alive() {
        let resp = Response::new(404);
        let raw = encode(&resp, false);
        let (status, headers, body) = parse_headers(&raw);
        assert_eq!(status, "HTTP/1.1 404 Not Found");
        assert_eq!(headers.get("connection"), Some("close"));
        // Empty body gets no Content-Length.
        assert!(!headers.contains("content-length"));
        assert!(body.is_empty());
    }

    #[test]
    fn preserves_header_case_and_order() {
        let resp = Response::text("x")
            .with_header("X-First", "1")
            .with_header("x-second", "2");
        let raw = encode(&resp, true);
        let text = String::from_utf8(raw).unwrap();
        let first = text.find("X-First: 1").unwrap();
        let second = text.find("x-second: 2").unwrap();
        assert!(first < second);
    }

    #[test]
    fn explicit_framing_headers_not_duplicated() {
        let mut resp = Response::text("abc");
        resp.headers.set("Content-Length", "3");
        resp.headers.set("Connection", "close");
        let raw = encode(&resp, true);
        let text = String::from_utf8(raw).unwrap();
        assert_eq!(text.matches("Content-Length").count(), 1);
        assert_eq!(text.to_lowercase().matches("connection").count(), 1);
    }

    #[test]
    fn serialize_then_parse_round_trips() {
        let resp = Response::text("payload").with_header("X-Trace", "abc123");
        let raw = encode(&resp, true);
        // Feed the serialized response through httparse to confirm it
        // is a well-formed message with the expected header map.
        let mut headers = [httparse::EMPTY_HEADER; 16];
        let mut parsed = httparse::Response::new(&mut headers);
        let status = parsed.parse(&raw).unwrap();
        assert!(status.is_complete());
        assert_eq!(parsed.code, Some(200));
        let mut seen = Headers::new();
        for h in parsed.headers.iter() {
            seen.append(h.name, std::str::from_utf8(h.value).unwrap());
        }
        assert_eq!(seen.get("x-trace"), Some("abc123"));
        assert_eq!(seen.get("content-length"), Some("7"));
        assert_eq!(seen.get("connection"), Some("keep-alive"));
    }

    #[test]
    fn http10_version_line() {
        let resp = Response::text("x");
        let mut dst = Vec::new();
        encode_response(&resp, Version::Http10, false, &mut dst);
        assert!(dst.starts_with(b"HTTP/1.0 200 OK\r\n"));
    }
}
