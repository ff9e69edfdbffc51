//! The per-connection HTTP/1.1 state machine.
//!
//! Transport-agnostic: the dispatcher feeds it bytes from a plain or
//! TLS socket with [`Http1Conn::process_input`] and drains
//! [`Http1Conn::output`] back out. One request is in flight at a time;
//! pipelined bytes stay buffered until the current response commits.

use bytes::BytesMut;
use tracing::{debug, trace};

use crate::error::Error;
use crate::proto::ws::handshake;
use crate::proto::{Request, Response, Version};

use super::encode::encode_response;
use super::parse::{self, ParseStatus};

/// The default maximum read buffer size. If the buffer gets this big
/// and a message head is still not complete, a `TooLarge` error is
/// triggered.
pub(crate) const DEFAULT_MAX_BUF_SIZE: usize = 8192 + 4096 * 100;

/// The minimum value that can be set as the max buffer size.
pub(crate) const MINIMUM_MAX_BUF_SIZE: usize = 8192;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// Accumulating bytes until the request head parses.
    ReadingHead,
    /// Head parsed; accumulating `Content-Length` body bytes.
    ReadingBody,
    /// A request has been surfaced and its response not yet queued.
    Processing,
    /// Response bytes queued and not yet fully written.
    WritingResponse,
    /// Response written; parser and buffers reset for the next request.
    KeepAlive,
    /// A 101 has been fully written; the socket belongs to a WebSocket
    /// machine now.
    Upgrading,
    /// Terminal: close after flushing whatever is pending.
    Closing,
    Error,
}

/// What the caller should do once a response has fully flushed.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ResponseOutcome {
    /// Connection reset for the next request; check for pipelined input.
    KeepAlive,
    /// Close the socket.
    Close,
    /// Hand the socket to a WebSocket machine for this path.
    Upgrade(String),
}

pub(crate) struct Http1Conn {
    state: State,
    read_buf: BytesMut,
    max_buf_size: usize,
    /// Head of the request currently accumulating its body.
    partial: Option<(Request, usize)>,
    output: Vec<u8>,
    wrote: usize,
    keep_alive: bool,
    version: Version,
    pending_upgrade: Option<String>,
    requests_served: u64,
}

impl Http1Conn {
    pub(crate) fn new() -> Http1Conn {
        Http1Conn::with_max_buf_size(DEFAULT_MAX_BUF_SIZE)
    }

    pub(crate) fn with_max_buf_size(max: usize) -> Http1Conn {
        assert!(
            max >= MINIMUM_MAX_BUF_SIZE,
            "the max_buf_size cannot be smaller than {}",
            MINIMUM_MAX_BUF_SIZE,
        );
        Http1Conn {
            state: State::ReadingHead,
            read_buf: BytesMut::with_capacity(8192),
            max_buf_size: max,
            partial: None,
            output: Vec::new(),
            wrote: 0,
            keep_alive: true,
            version: Version::Http11,
            pending_upgrade: None,
            requests_served: 0,
        }
    }

    pub(crate) fn requests_served(&self) -> u64 {
        self.requests_served
    }

    pub(crate) fn is_closing(&self) -> bool {
        matches!(self.state, State::Closing | State::Error)
    }

    pub(crate) fn is_upgrading(&self) -> bool {
        self.state == State::Upgrading
    }

    /// Feeds bytes read from the socket. Returns a complete request at
    /// most once per call; call again with an empty slice to pick up a
    /// pipelined request after a response commits.
    pub(crate) fn process_input(&mut self, bytes: &[u8]) -> crate::Result<Option<Request>> {
        if !bytes.is_empty() {
            self.read_buf.extend_from_slice(bytes);
        }
        loop {
            match self.state {
                State::ReadingHead => {
                    match parse::parse_head(&mut self.read_buf) {
                        Ok(ParseStatus::Complete(head)) => {
                            if head.head_len > self.max_buf_size {
                                debug!(
                                    "head of {} exceeds max_buf_size ({})",
                                    head.head_len, self.max_buf_size
                                );
                                self.state = State::Error;
                                return Err(Error::new_too_large());
                            }
                            self.version = head.request.version;
                            self.keep_alive = head.request.should_keep_alive();
                            if head.content_length > self.max_buf_size {
                                debug!(
                                    "declared body of {} exceeds buffer capacity",
                                    head.content_length
                                );
                                self.state = State::Error;
                                return Err(Error::new_too_large());
                            }
                            self.partial = Some((head.request, head.content_length));
                            self.state = State::ReadingBody;
                        }
                        Ok(ParseStatus::Partial) => {
                            if self.read_buf.len() >= self.max_buf_size {
                                debug!(
                                    "max_buf_size ({}) reached, closing",
                                    self.max_buf_size
                                );
                                self.state = State::Error;
                                return Err(Error::new_too_large());
                            }
                            return Ok(None);
                        }
                        Err(err) => {
                            self.state = State::Error;
                            return Err(err);
                        }
                    }
                }
                State::ReadingBody => {
                    // The head was consumed from the buffer when it
                    // parsed, so the body always starts at offset zero
                    // regardless of how the input was chunked.
                    let needed = match self.partial {
                        Some((_, len)) => len,
                        None => {
                            self.state = State::Error;
                            return Err(Error::new_invalid_state());
                        }
                    };
                    if self.read_buf.len() < needed {
                        return Ok(None);
                    }
                    let (mut request, _) = self.partial.take().expect("partial checked above");
                    request.body = self.read_buf.split_to(needed).to_vec();
                    self.state = State::Processing;
                    trace!(
                        "request complete: {} {} ({} body bytes)",
                        request.method,
                        request.path,
                        request.body.len()
                    );
                    return Ok(Some(request));
                }
                // Bytes that arrive while a response is in flight stay
                // buffered for the next parse.
                _ => return Ok(None),
            }
        }
    }

    /// Queues the response for the request most recently surfaced.
    pub(crate) fn write_response(&mut self, resp: &Response) {
        debug_assert!(matches!(
            self.state,
            State::Processing | State::ReadingHead | State::ReadingBody
        ));
        if let Some(ref path) = resp.websocket_upgrade {
            self.pending_upgrade = Some(path.clone());
        }
        encode_response(resp, self.version, self.keep_alive, &mut self.output);
        self.state = State::WritingResponse;
    }

    /// Queues an error response and marks the connection for close.
    pub(crate) fn write_error_response(&mut self, err: &Error) {
        let status = status_for_error(err);
        let resp = Response::status_error(status);
        self.keep_alive = false;
        self.state = State::Processing;
        self.write_response(&resp);
    }

    pub(crate) fn has_pending_output(&self) -> bool {
        self.wrote < self.output.len()
    }

    /// The byte window still to be written.
    pub(crate) fn output(&self) -> &[u8] {
        &self.output[self.wrote..]
    }

    /// Advances the output window after a (possibly partial) write.
    /// When the response finishes, resets for keep-alive or reports the
    /// close/upgrade transition.
    pub(crate) fn consume_output(&mut self, n: usize) -> Option<ResponseOutcome> {
        self.wrote += n;
        debug_assert!(self.wrote <= self.output.len());
        if self.wrote < self.output.len() {
            return None;
        }
        self.output.clear();
        self.wrote = 0;
        if self.state != State::WritingResponse {
            return None;
        }
        self.requests_served += 1;
        if let Some(path) = self.pending_upgrade.take() {
            self.state = State::Upgrading;
            return Some(ResponseOutcome::Upgrade(path));
        }
        if self.keep_alive {
            self.state = State::ReadingHead;
            trace!("keep-alive, {} requests served", self.requests_served);
            Some(ResponseOutcome::KeepAlive)
        } else {
            self.state = State::Closing;
            Some(ResponseOutcome::Close)
        }
    }

    pub(crate) fn should_keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub(crate) fn is_websocket_upgrade(&self) -> bool {
        self.pending_upgrade.is_some()
    }

    pub(crate) fn websocket_path(&self) -> Option<&str> {
        self.pending_upgrade.as_deref()
    }

    /// Builds the 101 response for a request that carries a complete
    /// WebSocket handshake, or `None` when the request is not one.
    pub(crate) fn websocket_accept(req: &Request) -> Option<Response> {
        let key = handshake::upgrade_key(req)?;
        let mut resp = Response::new(101);
        resp.headers.append("Upgrade", "websocket");
        resp.headers.append("Connection", "Upgrade");
        resp.headers
            .append("Sec-WebSocket-Accept", handshake::accept_key(key));
        resp.websocket_upgrade = Some(req.route_path().to_owned());
        Some(resp)
    }
}

impl std::fmt::Debug for Http1Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http1Conn")
            .field("state", &self.state)
            .field("read_buf", &self.read_buf.len())
            .field("keep_alive", &self.keep_alive)
            .field("requests_served", &self.requests_served)
            .finish()
    }
}

fn status_for_error(err: &Error) -> u16 {
    use std::error::Error as _;
    if err.is_parse_too_large() {
        return 413;
    }
    if err.is_parse() {
        if err
            .source()
            .map(|cause| cause.is::<parse::LengthRequired>())
            .unwrap_or(false)
        {
            return 411;
        }
        return 400;
    }
    500
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Method;

    fn drain(conn: &mut Http1Conn) -> (Vec<u8>, Option<ResponseOutcome>) {
        let bytes = conn.output().to_vec();
        let outcome = conn.consume_output(bytes.len());
        (bytes, outcome)
    }

    #[test]
    fn two_pipelined_gets_keep_alive() {
        let mut conn = Http1Conn::new();
        let input = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n";

        let first = conn.process_input(input).unwrap().expect("first request");
        assert_eq!(first.path, "/a");
        conn.write_response(&Response::text("one"));
        let (bytes, outcome) = drain(&mut conn);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Connection: keep-alive"));
        assert_eq!(outcome, Some(ResponseOutcome::KeepAlive));

        // Second request parses from the already-buffered bytes,
        // starting immediately after the first request's last byte.
        let second = conn.process_input(&[]).unwrap().expect("second request");
        assert_eq!(second.path, "/b");
        conn.write_response(&Response::text("two"));
        let (_, outcome) = drain(&mut conn);
        assert_eq!(outcome, Some(ResponseOutcome::KeepAlive));
        assert_eq!(conn.requests_served(), 2);
    }

    #[test]
    fn connection_close_closes() {
        let mut conn = Http1Conn::new();
        let input = b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n";
        let req = conn.process_input(input).unwrap().expect("request");
        assert!(!req.should_keep_alive());
        conn.write_response(&Response::text("bye"));
        let (bytes, outcome) = drain(&mut conn);
        assert!(String::from_utf8(bytes).unwrap().contains("Connection: close"));
        assert_eq!(outcome, Some(ResponseOutcome::Close));
        assert!(conn.is_closing());
    }

    #[test]
    fn http10_defaults_to_close() {
        let mut conn = Http1Conn::new();
        let req = conn
            .process_input(b"GET / HTTP/1.0\r\n\r\n")
            .unwrap()
            .expect("request");
        assert_eq!(req.version, Version::Http10);
        conn.write_response(&Response::text("x"));
        let (_, outcome) = drain(&mut conn);
        assert_eq!(outcome, Some(ResponseOutcome::Close));
    }

    #[test]
    fn body_in_tiny_chunks() {
        let mut conn = Http1Conn::new();
        let raw = b"POST /u HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";
        let mut result = None;
        for &b in raw.iter() {
            if let Some(req) = conn.process_input(&[b]).unwrap() {
                result = Some(req);
            }
        }
        let req = result.expect("request should complete");
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.body, b"hello");
    }

    #[test]
    fn head_at_exactly_capacity_accepted() {
        let max = MINIMUM_MAX_BUF_SIZE;
        let mut conn = Http1Conn::with_max_buf_size(max);
        let skeleton = b"GET / HTTP/1.1\r\nX-Pad: \r\n\r\n";
        let pad = max - skeleton.len();
        let mut input = Vec::new();
        input.extend_from_slice(b"GET / HTTP/1.1\r\nX-Pad: ");
        input.extend(std::iter::repeat(b'a').take(pad));
        input.extend_from_slice(b"\r\n\r\n");
        assert_eq!(input.len(), max);
        let req = conn.process_input(&input).unwrap().expect("request");
        assert_eq!(req.header("x-pad").unwrap().len(), pad);
    }

    #[test]
    fn head_one_byte_over_capacity_is_413() {
        let max = MINIMUM_MAX_BUF_SIZE;
        let mut conn = Http1Conn::with_max_buf_size(max);
        // One byte more padding than fits: the final CRLFCRLF lands
        // just past capacity, so the head never completes in bounds.
        let mut input = Vec::new();
        input.extend_from_slice(b"GET / HTTP/1.1\r\nX-Pad: ");
        let pad = max - input.len() - 4 + 1;
        input.extend(std::iter::repeat(b'a').take(pad));
        input.extend_from_slice(b"\r\n\r\n");
        let err = conn.process_input(&input).unwrap_err();
        assert!(err.is_parse_too_large());
        conn.write_error_response(&err);
        let (bytes, outcome) = drain(&mut conn);
        assert!(String::from_utf8(bytes).unwrap().starts_with("HTTP/1.1 413"));
        assert_eq!(outcome, Some(ResponseOutcome::Close));
    }

    #[test]
    fn parse_error_is_400() {
        let mut conn = Http1Conn::new();
        let err = conn
            .process_input(b"GET / BANANA/9.9\r\n\r\n")
            .unwrap_err();
        conn.write_error_response(&err);
        let (bytes, _) = drain(&mut conn);
        assert!(String::from_utf8(bytes).unwrap().starts_with("HTTP/1.1 400"));
    }

    #[test]
    fn chunked_request_is_411() {
        let mut conn = Http1Conn::new();
        let err = conn
            .process_input(b"POST /u HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n")
            .unwrap_err();
        conn.write_error_response(&err);
        let (bytes, _) = drain(&mut conn);
        assert!(String::from_utf8(bytes).unwrap().starts_with("HTTP/1.1 411"));
    }

    #[test]
    fn websocket_upgrade_transition() {
        let mut conn = Http1Conn::new();
        let input = b"GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\
            Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\r\n";
        let req = conn.process_input(input).unwrap().expect("request");
        let resp = Http1Conn::websocket_accept(&req).expect("upgrade response");
        conn.write_response(&resp);
        assert!(conn.is_websocket_upgrade());
        assert_eq!(conn.websocket_path(), Some("/ws"));
        let (bytes, outcome) = drain(&mut conn);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        // No frame may be parsed before the 101 fully flushes; only now
        // does the socket belong to the WebSocket machine.
        assert_eq!(outcome, Some(ResponseOutcome::Upgrade("/ws".to_owned())));
        assert!(conn.is_upgrading());
    }

    #[test]
    fn non_upgrade_request_is_not_websocket() {
        let mut conn = Http1Conn::new();
        let req = conn
            .process_input(b"GET /ws HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap()
            .expect("request");
        assert!(Http1Conn::websocket_accept(&req).is_none());
        assert!(!conn.is_websocket_upgrade());
    }
}
