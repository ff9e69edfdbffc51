//! HTTP/3 over QUIC.
//!
//! QUIC itself (packet protection, DCID routing with per-connection
//! CID-length tracking, loss recovery, flow control) is the
//! `quinn-proto` collaborator consumed sans-io: the dispatcher
//! feeds datagrams in and carries generated datagrams back to the UDP
//! socket inside the same reactor callback. This module owns the
//! HTTP/3 layer on top: the control stream with SETTINGS, request
//! parsing from client bidi streams (HEADERS + DATA frames), QPACK
//! header coding with a zero-capacity dynamic table, and response
//! writing mirroring the HTTP/2 semantics.

pub(crate) mod frame;
pub(crate) mod huffman;
pub(crate) mod qpack;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use quinn_proto::{
    ConnectionEvent, ConnectionHandle, DatagramEvent, Dir, Endpoint, EndpointConfig, Event,
    ReadError, StreamEvent, StreamId, VarInt, WriteError,
};
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::proto::{Headers, Method, Request, Response, Version};

/// A datagram to put on the UDP socket.
#[derive(Debug)]
pub(crate) struct Packet {
    pub(crate) to: SocketAddr,
    pub(crate) payload: Vec<u8>,
}

/// A request that finished assembling on one stream.
#[derive(Debug)]
pub(crate) struct CompletedRequest {
    pub(crate) conn: ConnectionHandle,
    pub(crate) stream: StreamId,
    pub(crate) request: Request,
}

struct RequestState {
    buf: Vec<u8>,
    headers: Option<Vec<(String, String)>>,
    body: Vec<u8>,
    fin: bool,
    dispatched: bool,
}

impl RequestState {
    fn new() -> RequestState {
        RequestState {
            buf: Vec::new(),
            headers: None,
            body: Vec::new(),
            fin: false,
            dispatched: false,
        }
    }
}

struct UniStream {
    kind: Option<u64>,
    buf: Vec<u8>,
}

struct PendingWrite {
    bytes: Vec<u8>,
    offset: usize,
    finish: bool,
}

struct H3Conn {
    quic: quinn_proto::Connection,
    uni_in: HashMap<StreamId, UniStream>,
    requests: HashMap<StreamId, RequestState>,
    pending_out: HashMap<StreamId, PendingWrite>,
    control_opened: bool,
}

impl H3Conn {
    fn new(quic: quinn_proto::Connection) -> H3Conn {
        H3Conn {
            quic,
            uni_in: HashMap::new(),
            requests: HashMap::new(),
            pending_out: HashMap::new(),
            control_opened: false,
        }
    }
}

/// The per-reactor HTTP/3 endpoint: one UDP socket, many connections
/// keyed by the handles the QUIC collaborator derives from each
/// datagram's Destination Connection ID.
pub(crate) struct H3Endpoint {
    endpoint: Endpoint,
    connections: HashMap<ConnectionHandle, H3Conn>,
}

impl H3Endpoint {
    pub(crate) fn new(crypto: Arc<rustls::ServerConfig>) -> crate::Result<H3Endpoint> {
        let quic_crypto = quinn_proto::crypto::rustls::QuicServerConfig::try_from(crypto)
            .map_err(Error::new_h3)?;
        let server_config = quinn_proto::ServerConfig::with_crypto(Arc::new(quic_crypto));
        let endpoint = Endpoint::new(
            Arc::new(EndpointConfig::default()),
            Some(Arc::new(server_config)),
            true,
            None,
        );
        Ok(H3Endpoint {
            endpoint,
            connections: HashMap::new(),
        })
    }

    /// Feeds one inbound datagram, collecting any immediately generated
    /// outbound packets and completed requests. Runts shorter than 5
    /// bytes are dropped without creating a connection.
    pub(crate) fn handle_datagram(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        data: &[u8],
        packets: &mut Vec<Packet>,
        completed: &mut Vec<CompletedRequest>,
    ) {
        if data.len() < 5 {
            trace!("dropping runt datagram ({} bytes)", data.len());
            return;
        }
        let mut response_buf = Vec::new();
        match self.endpoint.handle(
            now,
            remote,
            None,
            None,
            BytesMut::from(data),
            &mut response_buf,
        ) {
            Some(DatagramEvent::NewConnection(incoming)) => {
                let mut buf = Vec::new();
                match self.endpoint.accept(incoming, now, &mut buf, None) {
                    Ok((handle, conn)) => {
                        debug!("new h3 connection {:?} from {}", handle, remote);
                        self.connections.insert(handle, H3Conn::new(conn));
                    }
                    Err(err) => {
                        debug!("h3 accept refused: {}", err.cause);
                        if let Some(transmit) = err.response {
                            packets.push(Packet {
                                to: transmit.destination,
                                payload: buf[..transmit.size].to_vec(),
                            });
                        }
                    }
                }
            }
            Some(DatagramEvent::ConnectionEvent(handle, event)) => {
                if let Some(conn) = self.connections.get_mut(&handle) {
                    conn.quic.handle_event(event);
                }
            }
            Some(DatagramEvent::Response(transmit)) => {
                packets.push(Packet {
                    to: transmit.destination,
                    payload: response_buf[..transmit.size].to_vec(),
                });
            }
            None => {}
        }
        self.drive(now, packets, completed);
    }

    /// Applies an expired connection timer.
    pub(crate) fn handle_timeout(
        &mut self,
        now: Instant,
        packets: &mut Vec<Packet>,
        completed: &mut Vec<CompletedRequest>,
    ) {
        for conn in self.connections.values_mut() {
            if let Some(deadline) = conn.quic.poll_timeout() {
                if deadline <= now {
                    conn.quic.handle_timeout(now);
                }
            }
        }
        self.drive(now, packets, completed);
    }

    /// The earliest timer deadline across connections.
    pub(crate) fn next_timeout(&mut self) -> Option<Instant> {
        self.connections
            .values_mut()
            .filter_map(|conn| conn.quic.poll_timeout())
            .min()
    }

    /// Queues a response on `stream` and flushes what flow control
    /// allows.
    pub(crate) fn write_response(
        &mut self,
        handle: ConnectionHandle,
        stream: StreamId,
        resp: &Response,
        now: Instant,
        packets: &mut Vec<Packet>,
    ) {
        let conn = match self.connections.get_mut(&handle) {
            Some(conn) => conn,
            None => {
                debug!("h3 response for closed connection {:?}", handle);
                return;
            }
        };
        let mut fields: Vec<(String, String)> =
            vec![(":status".to_owned(), resp.status.to_string())];
        for (name, value) in resp.headers.iter() {
            if name.eq_ignore_ascii_case("connection") || name.eq_ignore_ascii_case("keep-alive")
            {
                continue;
            }
            fields.push((name.to_ascii_lowercase(), value.to_owned()));
        }
        if !resp.body.is_empty() && !resp.headers.contains("content-length") {
            fields.push(("content-length".to_owned(), resp.body.len().to_string()));
        }

        let mut bytes = Vec::with_capacity(resp.body.len() + 64);
        let section = qpack::encode_field_section(&fields);
        frame::encode_frame(&mut bytes, frame::FRAME_HEADERS, &section);
        if !resp.body.is_empty() {
            frame::encode_frame(&mut bytes, frame::FRAME_DATA, &resp.body);
        }
        conn.queue_write(stream, bytes, true);
        let mut completed = Vec::new();
        self.drive(now, packets, &mut completed);
        debug_assert!(completed.is_empty());
    }

    /// Pumps every connection: application events, stream reads, the
    /// endpoint event loop, transmits, and removal of drained
    /// connections.
    fn drive(
        &mut self,
        now: Instant,
        packets: &mut Vec<Packet>,
        completed: &mut Vec<CompletedRequest>,
    ) {
        let H3Endpoint {
            endpoint,
            connections,
        } = self;
        let mut drained = Vec::new();
        for (&handle, conn) in connections.iter_mut() {
            conn.process(handle, completed);

            // Endpoint event loop: connection-sourced events may
            // produce events to feed straight back.
            while let Some(event) = conn.quic.poll_endpoint_events() {
                if let Some(reply) = endpoint.handle_event(handle, event) {
                    conn.quic.handle_event(reply);
                }
            }

            let mut buf = Vec::new();
            while let Some(transmit) = conn.quic.poll_transmit(now, 1, &mut buf) {
                packets.push(Packet {
                    to: transmit.destination,
                    payload: buf[..transmit.size].to_vec(),
                });
                buf.clear();
            }

            if conn.quic.is_drained() {
                drained.push(handle);
            }
        }
        for handle in drained {
            debug!("h3 connection {:?} drained", handle);
            connections.remove(&handle);
        }
    }

}

impl fmt::Debug for H3Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("H3Endpoint")
            .field("connections", &self.connections.len())
            .finish()
    }
}

impl H3Conn {
    fn process(&mut self, handle: ConnectionHandle, completed: &mut Vec<CompletedRequest>) {
        let mut readable: HashSet<StreamId> = HashSet::new();
        while let Some(event) = self.quic.poll() {
            match event {
                Event::Connected => {
                    trace!("h3 connection {:?} established", handle);
                    self.open_control();
                }
                Event::Stream(StreamEvent::Readable { id }) => {
                    readable.insert(id);
                }
                Event::Stream(StreamEvent::Writable { id }) => {
                    self.flush_stream(id);
                }
                Event::Stream(StreamEvent::Opened { .. })
                | Event::Stream(StreamEvent::Available { .. }) => {}
                Event::Stream(StreamEvent::Finished { .. })
                | Event::Stream(StreamEvent::Stopped { .. }) => {}
                Event::ConnectionLost { reason } => {
                    debug!("h3 connection {:?} lost: {}", handle, reason);
                }
                _ => {}
            }
        }

        while let Some(id) = self.quic.streams().accept(Dir::Bi) {
            trace!("h3 request stream {:?}", id);
            self.requests.insert(id, RequestState::new());
            readable.insert(id);
        }
        while let Some(id) = self.quic.streams().accept(Dir::Uni) {
            self.uni_in.insert(id, UniStream {
                kind: None,
                buf: Vec::new(),
            });
            readable.insert(id);
        }

        for id in readable {
            self.read_stream(id, handle, completed);
        }
    }

    fn open_control(&mut self) {
        if self.control_opened {
            return;
        }
        if let Some(id) = self.quic.streams().open(Dir::Uni) {
            let mut bytes = Vec::new();
            frame::encode_varint(&mut bytes, frame::STREAM_TYPE_CONTROL);
            frame::encode_frame(&mut bytes, frame::FRAME_SETTINGS, &frame::server_settings());
            self.queue_write(id, bytes, false);
            self.control_opened = true;
        } else {
            warn!("peer refused a unidirectional control stream");
        }
    }

    fn read_stream(
        &mut self,
        id: StreamId,
        handle: ConnectionHandle,
        completed: &mut Vec<CompletedRequest>,
    ) {
        let mut received = Vec::new();
        let mut fin = false;
        {
            let mut recv = self.quic.recv_stream(id);
            let mut chunks = match recv.read(true) {
                Ok(chunks) => chunks,
                Err(_) => return,
            };
            loop {
                match chunks.next(64 * 1024) {
                    Ok(Some(chunk)) => received.extend_from_slice(&chunk.bytes),
                    Ok(None) => {
                        fin = true;
                        break;
                    }
                    Err(ReadError::Blocked) => break,
                    Err(err) => {
                        debug!("h3 stream {:?} read error: {}", id, err);
                        break;
                    }
                }
            }
            let _ = chunks.finalize();
        }

        if id.dir() == Dir::Uni {
            self.read_uni(id, &received);
            return;
        }

        let mut state = match self.requests.remove(&id) {
            Some(state) => state,
            None => return,
        };
        state.buf.extend_from_slice(&received);
        state.fin |= fin;

        loop {
            match frame::parse_frame(&state.buf) {
                Ok(Some((parsed, consumed))) => {
                    state.buf.drain(..consumed);
                    match parsed.kind {
                        frame::FRAME_HEADERS if state.headers.is_none() => {
                            match qpack::decode_field_section(&parsed.payload) {
                                Ok(fields) => state.headers = Some(fields),
                                Err(err) => {
                                    debug!("qpack error on {:?}: {}", id, err);
                                    self.reset_stream(id);
                                    return;
                                }
                            }
                        }
                        frame::FRAME_HEADERS => {
                            // Trailers; nothing consumes them.
                        }
                        frame::FRAME_DATA => state.body.extend_from_slice(&parsed.payload),
                        other => trace!("ignoring h3 frame type {:#x} on {:?}", other, id),
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!("h3 frame error on {:?}: {}", id, err);
                    self.reset_stream(id);
                    return;
                }
            }
        }

        if state.fin && !state.dispatched {
            if let Some(fields) = state.headers.take() {
                state.dispatched = true;
                let body = std::mem::take(&mut state.body);
                match build_request(fields, body) {
                    Ok(request) => completed.push(CompletedRequest {
                        conn: handle,
                        stream: id,
                        request,
                    }),
                    Err(err) => {
                        debug!("malformed h3 request on {:?}: {}", id, err);
                        self.reset_stream(id);
                        return;
                    }
                }
            }
        }
        self.requests.insert(id, state);
    }

    fn read_uni(&mut self, id: StreamId, received: &[u8]) {
        let stream = match self.uni_in.get_mut(&id) {
            Some(stream) => stream,
            None => return,
        };
        stream.buf.extend_from_slice(received);
        if stream.kind.is_none() {
            if let Some((kind, consumed)) = frame::decode_varint(&stream.buf) {
                stream.buf.drain(..consumed);
                stream.kind = Some(kind);
                trace!("h3 uni stream {:?} type {:#x}", id, kind);
            } else {
                return;
            }
        }
        match stream.kind {
            Some(frame::STREAM_TYPE_CONTROL) => {
                // SETTINGS and other control frames; applied and
                // forgotten since we keep no dynamic state from them.
                while let Ok(Some((parsed, consumed))) = frame::parse_frame(&stream.buf) {
                    stream.buf.drain(..consumed);
                    match parsed.kind {
                        frame::FRAME_SETTINGS => {
                            if let Ok(settings) = frame::parse_settings(&parsed.payload) {
                                trace!("peer h3 settings: {:?}", settings);
                            }
                        }
                        frame::FRAME_GOAWAY
                        | frame::FRAME_CANCEL_PUSH
                        | frame::FRAME_MAX_PUSH_ID => {
                            trace!("control frame {:#x} on {:?}", parsed.kind, id);
                        }
                        other => trace!("ignoring control frame {:#x}", other),
                    }
                }
            }
            Some(frame::STREAM_TYPE_QPACK_ENCODER) | Some(frame::STREAM_TYPE_QPACK_DECODER) => {
                // Dynamic-table instructions are impossible at capacity
                // zero; drop the bytes.
                stream.buf.clear();
            }
            Some(frame::STREAM_TYPE_PUSH) => {
                // Clients may not open push streams; ignore the bytes.
                stream.buf.clear();
            }
            _ => {
                // Unknown extension streams.
                stream.buf.clear();
            }
        }
    }

    fn reset_stream(&mut self, id: StreamId) {
        self.requests.remove(&id);
        // H3_MESSAGE_ERROR
        let _ = self.quic.recv_stream(id).stop(VarInt::from_u32(0x010E));
    }

    fn queue_write(&mut self, id: StreamId, bytes: Vec<u8>, finish: bool) {
        match self.pending_out.get_mut(&id) {
            Some(pending) => {
                pending.bytes.extend_from_slice(&bytes);
                pending.finish |= finish;
            }
            None => {
                self.pending_out.insert(id, PendingWrite {
                    bytes,
                    offset: 0,
                    finish,
                });
            }
        }
        self.flush_stream(id);
    }

    fn flush_stream(&mut self, id: StreamId) {
        let pending = match self.pending_out.get_mut(&id) {
            Some(pending) => pending,
            None => return,
        };
        let mut send = self.quic.send_stream(id);
        while pending.offset < pending.bytes.len() {
            match send.write(&pending.bytes[pending.offset..]) {
                Ok(n) => pending.offset += n,
                Err(WriteError::Blocked) => return,
                Err(err) => {
                    debug!("h3 stream {:?} write error: {}", id, err);
                    self.pending_out.remove(&id);
                    return;
                }
            }
        }
        if pending.finish {
            let _ = send.finish();
        }
        self.pending_out.remove(&id);
    }
}

fn build_request(fields: Vec<(String, String)>, body: Vec<u8>) -> crate::Result<Request> {
    let mut method = None;
    let mut path = None;
    let mut authority = None;
    let mut headers = Headers::with_capacity(fields.len());
    for (name, value) in fields {
        match name.as_str() {
            ":method" => method = Some(Method::from_str_token(&value)),
            ":path" => path = Some(value),
            ":authority" => authority = Some(value),
            ":scheme" => {}
            _ => headers.append(name, value),
        }
    }
    let method = method.ok_or_else(|| Error::new_parse(crate::error::Parse::Header))?;
    let path = path.ok_or_else(|| Error::new_parse(crate::error::Parse::Header))?;
    let mut request = Request::new(method, path, Version::Http11);
    if let Some(authority) = authority {
        headers.append("host", authority);
    }
    request.headers = headers;
    request.body = body;
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_request_from_pseudo_headers() {
        let fields = vec![
            (":method".to_owned(), "POST".to_owned()),
            (":scheme".to_owned(), "https".to_owned()),
            (":path".to_owned(), "/submit?x=1".to_owned()),
            (":authority".to_owned(), "example.com".to_owned()),
            ("content-type".to_owned(), "application/json".to_owned()),
        ];
        let request = build_request(fields, b"{}".to_vec()).unwrap();
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.route_path(), "/submit");
        assert_eq!(request.header("host"), Some("example.com"));
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.body, b"{}");
    }

    #[test]
    fn missing_pseudo_headers_rejected() {
        let fields = vec![(":method".to_owned(), "GET".to_owned())];
        assert!(build_request(fields, Vec::new()).is_err());
    }
}
