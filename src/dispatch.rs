//! The protocol dispatcher.
//!
//! One dispatcher drives one reactor thread. It owns that thread's
//! listeners and every accepted connection, selects the protocol state
//! machine per connection (cleartext HTTP/1.1; TLS then HTTP/1.1 or an
//! HTTP/2 task by ALPN; UDP datagrams into the QUIC endpoint), and
//! carries responses back out. Connections are plain values in a map
//! owned here: no other thread ever touches them, and cross-thread
//! traffic arrives only through the resumer and the WebSocket bridge
//! pipe.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Instant;

use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::unix::pipe;
use mio::Interest;
use tracing::{debug, trace, warn};

use crate::app::{App, Disposition, WsBinding, WsHandler, WsSink};
use crate::bridge::{self, Registry, WsOutbound};
use crate::error::Error;
use crate::proto::h1::{Http1Conn, ResponseOutcome};
use crate::proto::h2::H2Server;
use crate::proto::h3::{CompletedRequest, H3Endpoint, Packet};
use crate::proto::ws::{WsConn, WsEvent};
use crate::proto::{Request, Response};
use crate::runtime::io::AsyncTcp;
use crate::runtime::queue::MpmcQueue;
use crate::runtime::reactor::{Driver, LocalHandle, Reactor};
use crate::tls::{self, AlpnProtocol, HandshakeStatus, PlainRead, TlsAdapter, TlsStream};
use crate::worker::{Message, WorkerPool};

/// Timer key reserved for the QUIC endpoint's earliest deadline.
const H3_TIMER: u64 = u64::MAX;

/// What a transport-level read produced.
enum ReadOutcome {
    Open,
    PeerClosed,
}

/// A socket plus its optional TLS record layer and the bytes pending
/// write. Identical call sites for plain and TLS connections.
struct Transport {
    io: TcpStream,
    tls: Option<TlsAdapter>,
    out: Vec<u8>,
    wrote: usize,
}

impl Transport {
    fn plain(io: TcpStream) -> Transport {
        Transport {
            io,
            tls: None,
            out: Vec::new(),
            wrote: 0,
        }
    }

    fn tls(io: TcpStream, adapter: TlsAdapter) -> Transport {
        Transport {
            io,
            tls: Some(adapter),
            out: Vec::new(),
            wrote: 0,
        }
    }

    /// Drains the socket to `WouldBlock`, appending plaintext to
    /// `plain`. While `extract_plain` is false (ALPN not settled yet)
    /// decrypted bytes stay inside the record layer so they can follow
    /// the session to whichever machine wins.
    fn read_available(
        &mut self,
        plain: &mut Vec<u8>,
        extract_plain: bool,
    ) -> crate::Result<ReadOutcome> {
        let mut chunk = [0u8; 16 * 1024];
        let mut closed = false;
        loop {
            match self.io.read(&mut chunk) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => match self.tls {
                    Some(ref mut adapter) => adapter.process_incoming(&chunk[..n])?,
                    None => plain.extend_from_slice(&chunk[..n]),
                },
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::new_io(err)),
            }
        }
        if extract_plain {
            if let Some(ref mut adapter) = self.tls {
                match adapter.read_plaintext(plain)? {
                    PlainRead::Closed => closed = true,
                    PlainRead::Data(_) | PlainRead::Pending => {}
                }
            }
        }
        if closed {
            Ok(ReadOutcome::PeerClosed)
        } else {
            Ok(ReadOutcome::Open)
        }
    }

    /// Buffers plaintext for the socket, encrypting when TLS is on.
    fn queue(&mut self, bytes: &[u8]) -> crate::Result<()> {
        match self.tls {
            Some(ref mut adapter) => {
                adapter.write_plaintext(bytes)?;
                adapter.write_outgoing(&mut self.out)?;
            }
            None => self.out.extend_from_slice(bytes),
        }
        Ok(())
    }

    /// Moves any ciphertext the record layer is holding (handshake
    /// flights, close notify) into the write buffer.
    fn pump_tls(&mut self) -> crate::Result<()> {
        if let Some(ref mut adapter) = self.tls {
            adapter.write_outgoing(&mut self.out)?;
        }
        Ok(())
    }

    /// Writes buffered bytes until drained or `WouldBlock`. Returns
    /// true when nothing is left.
    fn flush(&mut self) -> crate::Result<bool> {
        while self.wrote < self.out.len() {
            match self.io.write(&self.out[self.wrote..]) {
                Ok(n) => self.wrote += n,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::new_io(err)),
            }
        }
        self.out.clear();
        self.wrote = 0;
        Ok(true)
    }

    fn has_pending(&self) -> bool {
        self.wrote < self.out.len()
    }
}

/// The WebSocket endpoint behavior chosen at upgrade.
#[derive(Clone)]
enum WsRole {
    Local(Arc<dyn WsHandler>),
    Worker,
}

enum Proto {
    /// TLS accepted, ALPN not settled yet.
    TlsHandshake,
    H1 {
        machine: Http1Conn,
        /// Response outcome waiting for the transport to drain.
        outcome: Option<ResponseOutcome>,
    },
    Ws {
        connection_id: u64,
        machine: WsConn,
        role: WsRole,
    },
}

struct Conn {
    transport: Transport,
    proto: Proto,
}

/// Lets in-process WebSocket handlers push frames onto the owning
/// connection's send queue.
struct MachineSink<'a> {
    machine: &'a mut WsConn,
    connection_id: u64,
}

impl WsSink for MachineSink<'_> {
    fn send_text(&mut self, text: &str) {
        self.machine.send_text(text);
    }

    fn send_binary(&mut self, data: &[u8]) {
        self.machine.send_binary(data);
    }

    fn close(&mut self, code: u16, reason: &str) {
        self.machine.close(code, reason);
    }

    fn connection_id(&self) -> u64 {
        self.connection_id
    }
}

struct UdpState {
    key: usize,
    socket: UdpSocket,
    endpoint: H3Endpoint,
    /// Responses produced by suspended coroutines, applied on the next
    /// pass over the UDP socket.
    responses: Rc<RefCell<Vec<(quinn_proto::ConnectionHandle, quinn_proto::StreamId, Response)>>>,
}

pub(crate) struct Dispatcher {
    app: Arc<App>,
    pool: Option<Arc<WorkerPool>>,
    bridge: Arc<Registry>,
    bridge_index: usize,
    max_buf_size: usize,
    local: LocalHandle,
    http_key: Option<usize>,
    http_listener: Option<TcpListener>,
    tls_key: Option<usize>,
    tls_listener: Option<TcpListener>,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    udp: Option<UdpState>,
    bridge_key: Option<usize>,
    bridge_rx: Option<pipe::Receiver>,
    ws_queue: MpmcQueue<WsOutbound>,
    conns: HashMap<usize, Rc<RefCell<Conn>>>,
    /// Reactor-thread-local reverse map for the bridge.
    ws_index: HashMap<u64, usize>,
}

impl Dispatcher {
    /// Builds the dispatcher and registers its listeners and bridge
    /// pipe with the reactor.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        reactor: &mut Reactor,
        app: Arc<App>,
        pool: Option<Arc<WorkerPool>>,
        bridge: Arc<Registry>,
        max_buf_size: usize,
        http_listener: Option<TcpListener>,
        tls_listener: Option<TcpListener>,
        tls_config: Option<Arc<rustls::ServerConfig>>,
        udp_socket: Option<UdpSocket>,
        h3_config: Option<Arc<rustls::ServerConfig>>,
    ) -> crate::Result<Dispatcher> {
        let ws_queue = MpmcQueue::new(1024);
        let (pipe_tx, mut pipe_rx) = pipe::new().map_err(Error::new_listen)?;
        let bridge_index = bridge.register_reactor(ws_queue.clone(), pipe_tx);
        let bridge_key = reactor
            .register_machine(&mut pipe_rx, Interest::READABLE)
            .map_err(Error::new_listen)?;

        let mut dispatcher = Dispatcher {
            app,
            pool,
            bridge,
            bridge_index,
            max_buf_size,
            local: reactor.local_handle(),
            http_key: None,
            http_listener: None,
            tls_key: None,
            tls_listener: None,
            tls_config,
            udp: None,
            bridge_key: Some(bridge_key),
            bridge_rx: Some(pipe_rx),
            ws_queue,
            conns: HashMap::new(),
            ws_index: HashMap::new(),
        };

        if let Some(mut listener) = http_listener {
            let key = reactor
                .register_machine(&mut listener, Interest::READABLE)
                .map_err(Error::new_listen)?;
            dispatcher.http_key = Some(key);
            dispatcher.http_listener = Some(listener);
        }
        if let Some(mut listener) = tls_listener {
            let key = reactor
                .register_machine(&mut listener, Interest::READABLE)
                .map_err(Error::new_listen)?;
            dispatcher.tls_key = Some(key);
            dispatcher.tls_listener = Some(listener);
        }
        if let Some(mut socket) = udp_socket {
            let config = h3_config.ok_or_else(Error::new_invalid_state)?;
            let key = reactor
                .register_machine(&mut socket, Interest::READABLE)
                .map_err(Error::new_listen)?;
            dispatcher.udp = Some(UdpState {
                key,
                socket,
                endpoint: H3Endpoint::new(config)?,
                responses: Rc::new(RefCell::new(Vec::new())),
            });
        }
        Ok(dispatcher)
    }

    fn accept_loop(&mut self, reactor: &mut Reactor, secure: bool) {
        loop {
            let listener = if secure {
                self.tls_listener.as_ref()
            } else {
                self.http_listener.as_ref()
            };
            let listener = match listener {
                Some(listener) => listener,
                None => return,
            };
            let (mut stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("accept error: {}", err);
                    return;
                }
            };
            let key = match reactor
                .register_machine(&mut stream, Interest::READABLE | Interest::WRITABLE)
            {
                Ok(key) => key,
                Err(err) => {
                    warn!("register error for {}: {}", peer, err);
                    continue;
                }
            };
            trace!("accepted {} (key {}, tls={})", peer, key, secure);
            let conn = if secure {
                let config = match self.tls_config {
                    Some(ref config) => config.clone(),
                    None => continue,
                };
                let adapter = match TlsAdapter::new(config) {
                    Ok(adapter) => adapter,
                    Err(err) => {
                        warn!("tls session error: {}", err);
                        reactor.deregister(key, &mut stream);
                        continue;
                    }
                };
                Conn {
                    transport: Transport::tls(stream, adapter),
                    proto: Proto::TlsHandshake,
                }
            } else {
                Conn {
                    transport: Transport::plain(stream),
                    proto: Proto::H1 {
                        machine: Http1Conn::with_max_buf_size(self.max_buf_size),
                        outcome: None,
                    },
                }
            };
            self.conns.insert(key, Rc::new(RefCell::new(conn)));
        }
    }

    fn conn_ready(&mut self, reactor: &mut Reactor, key: usize, readable: bool, writable: bool) {
        let conn_rc = match self.conns.get(&key) {
            Some(rc) => rc.clone(),
            None => return,
        };

        if writable {
            if let Err(err) = self.pump_pending(reactor, key, &conn_rc) {
                if err.is_parse() {
                    // A pipelined request that failed to parse still
                    // draws its status response before the close.
                    self.write_h1_error(reactor, key, &conn_rc, &err);
                } else {
                    self.teardown(reactor, key, Some(err));
                }
                return;
            }
            if !self.conns.contains_key(&key) {
                return;
            }
        }

        if readable {
            let mut plain = Vec::new();
            let outcome = {
                let mut conn = conn_rc.borrow_mut();
                let extract = !matches!(conn.proto, Proto::TlsHandshake);
                conn.transport.read_available(&mut plain, extract)
            };
            let closed = match outcome {
                Ok(ReadOutcome::Open) => false,
                Ok(ReadOutcome::PeerClosed) => true,
                Err(err) => {
                    self.teardown(reactor, key, Some(err));
                    return;
                }
            };
            if let Err(err) = self.process_plaintext(reactor, key, &conn_rc, &plain) {
                self.write_h1_error(reactor, key, &conn_rc, &err);
                return;
            }
            if closed && self.conns.contains_key(&key) {
                trace!("peer closed key {}", key);
                self.teardown(reactor, key, None);
            }
        }
    }

    /// Writable pass: moves whatever the state machine has serialized
    /// into the transport and flushes. Serves both genuine socket
    /// writability and the synthetic pass a resumed coroutine
    /// schedules after queueing its response.
    fn pump_pending(
        &mut self,
        reactor: &mut Reactor,
        key: usize,
        conn_rc: &Rc<RefCell<Conn>>,
    ) -> crate::Result<()> {
        enum Kind {
            Handshake,
            H1,
            Ws,
        }
        let kind = match conn_rc.borrow().proto {
            Proto::TlsHandshake => Kind::Handshake,
            Proto::H1 { .. } => Kind::H1,
            Proto::Ws { .. } => Kind::Ws,
        };
        match kind {
            Kind::Handshake => {
                let mut conn = conn_rc.borrow_mut();
                conn.transport.pump_tls()?;
                let _ = conn.transport.flush()?;
                Ok(())
            }
            Kind::H1 => self.pump_h1_output(reactor, key, conn_rc),
            Kind::Ws => {
                self.pump_ws_output(reactor, key, conn_rc)?;
                self.after_flush(reactor, key, conn_rc)
            }
        }
    }

    /// Feeds decrypted/plain input to the connection's state machine.
    fn process_plaintext(
        &mut self,
        reactor: &mut Reactor,
        key: usize,
        conn_rc: &Rc<RefCell<Conn>>,
        plain: &[u8],
    ) -> crate::Result<()> {
        enum Step {
            Handshake(Option<AlpnProtocol>),
            H1Requests(Vec<Request>),
            WsEvents(Vec<WsEvent>),
        }

        let step = {
            let mut conn = conn_rc.borrow_mut();
            let conn = &mut *conn;
            match conn.proto {
                Proto::TlsHandshake => {
                    let adapter = conn
                        .transport
                        .tls
                        .as_ref()
                        .ok_or_else(Error::new_invalid_state)?;
                    let alpn = match adapter.handshake() {
                        HandshakeStatus::Complete => Some(tls::select_protocol(
                            adapter.alpn_protocol(),
                        )),
                        HandshakeStatus::NeedsIo => None,
                    };
                    conn.transport.pump_tls()?;
                    let _ = conn.transport.flush()?;
                    Step::Handshake(alpn)
                }
                Proto::H1 {
                    ref mut machine, ..
                } => {
                    let mut requests = Vec::new();
                    if let Some(req) = machine.process_input(plain)? {
                        requests.push(req);
                    }
                    Step::H1Requests(requests)
                }
                Proto::Ws {
                    ref mut machine, ..
                } => Step::WsEvents(machine.handle_input(plain)?),
            }
        };

        match step {
            Step::Handshake(None) => Ok(()),
            Step::Handshake(Some(AlpnProtocol::Http1)) => {
                debug!("tls connection {} settled on http/1.1", key);
                {
                    let mut conn = conn_rc.borrow_mut();
                    conn.proto = Proto::H1 {
                        machine: Http1Conn::with_max_buf_size(self.max_buf_size),
                        outcome: None,
                    };
                }
                // Plaintext may already have arrived with the
                // handshake's last flight.
                let mut early = Vec::new();
                {
                    let mut conn = conn_rc.borrow_mut();
                    if let Some(ref mut adapter) = conn.transport.tls {
                        if let PlainRead::Closed = adapter.read_plaintext(&mut early)? {
                            drop(conn);
                            self.teardown(reactor, key, None);
                            return Ok(());
                        }
                    }
                }
                self.process_plaintext(reactor, key, conn_rc, &early)
            }
            Step::Handshake(Some(AlpnProtocol::Http2)) => {
                debug!("tls connection {} settled on h2", key);
                self.convert_to_h2(reactor, key)
            }
            Step::H1Requests(requests) => {
                for request in requests {
                    self.handle_h1_request(reactor, key, conn_rc, request)?;
                    if !self.conns.contains_key(&key) {
                        return Ok(());
                    }
                }
                Ok(())
            }
            Step::WsEvents(events) => {
                for event in events {
                    self.handle_ws_event(reactor, key, conn_rc, event)?;
                    if !self.conns.contains_key(&key) {
                        return Ok(());
                    }
                }
                self.pump_ws_output(reactor, key, conn_rc)
            }
        }
    }

    fn handle_h1_request(
        &mut self,
        reactor: &mut Reactor,
        key: usize,
        conn_rc: &Rc<RefCell<Conn>>,
        request: Request,
    ) -> crate::Result<()> {
        // A complete WebSocket handshake upgrades when a route exists.
        if let Some(upgrade) = Http1Conn::websocket_accept(&request) {
            let response = match self.app.ws_binding(request.route_path()) {
                Some(_) => upgrade,
                None => Response::status_error(404),
            };
            let mut conn = conn_rc.borrow_mut();
            if let Proto::H1 { ref mut machine, .. } = conn.proto {
                machine.write_response(&response);
            }
            drop(conn);
            return self.pump_h1_output(reactor, key, conn_rc);
        }

        match self.app.dispatch(self.pool.as_deref(), request) {
            Disposition::Ready(response) => {
                {
                    let mut conn = conn_rc.borrow_mut();
                    if let Proto::H1 { ref mut machine, .. } = conn.proto {
                        machine.write_response(&response);
                    }
                }
                self.pump_h1_output(reactor, key, conn_rc)
            }
            Disposition::Pending(rx) => {
                // Suspend: the coroutine resumes on this reactor when
                // the response reader resolves the promise, then asks
                // for a synthetic writable pass to serialize.
                let weak: Weak<RefCell<Conn>> = Rc::downgrade(conn_rc);
                let local = self.local.clone();
                reactor.spawn(async move {
                    let response = match rx.await {
                        Ok(Ok(response)) => response,
                        Ok(Err(err)) => {
                            debug!("worker dispatch failed: {}", err);
                            Response::internal_error("handler failed")
                        }
                        Err(_) => Response::internal_error("dispatch canceled"),
                    };
                    if let Some(conn_rc) = weak.upgrade() {
                        let mut conn = conn_rc.borrow_mut();
                        if let Proto::H1 { ref mut machine, .. } = conn.proto {
                            machine.write_response(&response);
                        }
                        drop(conn);
                        local.schedule_io(key, false, true);
                    } else {
                        trace!("connection closed before worker reply");
                    }
                });
                Ok(())
            }
        }
    }

    /// Moves serialized response bytes into the transport and acts on
    /// the response outcome once everything is on the wire.
    fn pump_h1_output(
        &mut self,
        reactor: &mut Reactor,
        key: usize,
        conn_rc: &Rc<RefCell<Conn>>,
    ) -> crate::Result<()> {
        {
            let mut conn = conn_rc.borrow_mut();
            let conn = &mut *conn;
            if let Proto::H1 {
                ref mut machine,
                ref mut outcome,
            } = conn.proto
            {
                let bytes = machine.output().to_vec();
                if !bytes.is_empty() {
                    conn.transport.queue(&bytes)?;
                    if let Some(finished) = machine.consume_output(bytes.len()) {
                        *outcome = Some(finished);
                    }
                }
            }
            let _ = conn.transport.flush()?;
        }
        self.after_flush(reactor, key, conn_rc)
    }

    /// Runs once the transport has no bytes left: applies a deferred
    /// response outcome (keep-alive reset, close, upgrade).
    fn after_flush(
        &mut self,
        reactor: &mut Reactor,
        key: usize,
        conn_rc: &Rc<RefCell<Conn>>,
    ) -> crate::Result<()> {
        let outcome = {
            let mut conn = conn_rc.borrow_mut();
            if conn.transport.has_pending() {
                return Ok(());
            }
            match conn.proto {
                Proto::H1 {
                    ref mut outcome, ..
                } => outcome.take(),
                Proto::Ws { ref machine, .. } => {
                    // A closing WebSocket with everything on the wire
                    // is done.
                    if machine.is_closing() && !machine.has_pending_output() {
                        drop(conn);
                        self.teardown(reactor, key, None);
                    }
                    return Ok(());
                }
                _ => None,
            }
        };
        match outcome {
            None => Ok(()),
            Some(ResponseOutcome::KeepAlive) => {
                // Pipelined bytes already buffered begin the next
                // request within this same callback.
                self.process_plaintext(reactor, key, conn_rc, &[])
            }
            Some(ResponseOutcome::Close) => {
                self.teardown(reactor, key, None);
                Ok(())
            }
            Some(ResponseOutcome::Upgrade(path)) => self.upgrade_to_ws(reactor, key, conn_rc, path),
        }
    }

    fn upgrade_to_ws(
        &mut self,
        reactor: &mut Reactor,
        key: usize,
        conn_rc: &Rc<RefCell<Conn>>,
        path: String,
    ) -> crate::Result<()> {
        let role = match self.app.ws_binding(&path) {
            Some(WsBinding::Local(handler)) => WsRole::Local(handler.clone()),
            Some(WsBinding::Worker) => WsRole::Worker,
            None => {
                self.teardown(reactor, key, None);
                return Ok(());
            }
        };
        let connection_id = bridge::next_connection_id();
        self.bridge.bind_connection(connection_id, self.bridge_index);
        self.ws_index.insert(connection_id, key);
        debug!(
            "key {} upgraded to websocket {} (connection {})",
            key, path, connection_id
        );
        {
            let mut conn = conn_rc.borrow_mut();
            conn.proto = Proto::Ws {
                connection_id,
                machine: WsConn::new(path.clone()),
                role: role.clone(),
            };
        }
        match role {
            WsRole::Local(handler) => {
                let mut conn = conn_rc.borrow_mut();
                if let Proto::Ws {
                    ref mut machine, ..
                } = conn.proto
                {
                    let mut sink = MachineSink {
                        machine,
                        connection_id,
                    };
                    handler.on_open(&mut sink);
                }
            }
            WsRole::Worker => {
                if let Some(ref pool) = self.pool {
                    pool.send_ws_event(&Message::WsConnect {
                        connection: connection_id,
                        path,
                    });
                }
            }
        }
        self.pump_ws_output(reactor, key, conn_rc)
    }

    fn handle_ws_event(
        &mut self,
        reactor: &mut Reactor,
        key: usize,
        conn_rc: &Rc<RefCell<Conn>>,
        event: WsEvent,
    ) -> crate::Result<()> {
        let mut close_after = false;
        {
            let mut conn = conn_rc.borrow_mut();
            if let Proto::Ws {
                connection_id,
                ref mut machine,
                ref role,
            } = conn.proto
            {
                match (&event, role) {
                    (WsEvent::Text(text), WsRole::Local(handler)) => {
                        let mut sink = MachineSink {
                            machine,
                            connection_id,
                        };
                        handler.on_text(&mut sink, text);
                    }
                    (WsEvent::Binary(data), WsRole::Local(handler)) => {
                        let mut sink = MachineSink {
                            machine,
                            connection_id,
                        };
                        handler.on_binary(&mut sink, data);
                    }
                    (WsEvent::Close { .. }, _) => {
                        close_after = true;
                    }
                    (WsEvent::Text(text), WsRole::Worker) => {
                        if let Some(ref pool) = self.pool {
                            pool.send_ws_event(&Message::WsMessage {
                                connection: connection_id,
                                path: machine.path().to_owned(),
                                payload: text.as_bytes().to_vec(),
                                binary: false,
                            });
                        }
                    }
                    (WsEvent::Binary(data), WsRole::Worker) => {
                        if let Some(ref pool) = self.pool {
                            pool.send_ws_event(&Message::WsMessage {
                                connection: connection_id,
                                path: machine.path().to_owned(),
                                payload: data.clone(),
                                binary: true,
                            });
                        }
                    }
                }
            }
        }
        if close_after {
            // Flush the mirrored close frame; once the transport
            // drains, `after_flush` drops the socket.
            let _ = self.pump_ws_output(reactor, key, conn_rc);
            self.after_flush(reactor, key, conn_rc)?;
        }
        Ok(())
    }

    fn pump_ws_output(
        &mut self,
        _reactor: &mut Reactor,
        _key: usize,
        conn_rc: &Rc<RefCell<Conn>>,
    ) -> crate::Result<()> {
        let mut conn = conn_rc.borrow_mut();
        let conn = &mut *conn;
        if let Proto::Ws {
            ref mut machine, ..
        } = conn.proto
        {
            while machine.has_pending_output() {
                let frame = machine.output().to_vec();
                conn.transport.queue(&frame)?;
                machine.consume_output(frame.len());
            }
        }
        let _ = conn.transport.flush()?;
        Ok(())
    }

    /// Hands the socket and TLS session to an HTTP/2 connection task.
    fn convert_to_h2(&mut self, reactor: &mut Reactor, key: usize) -> crate::Result<()> {
        let conn_rc = match self.conns.remove(&key) {
            Some(rc) => rc,
            None => return Ok(()),
        };
        let conn = match Rc::try_unwrap(conn_rc) {
            Ok(cell) => cell.into_inner(),
            Err(rc) => {
                // A task still holds the h1 connection; put it back.
                self.conns.insert(key, rc);
                return Err(Error::new_invalid_state());
            }
        };
        let Transport { io, tls, .. } = conn.transport;
        let adapter = tls.ok_or_else(Error::new_invalid_state)?;
        reactor.set_futures_mode(key);
        let stream = TlsStream::new(
            AsyncTcp::new(io, key, self.local.clone()),
            adapter.into_session(),
        );
        let server = H2Server::new(stream, self.app.clone(), self.pool.clone());
        reactor.spawn(server);
        Ok(())
    }

    fn write_h1_error(
        &mut self,
        reactor: &mut Reactor,
        key: usize,
        conn_rc: &Rc<RefCell<Conn>>,
        err: &Error,
    ) {
        debug!("connection {} error: {}", key, err);
        let is_h1 = {
            let mut conn = conn_rc.borrow_mut();
            match conn.proto {
                Proto::H1 { ref mut machine, .. } => {
                    machine.write_error_response(err);
                    true
                }
                _ => false,
            }
        };
        if is_h1 {
            // Flush the error response; the Close outcome tears down.
            if self.pump_h1_output(reactor, key, conn_rc).is_err() {
                self.teardown(reactor, key, None);
            }
        } else {
            self.teardown(reactor, key, None);
        }
    }

    fn teardown(&mut self, reactor: &mut Reactor, key: usize, err: Option<Error>) {
        let conn_rc = match self.conns.remove(&key) {
            Some(rc) => rc,
            None => return,
        };
        let errored = err.is_some();
        if let Some(err) = err {
            debug!("closing connection {}: {}", key, err);
        }
        let mut conn = conn_rc.borrow_mut();
        if let Proto::Ws {
            connection_id,
            ref role,
            ..
        } = conn.proto
        {
            self.bridge.unbind_connection(connection_id);
            self.ws_index.remove(&connection_id);
            match role {
                WsRole::Local(handler) => {
                    if errored {
                        handler.on_error(connection_id);
                    }
                    handler.on_close(connection_id);
                }
                WsRole::Worker => {
                    if let Some(ref pool) = self.pool {
                        pool.send_ws_event(&Message::WsDisconnect {
                            connection: connection_id,
                        });
                    }
                }
            }
        }
        if let Some(ref mut adapter) = conn.transport.tls {
            adapter.send_close_notify();
            let _ = conn.transport.pump_tls();
            let _ = conn.transport.flush();
        }
        reactor.deregister(key, &mut conn.transport.io);
    }

    fn bridge_ready(&mut self, reactor: &mut Reactor) {
        if let Some(ref mut rx) = self.bridge_rx {
            let mut sink = [0u8; 64];
            loop {
                match rx.read(&mut sink) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        warn!("bridge pipe read error: {}", err);
                        break;
                    }
                }
            }
        }
        while let Some(outbound) = self.ws_queue.try_pop() {
            let connection_id = outbound.connection();
            let key = match self.ws_index.get(&connection_id) {
                Some(&key) => key,
                None => {
                    debug!("ws record for departed connection {}", connection_id);
                    continue;
                }
            };
            let conn_rc = match self.conns.get(&key) {
                Some(rc) => rc.clone(),
                None => continue,
            };
            let mut close_requested = false;
            {
                let mut conn = conn_rc.borrow_mut();
                if let Proto::Ws {
                    ref mut machine, ..
                } = conn.proto
                {
                    match outbound {
                        WsOutbound::Send {
                            payload, binary, ..
                        } => {
                            if binary {
                                machine.send_binary(&payload);
                            } else {
                                match std::str::from_utf8(&payload) {
                                    Ok(text) => machine.send_text(text),
                                    Err(_) => machine.send_binary(&payload),
                                }
                            }
                        }
                        WsOutbound::Close { code, .. } => {
                            machine.close(code, "");
                            close_requested = true;
                        }
                    }
                }
            }
            // Write the framed bytes immediately; readiness handles the
            // rest if the socket is full.
            if self.pump_ws_output(reactor, key, &conn_rc).is_err() {
                self.teardown(reactor, key, None);
                continue;
            }
            if close_requested {
                let _ = self.after_flush(reactor, key, &conn_rc);
            }
        }
    }

    fn udp_ready(&mut self, reactor: &mut Reactor) {
        let now = Instant::now();
        let mut packets: Vec<Packet> = Vec::new();
        let mut completed: Vec<CompletedRequest> = Vec::new();

        if let Some(ref mut udp) = self.udp {
            // Deferred responses from resumed coroutines first.
            let responses = std::mem::take(&mut *udp.responses.borrow_mut());
            for (handle, stream, response) in responses {
                udp.endpoint
                    .write_response(handle, stream, &response, now, &mut packets);
            }

            let mut buf = [0u8; 65535];
            loop {
                match udp.socket.recv_from(&mut buf) {
                    Ok((n, from)) => {
                        udp.endpoint.handle_datagram(
                            now,
                            from,
                            &buf[..n],
                            &mut packets,
                            &mut completed,
                        );
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        warn!("udp recv error: {}", err);
                        break;
                    }
                }
            }
        }

        for request in completed {
            self.dispatch_h3(reactor, request, &mut packets);
        }
        self.flush_udp(reactor, packets);
    }

    fn dispatch_h3(
        &mut self,
        reactor: &mut Reactor,
        completed: CompletedRequest,
        packets: &mut Vec<Packet>,
    ) {
        let CompletedRequest {
            conn,
            stream,
            request,
        } = completed;
        match self.app.dispatch(self.pool.as_deref(), request) {
            Disposition::Ready(response) => {
                if let Some(ref mut udp) = self.udp {
                    udp.endpoint
                        .write_response(conn, stream, &response, Instant::now(), packets);
                }
            }
            Disposition::Pending(rx) => {
                let responses = match self.udp {
                    Some(ref udp) => udp.responses.clone(),
                    None => return,
                };
                let local = self.local.clone();
                let udp_key = self.udp.as_ref().map(|udp| udp.key);
                reactor.spawn(async move {
                    let response = match rx.await {
                        Ok(Ok(response)) => response,
                        Ok(Err(err)) => {
                            debug!("worker dispatch failed: {}", err);
                            Response::internal_error("handler failed")
                        }
                        Err(_) => Response::internal_error("dispatch canceled"),
                    };
                    responses.borrow_mut().push((conn, stream, response));
                    if let Some(udp_key) = udp_key {
                        local.schedule_io(udp_key, false, true);
                    }
                });
            }
        }
    }

    fn flush_udp(&mut self, reactor: &mut Reactor, packets: Vec<Packet>) {
        if let Some(ref mut udp) = self.udp {
            for packet in packets {
                if let Err(err) = udp.socket.send_to(&packet.payload, packet.to) {
                    if err.kind() != io::ErrorKind::WouldBlock {
                        debug!("udp send error: {}", err);
                    }
                }
            }
            match udp.endpoint.next_timeout() {
                Some(deadline) => reactor.set_timer(H3_TIMER, deadline),
                None => reactor.clear_timer(H3_TIMER),
            }
        }
    }

    fn udp_timer(&mut self, reactor: &mut Reactor, now: Instant) {
        let mut packets = Vec::new();
        let mut completed = Vec::new();
        if let Some(ref mut udp) = self.udp {
            udp.endpoint.handle_timeout(now, &mut packets, &mut completed);
        }
        for request in completed {
            self.dispatch_h3(reactor, request, &mut packets);
        }
        self.flush_udp(reactor, packets);
    }

    /// Local connection count, for draining decisions.
    pub(crate) fn connections(&self) -> usize {
        self.conns.len()
    }
}

impl Driver for Dispatcher {
    fn on_readiness(&mut self, reactor: &mut Reactor, key: usize, readable: bool, writable: bool) {
        if Some(key) == self.http_key {
            self.accept_loop(reactor, false);
        } else if Some(key) == self.tls_key {
            self.accept_loop(reactor, true);
        } else if Some(key) == self.bridge_key {
            self.bridge_ready(reactor);
        } else if self.udp.as_ref().map(|udp| udp.key) == Some(key) {
            self.udp_ready(reactor);
        } else {
            self.conn_ready(reactor, key, readable, writable);
        }
    }

    fn on_timer(&mut self, reactor: &mut Reactor, key: u64, now: Instant) {
        if key == H3_TIMER {
            self.udp_timer(reactor, now);
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("connections", &self.conns.len())
            .field("websockets", &self.ws_index.len())
            .finish()
    }
}
