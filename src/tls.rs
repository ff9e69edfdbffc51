//! TLS support.
//!
//! The record layer is the `rustls` server state machine consumed
//! sans-io: [`TlsAdapter`] feeds it ciphertext read by the reactor and
//! drains ciphertext to write back, which keeps the dispatcher's TLS
//! connections ordinary machine-mode sockets. Once ALPN settles on
//! `h2`, the socket moves to a connection task and [`TlsStream`] wraps
//! the same session in the `tokio::io` traits for the HTTP/2 layer.

use std::fmt;
use std::io::{self, Read, Write};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::{ServerConfig, ServerConnection};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, warn};

use crate::error::Error;
use crate::runtime::io::AsyncTcp;

/// The protocol selected by ALPN.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AlpnProtocol {
    Http1,
    Http2,
}

/// Maps a negotiated ALPN value to a protocol. `h2` selects HTTP/2;
/// `http/1.1`, nothing, or anything unrecognized selects HTTP/1.1 (the
/// last with a logged warning).
pub(crate) fn select_protocol(alpn: Option<&[u8]>) -> AlpnProtocol {
    match alpn {
        Some(b"h2") => AlpnProtocol::Http2,
        Some(b"http/1.1") | None => AlpnProtocol::Http1,
        Some(other) => {
            warn!(
                "unrecognized alpn protocol {:?}, treating as http/1.1",
                String::from_utf8_lossy(other)
            );
            AlpnProtocol::Http1
        }
    }
}

/// Loads certificates and a private key, producing a server config
/// offering `h2` and `http/1.1`.
pub(crate) fn build_server_config(cert_path: &str, key_path: &str) -> crate::Result<Arc<ServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| Error::new_internal(err))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// As [`build_server_config`], offering only `h3` for the QUIC
/// endpoint.
pub(crate) fn build_h3_config(cert_path: &str, key_path: &str) -> crate::Result<Arc<ServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| Error::new_internal(err))?;
    config.alpn_protocols = vec![b"h3".to_vec()];
    Ok(Arc::new(config))
}

fn load_certs(path: &str) -> crate::Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = std::fs::File::open(path).map_err(Error::new_listen)?;
    let mut reader = io::BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(Error::new_listen)
}

fn load_key(path: &str) -> crate::Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path).map_err(Error::new_listen)?;
    let mut reader = io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(Error::new_listen)?
        .ok_or_else(|| Error::new_internal(io::Error::new(
            io::ErrorKind::InvalidData,
            "no private key found in key file",
        )))
}

/// What the handshake driver should do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HandshakeStatus {
    Complete,
    NeedsIo,
}

/// What a plaintext read produced.
#[derive(Debug)]
pub(crate) enum PlainRead {
    /// Bytes were appended to the output.
    Data(usize),
    /// Nothing readable right now.
    Pending,
    /// The peer closed the TLS session.
    Closed,
}

/// Buffered TLS record layer over one socket's session.
pub(crate) struct TlsAdapter {
    conn: ServerConnection,
}

impl TlsAdapter {
    pub(crate) fn new(config: Arc<ServerConfig>) -> crate::Result<TlsAdapter> {
        let conn = ServerConnection::new(config).map_err(|err| Error::new_internal(err))?;
        Ok(TlsAdapter { conn })
    }

    /// Feeds ciphertext read from the socket.
    pub(crate) fn process_incoming(&mut self, mut bytes: &[u8]) -> crate::Result<()> {
        while !bytes.is_empty() {
            let n = self.conn.read_tls(&mut bytes).map_err(Error::new_io)?;
            if n == 0 {
                break;
            }
            self.conn.process_new_packets().map_err(|err| {
                debug!("tls error: {}", err);
                Error::new_io(io::Error::new(io::ErrorKind::InvalidData, err))
            })?;
        }
        Ok(())
    }

    pub(crate) fn handshake(&self) -> HandshakeStatus {
        if self.conn.is_handshaking() {
            HandshakeStatus::NeedsIo
        } else {
            HandshakeStatus::Complete
        }
    }

    /// Copies available plaintext into `out`.
    pub(crate) fn read_plaintext(&mut self, out: &mut Vec<u8>) -> crate::Result<PlainRead> {
        let mut chunk = [0u8; 4096];
        let mut total = 0usize;
        loop {
            match self.conn.reader().read(&mut chunk) {
                Ok(0) => {
                    return if total > 0 {
                        Ok(PlainRead::Data(total))
                    } else {
                        Ok(PlainRead::Closed)
                    };
                }
                Ok(n) => {
                    out.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return if total > 0 {
                        Ok(PlainRead::Data(total))
                    } else {
                        Ok(PlainRead::Pending)
                    };
                }
                Err(err) => return Err(Error::new_io(err)),
            }
        }
    }

    /// Buffers plaintext for encryption. Always succeeds; the record
    /// layer owns the buffer.
    pub(crate) fn write_plaintext(&mut self, bytes: &[u8]) -> crate::Result<()> {
        self.conn
            .writer()
            .write_all(bytes)
            .map_err(Error::new_io)
    }

    /// Whether ciphertext is waiting to be written to the socket.
    pub(crate) fn needs_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Drains pending ciphertext into `out` for the socket write path.
    pub(crate) fn write_outgoing(&mut self, out: &mut Vec<u8>) -> crate::Result<usize> {
        let mut total = 0;
        while self.conn.wants_write() {
            total += self.conn.write_tls(out).map_err(Error::new_io)?;
        }
        Ok(total)
    }

    pub(crate) fn alpn_protocol(&self) -> Option<&[u8]> {
        self.conn.alpn_protocol()
    }

    pub(crate) fn send_close_notify(&mut self) {
        self.conn.send_close_notify();
    }

    /// Consumes the adapter, returning the session for a futures-mode
    /// stream.
    pub(crate) fn into_session(self) -> ServerConnection {
        self.conn
    }
}

impl fmt::Debug for TlsAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAdapter")
            .field("handshaking", &self.conn.is_handshaking())
            .finish()
    }
}

/// `AsyncRead`/`AsyncWrite` over an established TLS session, used when
/// the connection moves to the HTTP/2 task.
pub(crate) struct TlsStream {
    io: AsyncTcp,
    session: ServerConnection,
    /// Ciphertext read from the socket but not yet accepted by the
    /// session.
    inbuf: Vec<u8>,
    eof: bool,
}

impl TlsStream {
    pub(crate) fn new(io: AsyncTcp, session: ServerConnection) -> TlsStream {
        TlsStream {
            io,
            session,
            inbuf: Vec::new(),
            eof: false,
        }
    }

    /// Reads more ciphertext from the socket and feeds the session.
    fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        // Unconsumed ciphertext first.
        if !self.inbuf.is_empty() {
            let mut slice = &self.inbuf[..];
            let n = self.session.read_tls(&mut slice)?;
            let consumed = self.inbuf.len() - slice.len();
            self.inbuf.drain(..consumed);
            if n > 0 {
                self.process()?;
                return Poll::Ready(Ok(n));
            }
        }
        if self.eof {
            return Poll::Ready(Ok(0));
        }
        let mut chunk = [0u8; 16 * 1024];
        let mut readbuf = ReadBuf::new(&mut chunk);
        match Pin::new(&mut self.io).poll_read(cx, &mut readbuf) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
            Poll::Pending => return Poll::Pending,
        }
        let filled = readbuf.filled();
        if filled.is_empty() {
            self.eof = true;
            return Poll::Ready(Ok(0));
        }
        let mut slice = filled;
        let n = self.session.read_tls(&mut slice)?;
        if !slice.is_empty() {
            self.inbuf.extend_from_slice(slice);
        }
        self.process()?;
        Poll::Ready(Ok(n))
    }

    fn process(&mut self) -> io::Result<()> {
        self.session
            .process_new_packets()
            .map(|_| ())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    fn write_ciphertext(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.session.wants_write() {
            let mut writer = SyncWriteAdapter {
                io: &mut self.io,
                cx: &mut *cx,
            };
            match self.session.write_tls(&mut writer) {
                Ok(_) => continue,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Poll::Pending;
                }
                Err(err) => return Poll::Ready(Err(err)),
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for TlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        loop {
            match me.session.reader().read(buf.initialize_unfilled()) {
                Ok(n) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    match me.poll_fill(cx) {
                        Poll::Ready(Ok(0)) => return Poll::Ready(Ok(())),
                        Poll::Ready(Ok(_)) => continue,
                        Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                Err(err) => return Poll::Ready(Err(err)),
            }
        }
    }
}

impl AsyncWrite for TlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        let n = me.session.writer().write(buf)?;
        // Push records toward the socket opportunistically; buffered
        // bytes flush fully in poll_flush.
        let _ = me.write_ciphertext(cx)?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        match me.write_ciphertext(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut me.io).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        me.session.send_close_notify();
        match me.write_ciphertext(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut me.io).poll_shutdown(cx),
            other => other,
        }
    }
}

impl fmt::Debug for TlsStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsStream").finish()
    }
}

/// Adapts `AsyncWrite` to `io::Write` for `write_tls`, surfacing
/// `Pending` as `WouldBlock` with the waker already registered.
struct SyncWriteAdapter<'a, 'b> {
    io: &'a mut AsyncTcp,
    cx: &'a mut Context<'b>,
}

impl Write for SyncWriteAdapter<'_, '_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match Pin::new(&mut *self.io).poll_write(self.cx, buf) {
            Poll::Ready(result) => result,
            Poll::Pending => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match Pin::new(&mut *self.io).poll_flush(self.cx) {
            Poll::Ready(result) => result,
            Poll::Pending => Err(io::ErrorKind::WouldBlock.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_selection() {
        assert_eq!(select_protocol(Some(b"h2")), AlpnProtocol::Http2);
        assert_eq!(select_protocol(Some(b"http/1.1")), AlpnProtocol::Http1);
        assert_eq!(select_protocol(None), AlpnProtocol::Http1);
        // Unknown values fall back to HTTP/1.1.
        assert_eq!(select_protocol(Some(b"spdy/3")), AlpnProtocol::Http1);
    }
}
