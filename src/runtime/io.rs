//! Futures-mode socket adapters.
//!
//! [`AsyncTcp`] wraps a reactor-registered `mio` stream in the
//! `tokio::io` traits so collaborator crates (the HTTP/2 framing layer)
//! can own the socket. On `WouldBlock` the current task's waker is
//! parked in the source's registration and woken by the reactor when
//! the next readiness edge arrives.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::reactor::LocalHandle;

pub(crate) struct AsyncTcp {
    io: mio::net::TcpStream,
    key: usize,
    local: LocalHandle,
}

impl AsyncTcp {
    /// Wraps a stream already registered in futures mode under `key`.
    pub(crate) fn new(io: mio::net::TcpStream, key: usize, local: LocalHandle) -> AsyncTcp {
        AsyncTcp { io, key, local }
    }
}

impl AsyncRead for AsyncTcp {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        loop {
            match me.io.read(buf.initialize_unfilled()) {
                Ok(n) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    me.local.park_reader(me.key, cx.waker());
                    return Poll::Pending;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Poll::Ready(Err(err)),
            }
        }
    }
}

impl AsyncWrite for AsyncTcp {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        loop {
            match me.io.write(buf) {
                Ok(n) => return Poll::Ready(Ok(n)),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    me.local.park_writer(me.key, cx.waker());
                    return Poll::Pending;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Poll::Ready(Err(err)),
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Writes go straight to the socket; nothing is buffered here.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        let _ = me.io.shutdown(Shutdown::Write);
        Poll::Ready(Ok(()))
    }
}

impl Drop for AsyncTcp {
    fn drop(&mut self) {
        self.local.deregister(self.key, &mut self.io);
    }
}

impl fmt::Debug for AsyncTcp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTcp").field("key", &self.key).finish()
    }
}
