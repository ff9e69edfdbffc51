//! HTTP/2 server connections.
//!
//! Framing, HPACK, SETTINGS and flow control belong to the `h2`
//! collaborator; this module owns the connection future that accepts
//! streams, assembles each request, dispatches it, and writes the
//! response frames back. The future runs on the task set of the reactor
//! thread that accepted the socket, so every stream's dispatch resumes
//! there too. Per-stream futures live in a `FuturesUnordered` owned by
//! the connection future: their lifetime is bounded by the
//! connection's, and entries vanish as they complete.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::future::LocalBoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use h2::server::{Connection, Handshake, SendResponse};
use h2::RecvStream;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace, warn};

use crate::app::{App, Disposition};
use crate::proto::{Headers, Method, Request, Response, Version};
use crate::worker::WorkerPool;

pub(crate) struct H2Server<T> {
    state: State<T>,
    app: Arc<App>,
    pool: Option<Arc<WorkerPool>>,
}

enum State<T> {
    Handshaking(Handshake<T, Bytes>),
    Serving(Serving<T>),
    Closed,
}

struct Serving<T> {
    conn: Connection<T, Bytes>,
    streams: FuturesUnordered<LocalBoxFuture<'static, ()>>,
}

impl<T> H2Server<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Starts the server handshake; the SETTINGS preface is queued
    /// before any stream is accepted.
    pub(crate) fn new(io: T, app: Arc<App>, pool: Option<Arc<WorkerPool>>) -> H2Server<T> {
        let handshake = h2::server::Builder::new().handshake(io);
        H2Server {
            state: State::Handshaking(handshake),
            app,
            pool,
        }
    }
}

impl<T> Future for H2Server<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let me = self.get_mut();
        loop {
            match me.state {
                State::Handshaking(ref mut handshake) => {
                    match Pin::new(handshake).poll(cx) {
                        Poll::Ready(Ok(conn)) => {
                            trace!("h2 handshake complete");
                            me.state = State::Serving(Serving {
                                conn,
                                streams: FuturesUnordered::new(),
                            });
                        }
                        Poll::Ready(Err(err)) => {
                            debug!("h2 handshake error: {}", err);
                            me.state = State::Closed;
                            return Poll::Ready(());
                        }
                        Poll::Pending => return Poll::Pending,
                    }
                }
                State::Serving(ref mut serving) => {
                    match serving.poll_server(cx, &me.app, me.pool.as_ref()) {
                        Poll::Ready(()) => {
                            me.state = State::Closed;
                            return Poll::Ready(());
                        }
                        Poll::Pending => return Poll::Pending,
                    }
                }
                State::Closed => return Poll::Ready(()),
            }
        }
    }
}

impl<T> Serving<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_server(
        &mut self,
        cx: &mut Context<'_>,
        app: &Arc<App>,
        pool: Option<&Arc<WorkerPool>>,
    ) -> Poll<()> {
        loop {
            // always be acceptin'
            'accept: loop {
                match self.conn.poll_accept(cx) {
                    Poll::Ready(Some(Ok((req, respond)))) => {
                        trace!("incoming h2 stream {:?}", respond.stream_id());
                        let app = app.clone();
                        let pool = pool.cloned();
                        self.streams
                            .push(Box::pin(serve_stream(req, respond, app, pool)));
                    }
                    Poll::Ready(Some(Err(err))) => {
                        // Protocol error: the h2 layer resets the
                        // affected streams; dropping them here cancels
                        // their dispatches.
                        debug!("h2 connection error: {}", err);
                        return Poll::Ready(());
                    }
                    Poll::Ready(None) => {
                        trace!(
                            "h2 connection complete; current streams = {}",
                            self.streams.len()
                        );
                        return Poll::Ready(());
                    }
                    Poll::Pending => break 'accept,
                }
            }

            match self.streams.poll_next_unpin(cx) {
                Poll::Ready(Some(())) => continue,
                Poll::Ready(None) | Poll::Pending => return Poll::Pending,
            }
        }
    }
}

async fn serve_stream(
    req: http::Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    app: Arc<App>,
    pool: Option<Arc<WorkerPool>>,
) {
    let stream_id = respond.stream_id();
    let response = match assemble_request(req).await {
        Ok(request) => {
            let disposition = app.dispatch(pool.as_deref(), request);
            match disposition {
                Disposition::Ready(response) => response,
                Disposition::Pending(rx) => match rx.await {
                    Ok(Ok(response)) => response,
                    Ok(Err(err)) => {
                        debug!("h2 stream {:?} handler error: {}", stream_id, err);
                        Response::internal_error("handler failed")
                    }
                    Err(_) => Response::internal_error("dispatch canceled"),
                },
            }
        }
        Err(err) => {
            warn!("h2 stream {:?} request error: {}", stream_id, err);
            respond.send_reset(h2::Reason::INTERNAL_ERROR);
            return;
        }
    };

    if let Err(err) = send_response(&mut respond, response).await {
        debug!("h2 stream {:?} response error: {}", stream_id, err);
        respond.send_reset(h2::Reason::INTERNAL_ERROR);
    }
}

/// Accumulates the stream body to END_STREAM, releasing flow-control
/// capacity as chunks are consumed.
async fn assemble_request(req: http::Request<RecvStream>) -> Result<Request, h2::Error> {
    let (parts, mut body) = req.into_parts();
    let mut bytes = Vec::new();
    while let Some(chunk) = futures_util::future::poll_fn(|cx| body.poll_data(cx)).await {
        let chunk = chunk?;
        let _ = body.flow_control().release_capacity(chunk.len());
        bytes.extend_from_slice(&chunk);
    }

    let method = Method::from_str_token(parts.method.as_str());
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    let mut request = Request::new(method, path, Version::Http11);
    let mut headers = Headers::with_capacity(parts.headers.len());
    for (name, value) in parts.headers.iter() {
        if let Ok(value) = value.to_str() {
            headers.append(name.as_str(), value);
        }
    }
    request.headers = headers;
    request.body = bytes;
    Ok(request)
}

async fn send_response(
    respond: &mut SendResponse<Bytes>,
    response: Response,
) -> Result<(), h2::Error> {
    let mut builder = http::Response::builder().status(response.status);
    for (name, value) in response.headers.iter() {
        // Connection-level h1 headers have no h2 equivalent.
        if name.eq_ignore_ascii_case("connection") || name.eq_ignore_ascii_case("keep-alive") {
            continue;
        }
        builder = builder.header(name, value);
    }
    let head = match builder.body(()) {
        Ok(head) => head,
        Err(err) => {
            debug!("invalid h2 response head: {}", err);
            http::Response::builder()
                .status(500)
                .body(())
                .expect("static 500 head")
        }
    };

    let body = Bytes::from(response.body);
    if body.is_empty() {
        respond.send_response(head, true)?;
        return Ok(());
    }

    let mut stream = respond.send_response(head, false)?;
    let mut remaining = body;
    stream.reserve_capacity(remaining.len());
    while !remaining.is_empty() {
        let available =
            match futures_util::future::poll_fn(|cx| stream.poll_capacity(cx)).await {
                Some(Ok(n)) => n,
                Some(Err(err)) => return Err(err),
                // The peer reset the stream.
                None => return Ok(()),
            };
        let n = available.min(remaining.len());
        if n == 0 {
            continue;
        }
        let chunk = remaining.split_to(n);
        stream.send_data(chunk, false)?;
        stream.reserve_capacity(remaining.len());
    }
    stream.send_data(Bytes::new(), true)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::App;
    use crate::proto::Response as VeloxResponse;

    async fn fetch(
        send: h2::client::SendRequest<Bytes>,
        path: &str,
    ) -> (http::StatusCode, Vec<u8>) {
        let mut send = send.ready().await.expect("ready");
        let req = http::Request::builder()
            .method("GET")
            .uri(format!("https://example.com{}", path))
            .body(())
            .expect("request head");
        let (response, _) = send.send_request(req, true).expect("send_request");
        let response = response.await.expect("response head");
        let status = response.status();
        let mut body = response.into_body();
        let mut bytes = Vec::new();
        while let Some(chunk) =
            futures_util::future::poll_fn(|cx| body.poll_data(cx)).await
        {
            let chunk = chunk.expect("body chunk");
            let _ = body.flow_control().release_capacity(chunk.len());
            bytes.extend_from_slice(&chunk);
        }
        (status, bytes)
    }

    #[test]
    fn three_concurrent_streams_complete_independently() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");
        rt.block_on(async {
            let (client_io, server_io) = tokio::io::duplex(64 * 1024);

            let mut app = App::new();
            app.get("/a", |_req: &Request| VeloxResponse::text("alpha"));
            app.get("/b", |_req: &Request| VeloxResponse::text("beta"));
            app.get("/c", |_req: &Request| VeloxResponse::text("gamma"));
            let server = H2Server::new(server_io, Arc::new(app), None);

            let client = async move {
                let (send, connection) =
                    h2::client::handshake(client_io).await.expect("handshake");
                tokio::spawn(async move {
                    let _ = connection.await;
                });
                // Three streams in flight on one connection; each
                // response lands on its own stream.
                let (a, b, c) = futures::join!(
                    fetch(send.clone(), "/a"),
                    fetch(send.clone(), "/b"),
                    fetch(send, "/c"),
                );
                assert_eq!(a.0, http::StatusCode::OK);
                assert_eq!(a.1, b"alpha");
                assert_eq!(b.1, b"beta");
                assert_eq!(c.1, b"gamma");
            };

            tokio::select! {
                _ = server => panic!("server connection ended before the client"),
                _ = client => {}
            }
        });
    }

    #[test]
    fn missing_route_is_404_over_h2() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        rt.block_on(async {
            let (client_io, server_io) = tokio::io::duplex(64 * 1024);
            let server = H2Server::new(server_io, Arc::new(App::new()), None);
            let client = async move {
                let (send, connection) =
                    h2::client::handshake(client_io).await.expect("handshake");
                tokio::spawn(async move {
                    let _ = connection.await;
                });
                let (status, _) = fetch(send, "/nowhere").await;
                assert_eq!(status, http::StatusCode::NOT_FOUND);
            };
            tokio::select! {
                _ = server => panic!("server connection ended before the client"),
                _ = client => {}
            }
        });
    }
}
