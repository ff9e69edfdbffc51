//! Server assembly: reactor threads, listeners, worker pool.

use std::fmt;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info};

use crate::app::App;
use crate::bridge::Registry;
use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::runtime::reactor::{Handle, Reactor};
use crate::tls;
use crate::worker::WorkerPool;

/// A configured, not-yet-running server.
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
}

impl Server {
    /// Validates the configuration. Sockets are bound in
    /// [`Server::start`], one set per reactor thread.
    pub fn bind(config: ServerConfig) -> crate::Result<Server> {
        if config.h3_addr.is_some() && config.tls.is_none() {
            return Err(Error::new_invalid_state());
        }
        Ok(Server { config })
    }

    /// Starts every reactor thread and returns a handle with the bound
    /// addresses.
    pub fn start(self, app: App) -> crate::Result<ServerHandle> {
        let config = self.config;
        let app = Arc::new(app);
        let bridge = Arc::new(Registry::new());
        let pool = match config.worker_pool {
            Some(ref pool_config) => Some(WorkerPool::start(pool_config, bridge.clone())?),
            None => None,
        };
        let tls_config = match config.tls {
            Some(ref tls) => Some(tls::build_server_config(&tls.cert_path, &tls.key_path)?),
            None => None,
        };
        let h3_crypto = match (&config.h3_addr, &config.tls) {
            (Some(_), Some(tls)) => Some(tls::build_h3_config(&tls.cert_path, &tls.key_path)?),
            _ => None,
        };

        // Thread 0 resolves any port-0 requests; the rest share the
        // resolved addresses through SO_REUSEPORT.
        let mut http_addr = config.http_addr;
        let mut tls_addr = config.tls.as_ref().map(|tls| tls.addr);
        let mut h3_addr = config.h3_addr;

        let threads = config.reactor_threads;
        let mut joins = Vec::with_capacity(threads);
        let (handle_tx, handle_rx) = mpsc::channel::<crate::Result<Handle>>();

        for index in 0..threads {
            let http_listener = match http_addr {
                Some(addr) => {
                    let listener = tcp_listener(addr)?;
                    if index == 0 {
                        http_addr = Some(listener.local_addr().map_err(Error::new_listen)?);
                    }
                    Some(listener)
                }
                None => None,
            };
            let tls_listener = match tls_addr {
                Some(addr) => {
                    let listener = tcp_listener(addr)?;
                    if index == 0 {
                        tls_addr = Some(listener.local_addr().map_err(Error::new_listen)?);
                    }
                    Some(listener)
                }
                None => None,
            };
            let udp_socket = match h3_addr {
                Some(addr) => {
                    let socket = udp_socket(addr)?;
                    if index == 0 {
                        h3_addr = Some(socket.local_addr().map_err(Error::new_listen)?);
                    }
                    Some(socket)
                }
                None => None,
            };

            let app = app.clone();
            let pool = pool.clone();
            let bridge = bridge.clone();
            let tls_config = tls_config.clone();
            let h3_config = h3_crypto.clone();
            let max_buf_size = config.max_buf_size;
            let tx = handle_tx.clone();

            let join = std::thread::Builder::new()
                .name(format!("velox-reactor-{}", index))
                .spawn(move || {
                    let mut reactor = match Reactor::new() {
                        Ok(reactor) => reactor,
                        Err(err) => {
                            let _ = tx.send(Err(Error::new_listen(err)));
                            return;
                        }
                    };
                    let mut dispatcher = match Dispatcher::new(
                        &mut reactor,
                        app,
                        pool,
                        bridge,
                        max_buf_size,
                        http_listener,
                        tls_listener,
                        tls_config,
                        udp_socket,
                        h3_config,
                    ) {
                        Ok(dispatcher) => dispatcher,
                        Err(err) => {
                            let _ = tx.send(Err(err));
                            return;
                        }
                    };
                    let _ = tx.send(Ok(reactor.handle()));
                    if let Err(err) = reactor.run(&mut dispatcher) {
                        debug!("reactor exited with error: {}", err);
                    }
                    debug!(
                        "reactor done with {} connections open",
                        dispatcher.connections()
                    );
                })
                .map_err(Error::new_listen)?;
            joins.push(join);
        }
        drop(handle_tx);

        let mut reactors = Vec::with_capacity(threads);
        for _ in 0..threads {
            match handle_rx.recv() {
                Ok(Ok(handle)) => reactors.push(handle),
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(Error::new_invalid_state()),
            }
        }

        if let Some(addr) = http_addr {
            info!("listening on http://{}", addr);
        }
        if let Some(addr) = tls_addr {
            info!("listening on https://{} (alpn h2, http/1.1)", addr);
        }
        if let Some(addr) = h3_addr {
            info!("listening on udp {} (h3)", addr);
        }

        Ok(ServerHandle {
            reactors,
            joins,
            pool,
            http_addr,
            tls_addr,
            h3_addr,
        })
    }

    /// Starts and runs until every reactor thread exits.
    pub fn run(self, app: App) -> crate::Result<()> {
        self.start(app)?.join()
    }
}

/// A running server.
pub struct ServerHandle {
    reactors: Vec<Handle>,
    joins: Vec<JoinHandle<()>>,
    pool: Option<Arc<WorkerPool>>,
    http_addr: Option<SocketAddr>,
    tls_addr: Option<SocketAddr>,
    h3_addr: Option<SocketAddr>,
}

impl ServerHandle {
    /// The bound cleartext address (useful with port 0).
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    pub fn tls_addr(&self) -> Option<SocketAddr> {
        self.tls_addr
    }

    pub fn h3_addr(&self) -> Option<SocketAddr> {
        self.h3_addr
    }

    /// Stops every reactor, joins the threads, then shuts the worker
    /// pool down (failing any still-pending dispatches).
    pub fn shutdown(mut self) {
        info!("server shutting down");
        for handle in &self.reactors {
            handle.stop();
        }
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
        if let Some(ref pool) = self.pool {
            pool.stop();
        }
    }

    /// Blocks until the reactor threads exit on their own.
    pub fn join(mut self) -> crate::Result<()> {
        for join in self.joins.drain(..) {
            join.join()
                .map_err(|_| Error::new_internal(PanicInReactor))?;
        }
        if let Some(ref pool) = self.pool {
            pool.stop();
        }
        Ok(())
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("reactors", &self.reactors.len())
            .field("http_addr", &self.http_addr)
            .finish()
    }
}

#[derive(Debug)]
struct PanicInReactor;

impl fmt::Display for PanicInReactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a reactor thread panicked")
    }
}

impl std::error::Error for PanicInReactor {}

fn tcp_listener(addr: SocketAddr) -> crate::Result<mio::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(Error::new_listen)?;
    socket.set_reuse_address(true).map_err(Error::new_listen)?;
    #[cfg(unix)]
    socket.set_reuse_port(true).map_err(Error::new_listen)?;
    socket.set_nonblocking(true).map_err(Error::new_listen)?;
    socket.bind(&addr.into()).map_err(Error::new_listen)?;
    socket.listen(1024).map_err(Error::new_listen)?;
    Ok(mio::net::TcpListener::from_std(socket.into()))
}

fn udp_socket(addr: SocketAddr) -> crate::Result<mio::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(Error::new_listen)?;
    socket.set_reuse_address(true).map_err(Error::new_listen)?;
    #[cfg(unix)]
    socket.set_reuse_port(true).map_err(Error::new_listen)?;
    socket.set_nonblocking(true).map_err(Error::new_listen)?;
    socket.bind(&addr.into()).map_err(Error::new_listen)?;
    Ok(mio::net::UdpSocket::from_std(socket.into()))
}
