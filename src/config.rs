//! Server configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::proto::h1;
use crate::worker::ArgsFormat;

/// TLS listener settings. Certificates are PEM files on disk.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    pub addr: SocketAddr,
    pub cert_path: String,
    pub key_path: String,
}

/// How worker processes come to exist.
#[derive(Clone, Debug)]
pub enum Launcher {
    /// The pool launches `workers` copies of this command; each child
    /// finds the socket path in `VELOX_WORKER_SOCKET`.
    Command { program: String, args: Vec<String> },
    /// Workers are started externally and connect on their own.
    External,
}

/// Worker-pool settings.
#[derive(Clone, Debug)]
pub struct WorkerPoolConfig {
    pub launcher: Launcher,
    pub workers: usize,
    /// Defaults to a per-process path under the temp dir.
    pub socket_path: Option<PathBuf>,
    pub args_format: ArgsFormat,
}

impl WorkerPoolConfig {
    pub fn command(program: impl Into<String>, workers: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            launcher: Launcher::Command {
                program: program.into(),
                args: Vec::new(),
            },
            workers,
            socket_path: None,
            args_format: ArgsFormat::Binary,
        }
    }

    /// A pool whose workers attach on their own (tests, supervised
    /// deployments).
    pub fn external(workers: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            launcher: Launcher::External,
            workers,
            socket_path: None,
            args_format: ArgsFormat::Binary,
        }
    }

    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> WorkerPoolConfig {
        self.socket_path = Some(path.into());
        self
    }

    pub fn args_format(mut self, format: ArgsFormat) -> WorkerPoolConfig {
        self.args_format = format;
        self
    }
}

/// Top-level server settings, builder style.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub(crate) http_addr: Option<SocketAddr>,
    pub(crate) tls: Option<TlsConfig>,
    pub(crate) h3_addr: Option<SocketAddr>,
    pub(crate) reactor_threads: usize,
    pub(crate) max_buf_size: usize,
    pub(crate) worker_pool: Option<WorkerPoolConfig>,
}

impl ServerConfig {
    pub fn new() -> ServerConfig {
        ServerConfig {
            http_addr: Some(([0, 0, 0, 0], 8080).into()),
            tls: None,
            h3_addr: None,
            reactor_threads: num_cpus::get(),
            max_buf_size: h1::conn::DEFAULT_MAX_BUF_SIZE,
            worker_pool: None,
        }
    }

    /// The cleartext HTTP/1.1 listener address (default `0.0.0.0:8080`).
    pub fn http_addr(mut self, addr: SocketAddr) -> ServerConfig {
        self.http_addr = Some(addr);
        self
    }

    /// Disables the cleartext listener.
    pub fn no_http(mut self) -> ServerConfig {
        self.http_addr = None;
        self
    }

    /// Enables the TLS listener with ALPN `h2` + `http/1.1`.
    pub fn tls(
        mut self,
        addr: SocketAddr,
        cert_path: impl Into<String>,
        key_path: impl Into<String>,
    ) -> ServerConfig {
        self.tls = Some(TlsConfig {
            addr,
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        });
        self
    }

    /// Enables the HTTP/3 UDP listener. Requires `tls` for the
    /// certificate material.
    pub fn h3_addr(mut self, addr: SocketAddr) -> ServerConfig {
        self.h3_addr = Some(addr);
        self
    }

    /// Number of reactor threads (default: one per CPU).
    pub fn reactor_threads(mut self, threads: usize) -> ServerConfig {
        assert!(threads >= 1, "at least one reactor thread is required");
        self.reactor_threads = threads;
        self
    }

    /// Maximum HTTP/1.1 read buffer. Heads or declared bodies that
    /// exceed it draw a 413.
    pub fn max_buf_size(mut self, max: usize) -> ServerConfig {
        assert!(
            max >= h1::conn::MINIMUM_MAX_BUF_SIZE,
            "the max_buf_size cannot be smaller than {}",
            h1::conn::MINIMUM_MAX_BUF_SIZE,
        );
        self.max_buf_size = max;
        self
    }

    /// Attaches a worker pool for out-of-process handlers.
    pub fn worker_pool(mut self, config: WorkerPoolConfig) -> ServerConfig {
        self.worker_pool = Some(config);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig::new()
    }
}
