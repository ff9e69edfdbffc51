//! The worker pool: out-of-process handler execution.
//!
//! The parent binds a Unix-domain socket; each worker process connects
//! once and speaks the framed message protocol in [`codec`]. Requests
//! carry a monotonic 32-bit correlation id and park a promise in the
//! [`pending`] table; a dedicated reader thread per worker connection
//! blocks on replies and routes them by message type. HTTP completions
//! resolve the promise (waking the suspended request on its owning
//! reactor); WebSocket records go to the event bridge. Ordering across
//! workers is not guaranteed; the correlation id restores pairing.
//!
//! [`harness`] is the worker-side counterpart, used by worker binaries
//! and by the integration tests.

pub mod args;
pub mod codec;
pub mod harness;

pub(crate) mod pending;

use std::fmt;
use std::io::Write;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bridge::{Registry, WsOutbound};
use crate::config::{Launcher, WorkerPoolConfig};
use crate::error::Error;
use crate::proto::{Request, Response};

pub use self::args::Value;
pub use self::codec::{ArgsFormat, Message};

use self::pending::{Pending, ReplyReceiver};

/// Environment variable carrying the pool socket path to launched
/// workers.
pub const SOCKET_ENV: &str = "VELOX_WORKER_SOCKET";
/// Environment variable carrying the worker index.
pub const WORKER_ID_ENV: &str = "VELOX_WORKER_ID";

struct Worker {
    /// Writer half; the reader thread owns its own clone.
    stream: Mutex<UnixStream>,
}

/// The process-wide pool of worker processes.
pub struct WorkerPool {
    workers: Vec<Worker>,
    pending: Pending,
    next_worker: AtomicUsize,
    shutdown: AtomicBool,
    readers: Mutex<Vec<JoinHandle<()>>>,
    children: Mutex<Vec<Child>>,
    bridge: Arc<Registry>,
    args_format: ArgsFormat,
    socket_path: PathBuf,
}

impl WorkerPool {
    /// Binds the pool socket, launches workers per the configured
    /// launcher, waits for every worker to connect, and starts the
    /// response readers.
    pub(crate) fn start(
        config: &WorkerPoolConfig,
        bridge: Arc<Registry>,
    ) -> crate::Result<Arc<WorkerPool>> {
        if config.workers == 0 {
            return Err(Error::new_invalid_state());
        }
        let socket_path = config.socket_path.clone().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("velox-pool-{}.sock", std::process::id()))
        });
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path).map_err(Error::new_listen)?;
        info!(
            "worker pool listening on {} for {} workers",
            socket_path.display(),
            config.workers
        );

        let mut children = Vec::new();
        if let Launcher::Command { ref program, ref args } = config.launcher {
            for index in 0..config.workers {
                let child = Command::new(program)
                    .args(args)
                    .env(SOCKET_ENV, &socket_path)
                    .env(WORKER_ID_ENV, index.to_string())
                    .stdin(Stdio::null())
                    .spawn()
                    .map_err(Error::new_listen)?;
                children.push(child);
            }
        }

        let mut workers = Vec::with_capacity(config.workers);
        let mut reader_streams = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let (stream, _addr) = listener.accept().map_err(Error::new_listen)?;
            debug!("worker {} connected", index);
            let reader = stream.try_clone().map_err(Error::new_listen)?;
            reader_streams.push(reader);
            workers.push(Worker {
                stream: Mutex::new(stream),
            });
        }

        let pool = Arc::new(WorkerPool {
            workers,
            pending: Pending::new(),
            next_worker: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            readers: Mutex::new(Vec::new()),
            children: Mutex::new(children),
            bridge,
            args_format: config.args_format,
            socket_path,
        });

        let mut readers = Vec::with_capacity(reader_streams.len());
        for (index, stream) in reader_streams.into_iter().enumerate() {
            let pool = pool.clone();
            let handle = std::thread::Builder::new()
                .name(format!("velox-pool-reader-{}", index))
                .spawn(move || pool.read_loop(index, stream))
                .map_err(Error::new_listen)?;
            readers.push(handle);
        }
        *pool.readers.lock() = readers;

        Ok(pool)
    }

    /// Serializes `req` and enqueues it for a worker, returning the
    /// receiver the suspended request awaits. The promise under the
    /// returned id resolves exactly once: from the reader thread, or
    /// from shutdown.
    pub(crate) fn dispatch(
        &self,
        module: &str,
        function: &str,
        req: &Request,
    ) -> crate::Result<ReplyReceiver> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::new_invalid_state());
        }
        let args = self.encode_args(req)?;
        let correlation = self.pending.allocate();
        let rx = self.pending.register(correlation);
        let msg = Message::Request {
            correlation,
            module: module.to_owned(),
            function: function.to_owned(),
            format: self.args_format,
            args,
        };
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        if let Err(err) = self.send_to(index, &msg) {
            self.pending.cancel(correlation);
            return Err(Error::new_io(err));
        }
        Ok(rx)
    }

    /// Forwards a WebSocket lifecycle event. Events for one connection
    /// stick to one worker so handler state stays coherent.
    pub(crate) fn send_ws_event(&self, msg: &Message) {
        let connection = match *msg {
            Message::WsConnect { connection, .. }
            | Message::WsMessage { connection, .. }
            | Message::WsDisconnect { connection } => connection,
            _ => return,
        };
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        let index = (connection as usize) % self.workers.len();
        if let Err(err) = self.send_to(index, msg) {
            warn!("ws event send to worker {} failed: {}", index, err);
        }
    }

    fn send_to(&self, index: usize, msg: &Message) -> std::io::Result<()> {
        let mut stream = self.workers[index].stream.lock();
        codec::write_message(&mut *stream, msg)
    }

    fn encode_args(&self, req: &Request) -> crate::Result<Vec<u8>> {
        match self.args_format {
            ArgsFormat::Binary => {
                let mut params: Vec<(String, Value)> = vec![
                    ("method".into(), Value::Str(req.method.as_str().to_owned())),
                    ("path".into(), Value::Str(req.route_path().to_owned())),
                    (
                        "query".into(),
                        match req.query() {
                            Some(query) => Value::Str(query.to_owned()),
                            None => Value::Null,
                        },
                    ),
                    ("body".into(), Value::Bytes(req.body.clone())),
                ];
                for (name, value) in &req.params {
                    params.push((name.clone(), Value::Str(value.clone())));
                }
                Ok(args::encode(&params).into_vec())
            }
            ArgsFormat::Text => {
                let mut params = serde_json::Map::new();
                for (name, value) in &req.params {
                    params.insert(name.clone(), serde_json::Value::String(value.clone()));
                }
                let payload = serde_json::json!({
                    "method": req.method.as_str(),
                    "path": req.route_path(),
                    "query": req.query(),
                    "params": params,
                    "body": String::from_utf8_lossy(&req.body),
                });
                serde_json::to_vec(&payload).map_err(Error::new_internal)
            }
            ArgsFormat::Alternate => Ok(req.body.clone()),
        }
    }

    /// The response-reader loop for one worker connection.
    fn read_loop(self: Arc<WorkerPool>, index: usize, mut stream: UnixStream) {
        loop {
            match codec::read_message(&mut stream) {
                Ok(Message::Response {
                    correlation,
                    status,
                    success,
                    format,
                    body,
                    error,
                }) => {
                    let result = if success {
                        Ok(reply_response(status, format, body))
                    } else {
                        Err(Error::new_handler(WorkerFailure { message: error }))
                    };
                    if !self.pending.resolve(correlation, result) {
                        debug!("reply for unknown correlation {}", correlation);
                    }
                }
                Ok(Message::WsSend {
                    connection,
                    payload,
                    binary,
                }) => {
                    self.bridge.push(WsOutbound::Send {
                        connection,
                        payload,
                        binary,
                    });
                }
                Ok(Message::WsClose { connection, code }) => {
                    self.bridge.push(WsOutbound::Close { connection, code });
                }
                Ok(Message::Shutdown) => {
                    debug!("worker {} acknowledged shutdown", index);
                    break;
                }
                Ok(other) => {
                    warn!("unexpected message from worker {}: {:?}", index, other);
                }
                Err(err) => {
                    if self.shutdown.load(Ordering::Acquire) {
                        debug!("reader {} exiting on shutdown", index);
                    } else {
                        warn!("worker {} connection lost: {}", index, err);
                    }
                    break;
                }
            }
        }
    }

    /// Orderly shutdown: mark, send a sentinel per worker, wake the
    /// readers, join them, then fail every outstanding promise.
    pub(crate) fn stop(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("worker pool shutting down");
        for worker in &self.workers {
            let mut stream = worker.stream.lock();
            let _ = codec::write_message(&mut *stream, &Message::Shutdown);
            let _ = stream.flush();
            // Forces the blocking reader out of its read.
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        let readers = std::mem::take(&mut *self.readers.lock());
        let current = std::thread::current().id();
        for handle in readers {
            // A reader thread can run the final drop; it must not join
            // itself.
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        self.pending.fail_all();
        let mut children = self.children.lock();
        for child in children.iter_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
        children.clear();
        let _ = std::fs::remove_file(&self.socket_path);
    }

    /// The number of dispatched requests still awaiting a reply.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("outstanding", &self.pending.len())
            .finish()
    }
}

/// Builds the HTTP response for a successful worker reply. The body
/// format byte picks the content type.
fn reply_response(status: u16, format: ArgsFormat, body: Vec<u8>) -> Response {
    let mut resp = Response::new(status);
    let content_type = match format {
        ArgsFormat::Text => "application/json",
        ArgsFormat::Binary | ArgsFormat::Alternate => "application/octet-stream",
    };
    resp.headers.append("Content-Type", content_type);
    resp.body = body;
    resp
}

#[derive(Debug)]
struct WorkerFailure {
    message: String,
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker reported failure: {}", self.message)
    }
}

impl std::error::Error for WorkerFailure {}
