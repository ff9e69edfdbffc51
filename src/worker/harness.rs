//! The worker-side runtime.
//!
//! A worker process connects to the pool socket, reads framed requests,
//! invokes the handler registered for `(module, function)`, and writes
//! the reply with the same correlation id. The harness also receives
//! WebSocket lifecycle events and can push `ws-send`/`ws-close` records
//! back at any time. Worker binaries call [`WorkerRuntime::run_from_env`];
//! integration tests connect [`WorkerRuntime::run`] at an explicit path.

use std::collections::HashMap;
use std::io;
use std::os::unix::net::UnixStream;
use std::path::Path;

use tracing::{debug, info, warn};

use super::args::{self, Value};
use super::codec::{self, ArgsFormat, Message};
use super::SOCKET_ENV;

/// The decoded arguments of one dispatched request.
#[derive(Debug)]
pub enum HandlerArgs {
    /// The binary tagged format, decoded.
    Params(Vec<(String, Value)>),
    /// The text format, parsed as JSON.
    Json(serde_json::Value),
    /// The alternate format: opaque bytes, passed through.
    Raw(Vec<u8>),
}

impl HandlerArgs {
    /// Looks up a named parameter across the structured formats.
    pub fn get(&self, name: &str) -> Option<Value> {
        match self {
            HandlerArgs::Params(params) => params
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone()),
            HandlerArgs::Json(json) => json.get(name).map(|v| match v {
                serde_json::Value::Null => Value::Null,
                serde_json::Value::Bool(b) => Value::Bool(*b),
                serde_json::Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Value::I64(i)
                    } else {
                        Value::F64(n.as_f64().unwrap_or(f64::NAN))
                    }
                }
                serde_json::Value::String(s) => Value::Str(s.clone()),
                other => Value::Text(other.to_string()),
            }),
            HandlerArgs::Raw(_) => None,
        }
    }
}

/// A successful handler reply.
#[derive(Debug)]
pub struct HandlerReply {
    pub status: u16,
    pub body: Vec<u8>,
    pub format: ArgsFormat,
}

impl HandlerReply {
    /// A `200` JSON reply.
    pub fn json(value: serde_json::Value) -> HandlerReply {
        HandlerReply {
            status: 200,
            body: value.to_string().into_bytes(),
            format: ArgsFormat::Text,
        }
    }

    pub fn with_status(mut self, status: u16) -> HandlerReply {
        self.status = status;
        self
    }
}

/// Sends WebSocket records back to the server mid-handler.
#[derive(Debug)]
pub struct WsReply<'a> {
    stream: &'a mut UnixStream,
    connection: u64,
}

impl WsReply<'_> {
    pub fn connection_id(&self) -> u64 {
        self.connection
    }

    pub fn send_text(&mut self, text: &str) -> io::Result<()> {
        codec::write_message(
            self.stream,
            &Message::WsSend {
                connection: self.connection,
                payload: text.as_bytes().to_vec(),
                binary: false,
            },
        )
    }

    pub fn send_binary(&mut self, data: &[u8]) -> io::Result<()> {
        codec::write_message(
            self.stream,
            &Message::WsSend {
                connection: self.connection,
                payload: data.to_vec(),
                binary: true,
            },
        )
    }

    pub fn close(&mut self, code: u16) -> io::Result<()> {
        codec::write_message(
            self.stream,
            &Message::WsClose {
                connection: self.connection,
                code,
            },
        )
    }
}

/// A WebSocket lifecycle event delivered to the worker.
#[derive(Debug)]
pub enum WsWorkerEvent<'a> {
    Connect { path: &'a str },
    Message { path: &'a str, payload: &'a [u8], binary: bool },
    Disconnect,
}

type HttpHandler = Box<dyn Fn(&HandlerArgs) -> Result<HandlerReply, String> + Send>;
type WsEventHandler = Box<dyn Fn(&WsWorkerEvent<'_>, &mut WsReply<'_>) + Send>;

/// The worker-side dispatch loop and handler registry.
pub struct WorkerRuntime {
    handlers: HashMap<(String, String), HttpHandler>,
    ws_handler: Option<WsEventHandler>,
}

impl WorkerRuntime {
    pub fn new() -> WorkerRuntime {
        WorkerRuntime {
            handlers: HashMap::new(),
            ws_handler: None,
        }
    }

    /// Registers the handler for `(module, function)`.
    pub fn handle<F>(&mut self, module: &str, function: &str, handler: F) -> &mut WorkerRuntime
    where
        F: Fn(&HandlerArgs) -> Result<HandlerReply, String> + Send + 'static,
    {
        self.handlers
            .insert((module.to_owned(), function.to_owned()), Box::new(handler));
        self
    }

    /// Registers the WebSocket event handler.
    pub fn handle_ws<F>(&mut self, handler: F) -> &mut WorkerRuntime
    where
        F: Fn(&WsWorkerEvent<'_>, &mut WsReply<'_>) + Send + 'static,
    {
        self.ws_handler = Some(Box::new(handler));
        self
    }

    /// Connects to the pool socket named by `VELOX_WORKER_SOCKET` and
    /// serves until shutdown.
    pub fn run_from_env(self) -> io::Result<()> {
        let path = std::env::var(SOCKET_ENV).map_err(|_| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not set", SOCKET_ENV),
            )
        })?;
        self.run(path)
    }

    /// Connects to the pool socket at `path` and serves until the
    /// shutdown sentinel (or the socket closing).
    pub fn run(self, path: impl AsRef<Path>) -> io::Result<()> {
        let mut stream = UnixStream::connect(path.as_ref())?;
        info!("worker connected to {}", path.as_ref().display());
        loop {
            let msg = match codec::read_message(&mut stream) {
                Ok(msg) => msg,
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("pool closed the connection");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            match msg {
                Message::Request {
                    correlation,
                    module,
                    function,
                    format,
                    args,
                } => {
                    let reply = self.invoke(&module, &function, format, &args);
                    let msg = match reply {
                        Ok(reply) => Message::Response {
                            correlation,
                            status: reply.status,
                            success: true,
                            format: reply.format,
                            body: reply.body,
                            error: String::new(),
                        },
                        Err(error) => Message::Response {
                            correlation,
                            status: 500,
                            success: false,
                            format: ArgsFormat::Text,
                            body: Vec::new(),
                            error,
                        },
                    };
                    codec::write_message(&mut stream, &msg)?;
                }
                Message::WsConnect { connection, path } => {
                    self.dispatch_ws(&mut stream, connection, WsWorkerEvent::Connect {
                        path: &path,
                    })?;
                }
                Message::WsMessage {
                    connection,
                    path,
                    payload,
                    binary,
                } => {
                    self.dispatch_ws(&mut stream, connection, WsWorkerEvent::Message {
                        path: &path,
                        payload: &payload,
                        binary,
                    })?;
                }
                Message::WsDisconnect { connection } => {
                    self.dispatch_ws(&mut stream, connection, WsWorkerEvent::Disconnect)?;
                }
                Message::Shutdown => {
                    debug!("shutdown sentinel received");
                    return Ok(());
                }
                other => warn!("unexpected message in worker: {:?}", other),
            }
        }
    }

    fn invoke(
        &self,
        module: &str,
        function: &str,
        format: ArgsFormat,
        raw: &[u8],
    ) -> Result<HandlerReply, String> {
        let handler = self
            .handlers
            .get(&(module.to_owned(), function.to_owned()))
            .ok_or_else(|| format!("no handler for {}.{}", module, function))?;
        let args = match format {
            ArgsFormat::Binary => HandlerArgs::Params(
                args::decode(raw).map_err(|err| format!("bad args: {}", err))?,
            ),
            ArgsFormat::Text => HandlerArgs::Json(
                serde_json::from_slice(raw).map_err(|err| format!("bad args: {}", err))?,
            ),
            ArgsFormat::Alternate => HandlerArgs::Raw(raw.to_vec()),
        };
        handler(&args)
    }

    fn dispatch_ws(
        &self,
        stream: &mut UnixStream,
        connection: u64,
        event: WsWorkerEvent<'_>,
    ) -> io::Result<()> {
        if let Some(ref handler) = self.ws_handler {
            // The reply sink writes on a second stream handle so the
            // handler can interleave sends with the read loop.
            let mut write_half = stream.try_clone()?;
            let mut reply = WsReply {
                stream: &mut write_half,
                connection,
            };
            handler(&event, &mut reply);
        }
        Ok(())
    }
}

impl Default for WorkerRuntime {
    fn default() -> WorkerRuntime {
        WorkerRuntime::new()
    }
}

impl std::fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("handlers", &self.handlers.len())
            .field("ws", &self.ws_handler.is_some())
            .finish()
    }
}
