#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # velox
//!
//! velox is a **fast** multi-protocol HTTP application server written in
//! and for Rust.
//!
//! ## Features
//!
//! - HTTP/1.1 (cleartext and TLS), HTTP/2 (ALPN) and HTTP/3 (QUIC)
//!   behind one listener configuration
//! - WebSocket upgrades on the HTTP/1.1 transport
//! - Declarative routing with path parameters and middleware
//! - Optional dispatch of requests to a pool of external worker
//!   processes over a framed IPC transport
//! - A per-thread reactor model: every connection is owned by exactly
//!   one event-loop thread from accept to close
//!
//! ## Quick start
//!
//! ```no_run
//! use velox::{App, Request, Response, Server, ServerConfig};
//!
//! fn main() -> velox::Result<()> {
//!     let mut app = App::new();
//!     app.get("/hello/{name}", |req: &Request| {
//!         let name = req.param("name").unwrap_or("world");
//!         Response::text(format!("hello, {}", name))
//!     });
//!
//!     let config = ServerConfig::new().http_addr(([0, 0, 0, 0], 8080).into());
//!     Server::bind(config)?.run(app)
//! }
//! ```
//!
//! ## Architecture
//!
//! Each reactor thread runs a readiness-based event loop and owns its
//! accepted connections outright; cross-thread traffic happens over the
//! lock-free queues in [`runtime`] and the reactor's wake mechanism.
//! Handlers registered in-process run directly on the reactor thread;
//! handlers bound to the worker pool suspend the request until the
//! pool's response-reader thread resolves it.

pub use crate::app::{App, Handler, Middleware, WsHandler, WsSink};
pub use crate::config::{Launcher, ServerConfig, TlsConfig, WorkerPoolConfig};
pub use crate::error::{Error, Result};
pub use crate::proto::{Headers, Method, Request, Response, Version};
pub use crate::server::{Server, ServerHandle};

mod app;
mod bridge;
mod config;
mod dispatch;
mod error;
mod proto;
pub mod router;
pub mod runtime;
mod server;
mod tls;
pub mod worker;
