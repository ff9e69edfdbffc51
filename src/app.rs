//! The handler facade.
//!
//! An [`App`] collects routes, middleware and WebSocket endpoints, then
//! acts as the single `(method, path, headers, body) -> Response` entry
//! point the connection state machines call. Handlers registered
//! in-process run right on the reactor thread; handlers bound to the
//! worker pool return a pending dispatch the caller awaits. The
//! registry is written at startup and read-only afterwards, so the
//! request path takes no lock.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures_channel::oneshot;
use tracing::{debug, warn};

use crate::proto::{Method, Request, Response};
use crate::router::Router;
use crate::worker::WorkerPool;

/// An in-process request handler.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, req: &Request) -> Response;
}

impl<F> Handler for F
where
    F: Fn(&Request) -> Response + Send + Sync + 'static,
{
    fn call(&self, req: &Request) -> Response {
        self(req)
    }
}

/// Wraps handlers with cross-cutting behavior. `before` may
/// short-circuit with a response; `after` can rewrite the response on
/// the way out.
pub trait Middleware: Send + Sync + 'static {
    fn before(&self, _req: &mut Request) -> Option<Response> {
        None
    }

    fn after(&self, _req: &Request, _resp: &mut Response) {}
}

/// Sends frames on a live WebSocket connection from its handler.
pub trait WsSink {
    fn send_text(&mut self, text: &str);
    fn send_binary(&mut self, data: &[u8]);
    fn close(&mut self, code: u16, reason: &str);
    /// The process-unique id of this connection, usable with the
    /// worker-side send API.
    fn connection_id(&self) -> u64;
}

/// An in-process WebSocket endpoint.
pub trait WsHandler: Send + Sync + 'static {
    fn on_open(&self, _sink: &mut dyn WsSink) {}
    fn on_text(&self, _sink: &mut dyn WsSink, _text: &str) {}
    fn on_binary(&self, _sink: &mut dyn WsSink, _data: &[u8]) {}
    fn on_close(&self, _connection_id: u64) {}
    /// A protocol or I/O failure tore the connection down.
    fn on_error(&self, _connection_id: u64) {}
}

enum Binding {
    Local(Box<dyn Handler>),
    Worker { module: String, function: String },
}

pub(crate) enum WsBinding {
    Local(Arc<dyn WsHandler>),
    Worker,
}

/// How a dispatched request will complete.
pub(crate) enum Disposition {
    /// Handled in-process; the response is ready now.
    Ready(Response),
    /// Dispatched to the worker pool; await the receiver.
    Pending(oneshot::Receiver<crate::Result<Response>>),
}

impl fmt::Debug for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Ready(resp) => f.debug_tuple("Ready").field(&resp.status).finish(),
            Disposition::Pending(_) => f.debug_tuple("Pending").finish(),
        }
    }
}

/// The application: routes, bindings and middleware.
pub struct App {
    router: Router,
    bindings: Vec<Binding>,
    middleware: Vec<Arc<dyn Middleware>>,
    prefix_middleware: Vec<(String, Arc<dyn Middleware>)>,
    ws_router: Router,
    ws_bindings: Vec<WsBinding>,
}

impl App {
    pub fn new() -> App {
        App {
            router: Router::new(),
            bindings: Vec::new(),
            middleware: Vec::new(),
            prefix_middleware: Vec::new(),
            ws_router: Router::new(),
            ws_bindings: Vec::new(),
        }
    }

    /// Registers a handler for `method` + `pattern`.
    pub fn route(&mut self, method: Method, pattern: &str, handler: impl Handler) -> &mut App {
        let slot = self.bindings.len();
        self.bindings.push(Binding::Local(Box::new(handler)));
        self.router.add(method, pattern, slot);
        self
    }

    pub fn get(&mut self, pattern: &str, handler: impl Handler) -> &mut App {
        self.route(Method::Get, pattern, handler)
    }

    pub fn post(&mut self, pattern: &str, handler: impl Handler) -> &mut App {
        self.route(Method::Post, pattern, handler)
    }

    pub fn put(&mut self, pattern: &str, handler: impl Handler) -> &mut App {
        self.route(Method::Put, pattern, handler)
    }

    pub fn delete(&mut self, pattern: &str, handler: impl Handler) -> &mut App {
        self.route(Method::Delete, pattern, handler)
    }

    pub fn patch(&mut self, pattern: &str, handler: impl Handler) -> &mut App {
        self.route(Method::Patch, pattern, handler)
    }

    /// Binds `method` + `pattern` to a worker-pool function instead of
    /// an in-process handler.
    pub fn route_to_worker(
        &mut self,
        method: Method,
        pattern: &str,
        module: &str,
        function: &str,
    ) -> &mut App {
        let slot = self.bindings.len();
        self.bindings.push(Binding::Worker {
            module: module.to_owned(),
            function: function.to_owned(),
        });
        self.router.add(method, pattern, slot);
        self
    }

    /// Registers an in-process WebSocket endpoint.
    pub fn ws(&mut self, pattern: &str, handler: impl WsHandler) -> &mut App {
        let slot = self.ws_bindings.len();
        self.ws_bindings.push(WsBinding::Local(Arc::new(handler)));
        self.ws_router.add(Method::Get, pattern, slot);
        self
    }

    /// Routes a WebSocket endpoint's events to the worker pool.
    pub fn ws_to_worker(&mut self, pattern: &str) -> &mut App {
        let slot = self.ws_bindings.len();
        self.ws_bindings.push(WsBinding::Worker);
        self.ws_router.add(Method::Get, pattern, slot);
        self
    }

    /// Adds middleware around every handler.
    pub fn middleware(&mut self, mw: impl Middleware) -> &mut App {
        self.middleware.push(Arc::new(mw));
        self
    }

    /// Adds middleware around handlers whose path starts with `prefix`.
    pub fn middleware_at(&mut self, prefix: &str, mw: impl Middleware) -> &mut App {
        self.prefix_middleware.push((prefix.to_owned(), Arc::new(mw)));
        self
    }

    /// Looks up the WebSocket binding for an upgrade path.
    pub(crate) fn ws_binding(&self, path: &str) -> Option<&WsBinding> {
        let found = self.ws_router.find(&Method::Get, path)?;
        self.ws_bindings.get(found.handler)
    }

    /// The single entry point connections call with a complete request.
    pub(crate) fn dispatch(&self, pool: Option<&WorkerPool>, mut req: Request) -> Disposition {
        let matched = match self.router.find(&req.method, req.route_path()) {
            Some(matched) => matched,
            None => {
                debug!("no route for {} {}", req.method, req.route_path());
                return Disposition::Ready(Response::status_error(404));
            }
        };
        req.params = matched.params;

        match &self.bindings[matched.handler] {
            Binding::Local(handler) => {
                let chain = self.chain_for(req.route_path());
                // before-chain, in registration order; first
                // short-circuit wins but still unwinds the after-chain.
                let mut ran = 0;
                let mut response = None;
                for mw in chain.iter() {
                    ran += 1;
                    if let Some(resp) = mw.before(&mut req) {
                        response = Some(resp);
                        break;
                    }
                }
                let mut response = response.unwrap_or_else(|| {
                    match catch_unwind(AssertUnwindSafe(|| handler.call(&req))) {
                        Ok(resp) => resp,
                        Err(_) => {
                            warn!("handler for {} panicked", matched.pattern);
                            Response::internal_error("handler panicked")
                        }
                    }
                });
                for mw in chain[..ran].iter().rev() {
                    mw.after(&req, &mut response);
                }
                Disposition::Ready(response)
            }
            Binding::Worker { module, function } => match pool {
                Some(pool) => match pool.dispatch(module, function, &req) {
                    Ok(rx) => Disposition::Pending(rx),
                    Err(err) => {
                        warn!("worker dispatch failed: {}", err);
                        Disposition::Ready(Response::internal_error("dispatch failed"))
                    }
                },
                None => {
                    // A route bound to a pool that was never started.
                    debug!("worker route {} with no pool", matched.pattern);
                    Disposition::Ready(Response::status_error(503))
                }
            },
        }
    }

    fn chain_for(&self, path: &str) -> Vec<Arc<dyn Middleware>> {
        let mut chain = self.middleware.clone();
        for (prefix, mw) in &self.prefix_middleware {
            if path.starts_with(prefix.as_str()) {
                chain.push(mw.clone());
            }
        }
        chain
    }
}

impl Default for App {
    fn default() -> App {
        App::new()
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("routes", &self.router.len())
            .field("ws_routes", &self.ws_router.len())
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Version;

    fn request(method: Method, path: &str) -> Request {
        Request::new(method, path.to_owned(), Version::Http11)
    }

    fn ready(disposition: Disposition) -> Response {
        match disposition {
            Disposition::Ready(resp) => resp,
            Disposition::Pending(_) => panic!("expected in-process response"),
        }
    }

    #[test]
    fn routes_to_handler_with_params() {
        let mut app = App::new();
        app.get("/hello/{name}", |req: &Request| {
            Response::text(format!("hi {}", req.param("name").unwrap_or("?")))
        });
        let resp = ready(app.dispatch(None, request(Method::Get, "/hello/ada")));
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"hi ada");
    }

    #[test]
    fn missing_route_is_404() {
        let app = App::new();
        let resp = ready(app.dispatch(None, request(Method::Get, "/none")));
        assert_eq!(resp.status, 404);
    }

    #[test]
    fn worker_route_without_pool_is_503() {
        let mut app = App::new();
        app.route_to_worker(Method::Post, "/jobs", "jobs", "create");
        let resp = ready(app.dispatch(None, request(Method::Post, "/jobs")));
        assert_eq!(resp.status, 503);
    }

    #[test]
    fn panicking_handler_is_500() {
        let mut app = App::new();
        app.get("/boom", |_req: &Request| -> Response { panic!("kaboom") });
        let resp = ready(app.dispatch(None, request(Method::Get, "/boom")));
        assert_eq!(resp.status, 500);
    }

    struct TagMiddleware;

    impl Middleware for TagMiddleware {
        fn after(&self, _req: &Request, resp: &mut Response) {
            resp.headers.append("X-Tag", "global");
        }
    }

    struct GateMiddleware;

    impl Middleware for GateMiddleware {
        fn before(&self, req: &mut Request) -> Option<Response> {
            if req.header("authorization").is_none() {
                Some(Response::status_error(401))
            } else {
                None
            }
        }
    }

    #[test]
    fn global_middleware_wraps_response() {
        let mut app = App::new();
        app.middleware(TagMiddleware);
        app.get("/x", |_req: &Request| Response::text("ok"));
        let resp = ready(app.dispatch(None, request(Method::Get, "/x")));
        assert_eq!(resp.headers.get("x-tag"), Some("global"));
    }

    #[test]
    fn prefix_middleware_short_circuits() {
        let mut app = App::new();
        app.middleware(TagMiddleware);
        app.middleware_at("/admin", GateMiddleware);
        app.get("/admin/panel", |_req: &Request| Response::text("secret"));
        app.get("/open", |_req: &Request| Response::text("open"));

        let denied = ready(app.dispatch(None, request(Method::Get, "/admin/panel")));
        assert_eq!(denied.status, 401);
        // The after-chain still ran for middleware that had run.
        assert_eq!(denied.headers.get("x-tag"), Some("global"));

        let open = ready(app.dispatch(None, request(Method::Get, "/open")));
        assert_eq!(open.status, 200);

        let mut authed = request(Method::Get, "/admin/panel");
        authed.headers.append("Authorization", "Bearer t");
        let allowed = ready(app.dispatch(None, authed));
        assert_eq!(allowed.status, 200);
        assert_eq!(allowed.body, b"secret");
    }

    #[test]
    fn ws_binding_lookup() {
        let mut app = App::new();
        app.ws_to_worker("/feed/{topic}");
        assert!(matches!(app.ws_binding("/feed/cats"), Some(WsBinding::Worker)));
        assert!(app.ws_binding("/other").is_none());
    }
}
