//! Minimal HTTP/1.1 server.
//!
//! ```notrust
//! cargo run --example hello
//! curl http://127.0.0.1:8080/hello/world
//! ```

use velox::{App, Request, Response, Server, ServerConfig};

fn main() -> velox::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut app = App::new();
    app.get("/", |_req: &Request| Response::text("velox says hello\n"));
    app.get("/hello/{name}", |req: &Request| {
        let name = req.param("name").unwrap_or("world");
        Response::text(format!("hello, {}!\n", name))
    });
    app.post("/echo", |req: &Request| {
        Response::new(200)
            .with_header("Content-Type", "application/octet-stream")
            .with_body(req.body.clone())
    });

    let config = ServerConfig::new().http_addr(([127, 0, 0, 1], 8080).into());
    Server::bind(config)?.run(app)
}
