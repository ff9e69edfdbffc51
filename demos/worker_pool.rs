//! Out-of-process style dispatch, self-contained: the "worker" runs as
//! a thread in this process speaking the pool protocol over the same
//! Unix socket a separate process would use.
//!
//! ```notrust
//! cargo run --example worker_pool
//! curl http://127.0.0.1:8080/jobs/42
//! ```

use std::time::Duration;

use velox::worker::harness::{HandlerReply, WorkerRuntime};
use velox::worker::Value;
use velox::{App, Method, Server, ServerConfig, WorkerPoolConfig};

fn main() -> velox::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let socket_path = std::env::temp_dir().join("velox-demo-pool.sock");
    let worker_path = socket_path.clone();
    std::thread::spawn(move || {
        // Wait for the pool to bind, then serve.
        while !worker_path.exists() {
            std::thread::sleep(Duration::from_millis(10));
        }
        let mut worker = WorkerRuntime::new();
        worker.handle("jobs", "status", |args| {
            let id = match args.get("id") {
                Some(Value::Str(id)) => id,
                _ => return Err("missing id".into()),
            };
            Ok(HandlerReply::json(serde_json::json!({
                "job": id,
                "state": "done",
            })))
        });
        if let Err(err) = worker.run(&worker_path) {
            eprintln!("worker exited: {}", err);
        }
    });

    let mut app = App::new();
    app.route_to_worker(Method::Get, "/jobs/{id}", "jobs", "status");

    let config = ServerConfig::new()
        .http_addr(([127, 0, 0, 1], 8080).into())
        .worker_pool(WorkerPoolConfig::external(1).socket_path(socket_path));
    Server::bind(config)?.run(app)
}
