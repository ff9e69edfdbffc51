//! Worker-pool dispatch through the real IPC transport: the server in
//! this process, the worker harness on a thread speaking the framed
//! protocol over the pool's Unix socket.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

use velox::worker::harness::{HandlerReply, WorkerRuntime};
use velox::worker::Value;
use velox::{App, Method, Server, ServerConfig, WorkerPoolConfig};

fn temp_socket(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("velox-test-{}-{}.sock", tag, std::process::id()))
}

fn spawn_worker(path: PathBuf) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !path.exists() {
            assert!(std::time::Instant::now() < deadline, "pool never bound");
            std::thread::sleep(Duration::from_millis(5));
        }
        let mut worker = WorkerRuntime::new();
        worker.handle("shop", "lookup", |args| {
            let id = match args.get("id") {
                Some(Value::Str(id)) => id,
                other => return Err(format!("bad id argument: {:?}", other)),
            };
            assert_eq!(args.get("method"), Some(Value::Str("GET".into())));
            Ok(HandlerReply::json(serde_json::json!({ "item": id })))
        });
        worker.handle("shop", "fail", |_args| Err("database exploded".into()));
        let _ = worker.run(&path);
    })
}

fn request(addr: std::net::SocketAddr, raw: &[u8]) -> (String, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");
    stream.write_all(raw).expect("write");
    let mut raw_response = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                raw_response.extend_from_slice(&chunk[..n]);
                if let Some((head, body)) = try_parse(&raw_response) {
                    return (head, body);
                }
            }
            Err(err) => panic!("read error: {}", err),
        }
    }
    try_parse(&raw_response).expect("complete response")
}

fn try_parse(raw: &[u8]) -> Option<(String, Vec<u8>)> {
    let head_end = raw.windows(4).position(|window| window == b"\r\n\r\n")?;
    let head = String::from_utf8_lossy(&raw[..head_end]).to_string();
    let content_length = head.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.eq_ignore_ascii_case("content-length") {
            value.trim().parse::<usize>().ok()
        } else {
            None
        }
    })?;
    let body_start = head_end + 4;
    if raw.len() < body_start + content_length {
        return None;
    }
    Some((head, raw[body_start..body_start + content_length].to_vec()))
}

#[test]
fn worker_dispatch_roundtrip_and_failure() {
    let socket = temp_socket("dispatch");
    let _ = std::fs::remove_file(&socket);
    let worker = spawn_worker(socket.clone());

    let mut app = App::new();
    app.route_to_worker(Method::Get, "/items/{id}", "shop", "lookup");
    app.route_to_worker(Method::Post, "/fail", "shop", "fail");

    let config = ServerConfig::new()
        .http_addr(([127, 0, 0, 1], 0).into())
        .reactor_threads(1)
        .worker_pool(WorkerPoolConfig::external(1).socket_path(socket.clone()));
    let handle = Server::bind(config)
        .expect("bind")
        .start(app)
        .expect("start");
    let addr = handle.http_addr().expect("addr");

    // The suspended request resumes with the worker's reply.
    let (head, body) = request(addr, b"GET /items/42 HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(head.starts_with("HTTP/1.1 200"), "head: {}", head);
    assert!(head.contains("application/json"));
    let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json body");
    assert_eq!(parsed["item"], "42");

    // A failing worker handler surfaces as a 500 with a JSON error
    // body.
    let (head, body) = request(
        addr,
        b"POST /fail HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\n\r\nhi",
    );
    assert!(head.starts_with("HTTP/1.1 500"), "head: {}", head);
    assert!(head.contains("application/json"));
    let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json body");
    assert_eq!(parsed["error"], "internal server error");

    handle.shutdown();
    worker.join().expect("worker thread");
    let _ = std::fs::remove_file(&socket);
}

#[test]
fn sequential_dispatches_use_distinct_correlations() {
    let socket = temp_socket("corr");
    let _ = std::fs::remove_file(&socket);
    let worker = spawn_worker(socket.clone());

    let mut app = App::new();
    app.route_to_worker(Method::Get, "/items/{id}", "shop", "lookup");

    let config = ServerConfig::new()
        .http_addr(([127, 0, 0, 1], 0).into())
        .reactor_threads(1)
        .worker_pool(WorkerPoolConfig::external(1).socket_path(socket.clone()));
    let handle = Server::bind(config)
        .expect("bind")
        .start(app)
        .expect("start");
    let addr = handle.http_addr().expect("addr");

    for id in 0..5 {
        let raw = format!("GET /items/{} HTTP/1.1\r\nHost: x\r\n\r\n", id);
        let (head, body) = request(addr, raw.as_bytes());
        assert!(head.starts_with("HTTP/1.1 200"), "head: {}", head);
        let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(parsed["item"], id.to_string());
    }

    handle.shutdown();
    worker.join().expect("worker thread");
    let _ = std::fs::remove_file(&socket);
}
