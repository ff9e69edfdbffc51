//! End-to-end HTTP/1.1 tests over real loopback sockets.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use velox::{App, Response, Server, ServerConfig, WsHandler, WsSink};

fn demo_app() -> App {
    let mut app = App::new();
    app.get("/a", |_req: &velox::Request| Response::text("alpha"));
    app.get("/b", |_req: &velox::Request| Response::text("beta"));
    app.post("/echo", |req: &velox::Request| {
        Response::new(200)
            .with_header("Content-Type", "application/octet-stream")
            .with_body(req.body.clone())
    });
    app.get("/boom", |_req: &velox::Request| -> Response { panic!("kaboom") });
    app.ws("/ws", Echo);
    app
}

struct Echo;

impl WsHandler for Echo {
    fn on_text(&self, sink: &mut dyn WsSink, text: &str) {
        sink.send_text(text);
    }

    fn on_binary(&self, sink: &mut dyn WsSink, data: &[u8]) {
        sink.send_binary(data);
    }
}

fn start_server() -> velox::ServerHandle {
    let config = ServerConfig::new()
        .http_addr(([127, 0, 0, 1], 0).into())
        .reactor_threads(1);
    Server::bind(config)
        .expect("bind")
        .start(demo_app())
        .expect("start")
}

fn connect(handle: &velox::ServerHandle) -> TcpStream {
    let addr = handle.http_addr().expect("http addr");
    let stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");
    stream
}

/// Reads one response; returns (head, body).
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut raw = Vec::new();
    let mut chunk = [0u8; 4096];
    let (head_end, content_length) = loop {
        let n = stream.read(&mut chunk).expect("read");
        assert!(n > 0, "connection closed mid-response: {:?}", raw);
        raw.extend_from_slice(&chunk[..n]);
        if let Some(at) = find_head_end(&raw) {
            let head = String::from_utf8_lossy(&raw[..at]).to_string();
            let content_length = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    if name.eq_ignore_ascii_case("content-length") {
                        value.trim().parse::<usize>().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0);
            break (at, content_length);
        }
    };
    while raw.len() < head_end + 4 + content_length {
        let n = stream.read(&mut chunk).expect("read body");
        assert!(n > 0, "connection closed mid-body");
        raw.extend_from_slice(&chunk[..n]);
    }
    let head = String::from_utf8_lossy(&raw[..head_end]).to_string();
    let body = raw[head_end + 4..head_end + 4 + content_length].to_vec();
    (head, body)
}

fn find_head_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

#[test]
fn keep_alive_two_gets_in_order() {
    let handle = start_server();
    let mut stream = connect(&handle);

    // Both requests in one write: the second parses from the same
    // socket right after the first response commits.
    stream
        .write_all(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n")
        .expect("write");

    let (head_a, body_a) = read_response(&mut stream);
    assert!(head_a.starts_with("HTTP/1.1 200 OK"), "head: {}", head_a);
    assert!(head_a.contains("Connection: keep-alive"));
    assert!(head_a.contains("Content-Length: 5"));
    assert_eq!(body_a, b"alpha");

    let (head_b, body_b) = read_response(&mut stream);
    assert!(head_b.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(body_b, b"beta");

    handle.shutdown();
}

#[test]
fn post_body_echoed() {
    let handle = start_server();
    let mut stream = connect(&handle);
    stream
        .write_all(b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\n\r\nhello velox")
        .expect("write");
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(body, b"hello velox");
    handle.shutdown();
}

#[test]
fn missing_route_is_404() {
    let handle = start_server();
    let mut stream = connect(&handle);
    stream
        .write_all(b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n")
        .expect("write");
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404"), "head: {}", head);
    handle.shutdown();
}

#[test]
fn panicking_handler_is_500() {
    let handle = start_server();
    let mut stream = connect(&handle);
    stream
        .write_all(b"GET /boom HTTP/1.1\r\nHost: x\r\n\r\n")
        .expect("write");
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 500"), "head: {}", head);
    assert!(head.contains("application/json"));
    assert!(!body.is_empty());
    handle.shutdown();
}

#[test]
fn connection_close_honored() {
    let handle = start_server();
    let mut stream = connect(&handle);
    stream
        .write_all(b"GET /a HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .expect("write");
    let (head, _) = read_response(&mut stream);
    assert!(head.contains("Connection: close"));
    // Server closes: the next read returns EOF.
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest);
    assert!(rest.is_empty());
    handle.shutdown();
}

#[test]
fn parse_error_is_400() {
    let handle = start_server();
    let mut stream = connect(&handle);
    stream
        .write_all(b"GET / BANANA/9.9\r\nHost: x\r\n\r\n")
        .expect("write");
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 400"), "head: {}", head);
    handle.shutdown();
}

#[test]
fn websocket_upgrade_and_echo() {
    let handle = start_server();
    let mut stream = connect(&handle);
    stream
        .write_all(
            b"GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\
              Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .expect("write");

    // 101 with the RFC 6455 accept key.
    let mut head = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).expect("read 101");
        assert!(n > 0);
        head.extend_from_slice(&chunk[..n]);
        if find_head_end(&head).is_some() {
            break;
        }
    }
    let head_text = String::from_utf8_lossy(&head);
    assert!(
        head_text.starts_with("HTTP/1.1 101 Switching Protocols"),
        "head: {}",
        head_text
    );
    assert!(head_text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

    // One masked text frame, payload "hello".
    let mask = [0x11u8, 0x22, 0x33, 0x44];
    let mut frame = vec![0x81, 0x85];
    frame.extend_from_slice(&mask);
    frame.extend(
        b"hello"
            .iter()
            .enumerate()
            .map(|(i, &b)| b ^ mask[i & 3]),
    );
    stream.write_all(&frame).expect("write frame");

    // Expect the identical unmasked text frame back.
    let mut reply = [0u8; 7];
    stream.read_exact(&mut reply).expect("read echo");
    assert_eq!(&reply, b"\x81\x05hello");

    // Clean close handshake.
    let close_payload = 1000u16.to_be_bytes();
    let mut close = vec![0x88, 0x82];
    close.extend_from_slice(&mask);
    close.extend(
        close_payload
            .iter()
            .enumerate()
            .map(|(i, &b)| b ^ mask[i & 3]),
    );
    stream.write_all(&close).expect("write close");
    let mut mirrored = [0u8; 4];
    stream.read_exact(&mut mirrored).expect("read close");
    assert_eq!(mirrored[0], 0x88);

    handle.shutdown();
}
