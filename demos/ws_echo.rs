//! WebSocket echo server.
//!
//! ```notrust
//! cargo run --example ws_echo
//! websocat ws://127.0.0.1:8080/ws
//! ```

use velox::{App, Request, Response, Server, ServerConfig, WsHandler, WsSink};

struct Echo;

impl WsHandler for Echo {
    fn on_open(&self, sink: &mut dyn WsSink) {
        sink.send_text("welcome");
    }

    fn on_text(&self, sink: &mut dyn WsSink, text: &str) {
        sink.send_text(text);
    }

    fn on_binary(&self, sink: &mut dyn WsSink, data: &[u8]) {
        sink.send_binary(data);
    }
}

fn main() -> velox::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut app = App::new();
    app.get("/", |_req: &Request| {
        Response::html("<html><body>connect a websocket to /ws</body></html>")
    });
    app.ws("/ws", Echo);

    let config = ServerConfig::new().http_addr(([127, 0, 0, 1], 8080).into());
    Server::bind(config)?.run(app)
}
