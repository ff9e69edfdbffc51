//! The RFC 6455 opening handshake.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};

use crate::proto::{Method, Request};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `base64(sha1(key || GUID))`, the value of `Sec-WebSocket-Accept`.
pub(crate) fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WS_GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

/// Returns the client's `Sec-WebSocket-Key` when the request is a
/// complete, version-13 upgrade; `None` otherwise.
pub(crate) fn upgrade_key(req: &Request) -> Option<&str> {
    if req.method != Method::Get {
        return None;
    }
    if !req.headers.contains_token("upgrade", "websocket") {
        return None;
    }
    if !req.headers.contains_token("connection", "upgrade") {
        return None;
    }
    if req.header("sec-websocket-version")?.trim() != "13" {
        return None;
    }
    let key = req.header("sec-websocket-key")?;
    if key.trim().is_empty() {
        return None;
    }
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Version;

    #[test]
    fn rfc_sample_accept_key() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    fn upgrade_request() -> Request {
        let mut req = Request::new(Method::Get, "/ws".into(), Version::Http11);
        req.headers.append("Host", "x");
        req.headers.append("Upgrade", "websocket");
        req.headers.append("Connection", "Upgrade");
        req.headers
            .append("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==");
        req.headers.append("Sec-WebSocket-Version", "13");
        req
    }

    #[test]
    fn detects_complete_upgrade() {
        let req = upgrade_request();
        assert_eq!(upgrade_key(&req), Some("dGhlIHNhbXBsZSBub25jZQ=="));
    }

    #[test]
    fn wrong_method_rejected() {
        let mut req = upgrade_request();
        req.method = Method::Post;
        assert!(upgrade_key(&req).is_none());
    }

    #[test]
    fn wrong_version_rejected() {
        let mut req = upgrade_request();
        req.headers.set("Sec-WebSocket-Version", "8");
        assert!(upgrade_key(&req).is_none());
    }

    #[test]
    fn missing_connection_token_rejected() {
        let mut req = upgrade_request();
        req.headers.set("Connection", "keep-alive");
        assert!(upgrade_key(&req).is_none());
    }
}
