//! Protocol types shared by every transport.

use std::fmt;

use serde::Serialize;

pub(crate) mod h1;
pub(crate) mod h2;
pub(crate) mod h3;
pub(crate) mod ws;

/// The HTTP version of a parsed request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

/// The request method.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Options,
    Get,
    Post,
    Put,
    Delete,
    Head,
    Trace,
    Connect,
    Patch,
    Extension(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match *self {
            Method::Options => "OPTIONS",
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Patch => "PATCH",
            Method::Extension(ref s) => s,
        }
    }

    pub(crate) fn from_str_token(s: &str) -> Method {
        match s {
            "OPTIONS" => Method::Options,
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "HEAD" => Method::Head,
            "TRACE" => Method::Trace,
            "CONNECT" => Method::Connect,
            "PATCH" => Method::Patch,
            other => Method::Extension(other.to_owned()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordered, case-preserving header multimap.
///
/// Lookup is case-insensitive; serialization emits names exactly as
/// they were inserted, in insertion order.
#[derive(Clone, Debug, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Headers {
        Headers::default()
    }

    pub(crate) fn with_capacity(capacity: usize) -> Headers {
        Headers {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a header, keeping any existing entries with the same
    /// name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces every entry with `name` by a single one.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let mut replaced = false;
        self.entries.retain_mut(|(n, v)| {
            if n.eq_ignore_ascii_case(name) {
                if replaced {
                    return false;
                }
                *v = value.clone();
                replaced = true;
            }
            true
        });
        if !replaced {
            self.entries.push((name.to_owned(), value));
        }
    }

    /// First value for `name`, matched case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Whether `name`'s value contains `token` as a comma-separated,
    /// case-insensitive token. This is the `Connection: close` /
    /// `Connection: Upgrade` test.
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .any(|(_, v)| {
                v.split(',')
                    .any(|part| part.trim().eq_ignore_ascii_case(token))
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// A complete request as seen by handlers.
#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    /// The request target as sent, including any query string.
    pub path: String,
    pub version: Version,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub(crate) params: Vec<(String, String)>,
}

impl Request {
    pub(crate) fn new(method: Method, path: String, version: Version) -> Request {
        Request {
            method,
            path,
            version,
            headers: Headers::new(),
            body: Vec::new(),
            params: Vec::new(),
        }
    }

    /// The path component without the query string.
    pub fn route_path(&self) -> &str {
        match self.path.find('?') {
            Some(at) => &self.path[..at],
            None => &self.path,
        }
    }

    /// The query string, without the leading `?`.
    pub fn query(&self) -> Option<&str> {
        self.path.find('?').map(|at| &self.path[at + 1..])
    }

    /// A path parameter extracted by the router.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// First value of a request header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub(crate) fn should_keep_alive(&self) -> bool {
        match self.version {
            Version::Http10 => self.headers.contains_token("connection", "keep-alive"),
            Version::Http11 => !self.headers.contains_token("connection", "close"),
        }
    }
}

/// A response produced by a handler.
#[derive(Clone, Debug)]
pub struct Response {
    pub status: u16,
    pub reason: Option<String>,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub(crate) websocket_upgrade: Option<String>,
}

impl Response {
    pub fn new(status: u16) -> Response {
        Response {
            status,
            reason: None,
            headers: Headers::new(),
            body: Vec::new(),
            websocket_upgrade: None,
        }
    }

    /// A `200 OK` with a `text/plain` body.
    pub fn text(body: impl Into<String>) -> Response {
        let mut resp = Response::new(200);
        resp.headers
            .append("Content-Type", "text/plain; charset=utf-8");
        resp.body = body.into().into_bytes();
        resp
    }

    /// A `200 OK` with a `text/html` body.
    pub fn html(body: impl Into<String>) -> Response {
        let mut resp = Response::new(200);
        resp.headers.append("Content-Type", "text/html; charset=utf-8");
        resp.body = body.into().into_bytes();
        resp
    }

    /// A `200 OK` with a JSON body serialized from `value`.
    pub fn json<T: Serialize>(value: &T) -> Response {
        match serde_json::to_vec(value) {
            Ok(body) => {
                let mut resp = Response::new(200);
                resp.headers.append("Content-Type", "application/json");
                resp.body = body;
                resp
            }
            Err(err) => Response::internal_error(&err.to_string()),
        }
    }

    /// A `500` with a generic JSON error body.
    pub(crate) fn internal_error(detail: &str) -> Response {
        let mut resp = Response::new(500);
        resp.headers.append("Content-Type", "application/json");
        resp.body = serde_json::to_vec(&serde_json::json!({
            "error": "internal server error",
            "detail": detail,
        }))
        .unwrap_or_else(|_| b"{\"error\":\"internal server error\"}".to_vec());
        resp
    }

    pub(crate) fn status_error(status: u16) -> Response {
        let mut resp = Response::new(status);
        resp.headers
            .append("Content-Type", "text/plain; charset=utf-8");
        resp.body = canonical_reason(status).as_bytes().to_vec();
        resp
    }

    /// Builder-style header append.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Response {
        self.headers.append(name, value);
        self
    }

    /// Builder-style status override.
    pub fn with_status(mut self, status: u16) -> Response {
        self.status = status;
        self
    }

    /// Builder-style body replacement.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Response {
        self.body = body.into();
        self
    }

    pub(crate) fn reason_str(&self) -> &str {
        match self.reason {
            Some(ref reason) => reason,
            None => canonical_reason(self.status),
        }
    }
}

pub(crate) fn canonical_reason(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_case_insensitive_lookup() {
        let mut headers = Headers::new();
        headers.append("Content-Type", "text/plain");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
        assert!(headers.get("content-length").is_none());
    }

    #[test]
    fn connection_token_matching() {
        let mut headers = Headers::new();
        headers.append("Connection", "Keep-Alive, Upgrade");
        assert!(headers.contains_token("connection", "upgrade"));
        assert!(headers.contains_token("connection", "keep-alive"));
        assert!(!headers.contains_token("connection", "close"));
    }

    #[test]
    fn keep_alive_policy() {
        let mut req = Request::new(Method::Get, "/".into(), Version::Http11);
        assert!(req.should_keep_alive());
        req.headers.append("Connection", "close");
        assert!(!req.should_keep_alive());

        let mut req10 = Request::new(Method::Get, "/".into(), Version::Http10);
        assert!(!req10.should_keep_alive());
        req10.headers.append("Connection", "keep-alive");
        assert!(req10.should_keep_alive());
    }

    #[test]
    fn route_path_strips_query() {
        let req = Request::new(Method::Get, "/items/3?full=1".into(), Version::Http11);
        assert_eq!(req.route_path(), "/items/3");
        assert_eq!(req.query(), Some("full=1"));
    }
}
