//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can have velox `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur handling connections and requests.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    Parse(Parse),
    /// Operation on a disposed or not-yet-initialized object.
    InvalidState,
    /// A pending item was dropped before ever being processed.
    Canceled,
    /// A future was polled before a value or failure was available.
    NotReady,
    /// A deadline elapsed before the operation completed.
    Timeout,
    /// A bounded queue or channel refused the item.
    QueueFull,
    /// The worker-pool reply reported failure.
    Handler,
    /// A bug or resource exhaustion inside velox itself.
    Internal,
    /// An `io::Error` while reading or writing a network stream.
    Io,
    /// Error creating or binding a listener.
    Listen,
    /// A general error from the HTTP/2 collaborator.
    Http2,
    /// A general error from the QUIC collaborator.
    Http3,
}

#[derive(Debug)]
pub(crate) enum Parse {
    Method,
    Version,
    Uri,
    Header,
    TooLarge,
    Incomplete,
    /// Malformed WebSocket frame.
    WebSocket,
    /// Malformed worker-pool IPC message.
    Ipc,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    pub(crate) fn new_too_large() -> Error {
        Error::new(Kind::Parse(Parse::TooLarge))
    }

    pub(crate) fn new_incomplete() -> Error {
        Error::new(Kind::Parse(Parse::Incomplete))
    }

    pub(crate) fn new_invalid_state() -> Error {
        Error::new(Kind::InvalidState)
    }

    pub(crate) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    pub(crate) fn new_not_ready() -> Error {
        Error::new(Kind::NotReady)
    }

    pub(crate) fn new_timeout() -> Error {
        Error::new(Kind::Timeout)
    }

    pub(crate) fn new_queue_full() -> Error {
        Error::new(Kind::QueueFull)
    }

    pub(crate) fn new_handler<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Handler).with(cause)
    }

    pub(crate) fn new_internal<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Internal).with(cause)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_listen(cause: std::io::Error) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(crate) fn new_h2(cause: h2::Error) -> Error {
        Error::new(Kind::Http2).with(cause)
    }

    pub(crate) fn new_h3<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Http3).with(cause)
    }

    /// Returns true if this was a parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this was a parse error caused by a message that
    /// exceeded the input buffer.
    pub fn is_parse_too_large(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(Parse::TooLarge))
    }

    /// Returns true if this was about an operation that was canceled.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// Returns true if the operation found a disposed or
    /// not-yet-initialized object.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self.inner.kind, Kind::InvalidState)
    }

    /// Returns true if a deadline elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout)
    }

    /// Returns true if a bounded queue refused the item.
    pub fn is_queue_full(&self) -> bool {
        matches!(self.inner.kind, Kind::QueueFull)
    }

    /// Returns true if the worker-pool reply reported failure.
    pub fn is_handler(&self) -> bool {
        matches!(self.inner.kind, Kind::Handler)
    }

    /// Returns true if this was caused by an `io::Error`.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Cause> {
        self.inner.cause
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Method) => "invalid HTTP method parsed",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Uri) => "invalid URI",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::TooLarge) => "message head is too large",
            Kind::Parse(Parse::Incomplete) => "message is incomplete",
            Kind::Parse(Parse::WebSocket) => "invalid WebSocket frame",
            Kind::Parse(Parse::Ipc) => "invalid worker-pool message",
            Kind::InvalidState => "object is disposed or not initialized",
            Kind::Canceled => "operation was canceled",
            Kind::NotReady => "value is not ready",
            Kind::Timeout => "operation timed out",
            Kind::QueueFull => "bounded queue is full",
            Kind::Handler => "handler reported failure",
            Kind::Internal => "internal error",
            Kind::Io => "connection error",
            Kind::Listen => "error creating listener",
            Kind::Http2 => "http2 error",
            Kind::Http3 => "http3 error",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("velox::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::new_io(err)
    }
}

impl From<h2::Error> for Error {
    fn from(err: h2::Error) -> Error {
        Error::new_h2(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_size_of() {
        assert_eq!(
            std::mem::size_of::<Error>(),
            std::mem::size_of::<usize>()
        );
    }

    #[test]
    fn predicates() {
        assert!(Error::new_too_large().is_parse());
        assert!(Error::new_too_large().is_parse_too_large());
        assert!(Error::new_canceled().is_canceled());
        assert!(!Error::new_canceled().is_parse());
        assert!(Error::new_queue_full().is_queue_full());
    }
}
