//! HTTP/1.1 connection state machine.

pub(crate) mod conn;
pub(crate) mod date;
pub(crate) mod encode;
pub(crate) mod parse;

pub(crate) use self::conn::{Http1Conn, ResponseOutcome};
