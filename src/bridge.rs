//! The WebSocket event bridge.
//!
//! Worker replies targeting live WebSocket connections are produced on
//! the response-reader threads but must be applied on the reactor
//! thread that owns each connection. The bridge routes every record by
//! connection id to the owning reactor's bounded queue and writes one
//! byte to that reactor's wake pipe; the pipe is registered
//! read-interest in the reactor, so the write lands as an ordinary
//! readiness event and the dispatcher drains the queue on its own
//! thread.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use mio::unix::pipe;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::runtime::queue::MpmcQueue;

/// Queue depth per reactor; overflow drops the record with a warning.
const QUEUE_CAPACITY: usize = 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique WebSocket connection id.
pub(crate) fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// A worker-produced instruction for a WebSocket connection.
#[derive(Debug)]
pub(crate) enum WsOutbound {
    Send {
        connection: u64,
        payload: Vec<u8>,
        binary: bool,
    },
    Close {
        connection: u64,
        code: u16,
    },
}

impl WsOutbound {
    pub(crate) fn connection(&self) -> u64 {
        match *self {
            WsOutbound::Send { connection, .. } => connection,
            WsOutbound::Close { connection, .. } => connection,
        }
    }
}

struct ReactorBridge {
    queue: MpmcQueue<WsOutbound>,
    pipe: Mutex<pipe::Sender>,
}

/// Process-wide routing table from connection id to owning reactor.
pub(crate) struct Registry {
    reactors: RwLock<Vec<ReactorBridge>>,
    owners: RwLock<HashMap<u64, usize>>,
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry {
            reactors: RwLock::new(Vec::new()),
            owners: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a reactor's queue and wake-pipe write end, returning
    /// its bridge index.
    pub(crate) fn register_reactor(
        &self,
        queue: MpmcQueue<WsOutbound>,
        pipe: pipe::Sender,
    ) -> usize {
        let mut reactors = self.reactors.write();
        reactors.push(ReactorBridge {
            queue,
            pipe: Mutex::new(pipe),
        });
        reactors.len() - 1
    }

    /// Records that `connection` lives on the reactor at `bridge`.
    pub(crate) fn bind_connection(&self, connection: u64, bridge: usize) {
        self.owners.write().insert(connection, bridge);
    }

    pub(crate) fn unbind_connection(&self, connection: u64) {
        self.owners.write().remove(&connection);
    }

    /// Routes one record to its owning reactor and wakes it. Records
    /// for unknown connections (already closed) are dropped.
    pub(crate) fn push(&self, outbound: WsOutbound) {
        let connection = outbound.connection();
        let bridge = match self.owners.read().get(&connection) {
            Some(&bridge) => bridge,
            None => {
                debug!("ws record for unknown connection {}", connection);
                return;
            }
        };
        let reactors = self.reactors.read();
        let reactor = match reactors.get(bridge) {
            Some(reactor) => reactor,
            None => return,
        };
        if reactor.queue.try_push(outbound).is_err() {
            warn!(
                "ws bridge queue full, dropping record for connection {}",
                connection
            );
            return;
        }
        let mut pipe = reactor.pipe.lock();
        if let Err(err) = pipe.write(&[1]) {
            if err.kind() != std::io::ErrorKind::WouldBlock {
                debug!("ws wake pipe write failed: {}", err);
            }
            // A full pipe still wakes the reactor; the byte is only a
            // doorbell.
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("bridge::Registry")
            .field("reactors", &self.reactors.read().len())
            .field("connections", &self.owners.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn routes_by_connection_owner() {
        let registry = Registry::new();
        let queue = MpmcQueue::new(8);
        let (tx, mut rx) = pipe::new().unwrap();
        let bridge = registry.register_reactor(queue.clone(), tx);
        registry.bind_connection(11, bridge);

        registry.push(WsOutbound::Send {
            connection: 11,
            payload: b"hi".to_vec(),
            binary: false,
        });
        match queue.try_pop().unwrap() {
            WsOutbound::Send { connection, payload, binary } => {
                assert_eq!(connection, 11);
                assert_eq!(payload, b"hi");
                assert!(!binary);
            }
            other => panic!("unexpected record {:?}", other),
        }
        let mut byte = [0u8; 8];
        let n = rx.read(&mut byte).unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn unknown_connection_dropped() {
        let registry = Registry::new();
        let queue = MpmcQueue::new(8);
        let (tx, _rx) = pipe::new().unwrap();
        registry.register_reactor(queue.clone(), tx);
        registry.push(WsOutbound::Close {
            connection: 999,
            code: 1000,
        });
        assert!(queue.try_pop().is_none());
    }
}
