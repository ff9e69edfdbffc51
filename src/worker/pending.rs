//! The pending-request table.
//!
//! Both the reactor threads (insert at dispatch) and the response
//! readers (remove and resolve) touch the table, so it sits behind a
//! mutex with short, bounded critical sections. Correlation ids are
//! monotonic within the process and never reused while an entry exists.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use futures_channel::oneshot;
use parking_lot::Mutex;
use tracing::trace;

use crate::proto::Response;

pub(crate) type ReplySender = oneshot::Sender<crate::Result<Response>>;
pub(crate) type ReplyReceiver = oneshot::Receiver<crate::Result<Response>>;

pub(crate) struct Pending {
    map: Mutex<HashMap<u32, ReplySender>>,
    next: AtomicU32,
}

impl Pending {
    pub(crate) fn new() -> Pending {
        Pending {
            map: Mutex::new(HashMap::new()),
            next: AtomicU32::new(1),
        }
    }

    /// Allocates the next correlation id.
    pub(crate) fn allocate(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, id: u32) -> ReplyReceiver {
        let (tx, rx) = oneshot::channel();
        let replaced = self.map.lock().insert(id, tx);
        debug_assert!(replaced.is_none(), "correlation id reused while live");
        rx
    }

    /// Resolves a pending entry exactly once. Returns false when the
    /// id is unknown (already resolved or canceled).
    pub(crate) fn resolve(&self, id: u32, result: crate::Result<Response>) -> bool {
        let sender = self.map.lock().remove(&id);
        match sender {
            Some(tx) => {
                trace!("resolving correlation {}", id);
                // A dropped receiver means the connection went away
                // first; the reply is simply discarded.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Drops a registration after a failed send.
    pub(crate) fn cancel(&self, id: u32) {
        self.map.lock().remove(&id);
    }

    /// Fails every outstanding entry; used at shutdown.
    pub(crate) fn fail_all(&self) {
        let drained: Vec<ReplySender> = {
            let mut map = self.map.lock();
            map.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(crate::Error::new_invalid_state()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.map.lock().len()
    }
}

impl fmt::Debug for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("outstanding", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let pending = Pending::new();
        let a = pending.allocate();
        let b = pending.allocate();
        assert!(b > a);
    }

    #[test]
    fn resolve_exactly_once() {
        let pending = Pending::new();
        let id = pending.allocate();
        let mut rx = pending.register(id);
        assert!(pending.resolve(id, Ok(Response::text("done"))));
        assert!(!pending.resolve(id, Ok(Response::text("again"))));
        let result = rx.try_recv().unwrap().expect("value present");
        assert_eq!(result.unwrap().body, b"done");
    }

    #[test]
    fn fail_all_reports_invalid_state() {
        let pending = Pending::new();
        let id = pending.allocate();
        let mut rx = pending.register(id);
        pending.fail_all();
        let result = rx.try_recv().unwrap().expect("value present");
        assert!(result.unwrap_err().is_invalid_state());
        assert_eq!(pending.len(), 0);
    }
}
