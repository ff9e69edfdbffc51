//! The per-reactor task set and its resumption path.
//!
//! A task is a lazily started, one-shot future pinned into the owning
//! reactor's slab. Task wakers are sendable: waking from another thread
//! pushes the task id onto the reactor's ready queue and wakes the
//! poller, so the future body only ever runs on the reactor thread.
//! The response-reader thread completing a promise is exactly such a
//! wake; it never polls anything itself.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures_util::task::{waker, ArcWake};
use slab::Slab;
use tracing::trace;

use super::reactor::Shared;

type LocalFuture = Pin<Box<dyn Future<Output = ()>>>;

struct TaskWaker {
    id: usize,
    shared: Arc<Shared>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.shared.schedule(arc_self.id);
    }
}

struct TaskSlot {
    fut: Option<LocalFuture>,
    waker: Waker,
}

pub(crate) struct TaskSet {
    slots: Slab<TaskSlot>,
}

impl TaskSet {
    pub(crate) fn new() -> TaskSet {
        TaskSet { slots: Slab::new() }
    }

    pub(crate) fn insert(&mut self, fut: LocalFuture, shared: &Arc<Shared>) -> usize {
        let entry = self.slots.vacant_entry();
        let id = entry.key();
        let task_waker = waker(Arc::new(TaskWaker {
            id,
            shared: shared.clone(),
        }));
        entry.insert(TaskSlot {
            fut: Some(fut),
            waker: task_waker,
        });
        trace!("task {} spawned", id);
        id
    }

    /// Polls task `id` once. Stale wakes for completed ids are ignored;
    /// a spurious poll of a live task is harmless per the `Future`
    /// contract.
    pub(crate) fn run(&mut self, id: usize) {
        let (mut fut, task_waker) = match self.slots.get_mut(id) {
            Some(slot) => match slot.fut.take() {
                Some(fut) => (fut, slot.waker.clone()),
                // Already being polled higher up the stack.
                None => return,
            },
            None => return,
        };
        let mut cx = Context::from_waker(&task_waker);
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                trace!("task {} complete", id);
                self.slots.remove(id);
            }
            Poll::Pending => {
                if let Some(slot) = self.slots.get_mut(id) {
                    slot.fut = Some(fut);
                }
            }
        }
    }

}

impl fmt::Debug for TaskSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSet")
            .field("tasks", &self.slots.len())
            .finish()
    }
}
