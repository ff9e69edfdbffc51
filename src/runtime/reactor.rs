//! The readiness reactor.
//!
//! One `Reactor` is owned by one thread from `run()` until `stop()`.
//! Platform backend selection is delegated to `mio`, which arms epoll on
//! Linux, kqueue on the BSDs and macOS, and wraps IOCP into a readiness
//! surface on Windows. Readiness is edge-triggered: owners must drain
//! reads to `WouldBlock` and only wait for writability after observing a
//! short write.
//!
//! Sources are registered in one of two modes. *Machine* registrations
//! deliver readiness to the event-loop driver, which owns the protocol
//! state machines. *Futures* registrations park task `Waker`s and wake
//! them on readiness; they back the `AsyncRead`/`AsyncWrite` adapters
//! used by the HTTP/2 connection task.
//!
//! The reactor doubles as the resume point for suspended request
//! coroutines: wakers push task ids onto the shared ready queue and call
//! `wake()`; the queue is drained and the tasks polled on the reactor
//! thread, never anywhere else.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Waker;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use tracing::{error, trace};

use super::queue::MpmcQueue;
use super::task::TaskSet;

/// Token reserved for the cross-thread waker.
const WAKE: Token = Token(usize::MAX);

/// How many task ids the ready queue holds before producers spin.
const READY_QUEUE_CAPACITY: usize = 4096;

/// Consumes reactor events. Implemented by the protocol dispatcher.
pub(crate) trait Driver {
    /// A machine-mode source became ready.
    fn on_readiness(&mut self, reactor: &mut Reactor, key: usize, readable: bool, writable: bool);

    /// A timer armed with [`Reactor::set_timer`] expired.
    fn on_timer(&mut self, reactor: &mut Reactor, key: u64, now: Instant);
}

pub(crate) enum Registration {
    /// Readiness goes to the driver.
    Machine,
    /// Readiness wakes parked task wakers.
    Futures {
        reader: Option<Waker>,
        writer: Option<Waker>,
    },
}

/// State reachable from any thread.
pub(crate) struct Shared {
    waker: mio::Waker,
    ready: MpmcQueue<usize>,
    stopped: AtomicBool,
}

impl Shared {
    pub(crate) fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            error!("reactor wake failed: {}", err);
        }
    }

    /// Queues a task for resumption on the reactor thread. A wake must
    /// never be dropped, so a full queue is retried until space frees.
    pub(crate) fn schedule(&self, task: usize) {
        let mut task = task;
        loop {
            match self.ready.try_push(task) {
                Ok(()) => break,
                Err(back) => {
                    task = back;
                    self.wake();
                    std::thread::yield_now();
                }
            }
        }
        self.wake();
    }
}

/// A cheap, sendable handle to a reactor on another thread.
#[derive(Clone)]
pub(crate) struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    pub(crate) fn wake(&self) {
        self.shared.wake();
    }

    pub(crate) fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.wake();
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("reactor::Handle").finish()
    }
}

/// State shared between the reactor and same-thread handles.
pub(crate) struct LocalState {
    pub(crate) registrations: Slab<Registration>,
    registry: mio::Registry,
    /// Synthetic readiness scheduled by tasks, delivered to the driver
    /// on the next loop turn.
    deferred: Vec<(usize, bool, bool)>,
}

/// A clonable same-thread handle used by tasks to reach their reactor.
#[derive(Clone)]
pub(crate) struct LocalHandle {
    local: Rc<RefCell<LocalState>>,
    shared: Arc<Shared>,
}

impl LocalHandle {
    /// Asks the driver to revisit `key` as if it had become ready. The
    /// request is honored on the current loop turn, before the reactor
    /// sleeps again.
    pub(crate) fn schedule_io(&self, key: usize, readable: bool, writable: bool) {
        self.local.borrow_mut().deferred.push((key, readable, writable));
        self.shared.wake();
    }

    pub(crate) fn park_reader(&self, key: usize, waker: &Waker) {
        let mut local = self.local.borrow_mut();
        match local.registrations.get_mut(key) {
            Some(Registration::Futures { reader, .. }) => {
                *reader = Some(waker.clone());
            }
            _ => waker.wake_by_ref(),
        }
    }

    pub(crate) fn park_writer(&self, key: usize, waker: &Waker) {
        let mut local = self.local.borrow_mut();
        match local.registrations.get_mut(key) {
            Some(Registration::Futures { writer, .. }) => {
                *writer = Some(waker.clone());
            }
            _ => waker.wake_by_ref(),
        }
    }

    /// Removes a source registration. Parked wakers are dropped;
    /// readiness for a deregistered source is never delivered.
    pub(crate) fn deregister(&self, key: usize, source: &mut impl mio::event::Source) {
        let mut local = self.local.borrow_mut();
        if local.registrations.contains(key) {
            local.registrations.remove(key);
        }
        if let Err(err) = local.registry.deregister(source) {
            trace!("deregister failed: {}", err);
        }
    }
}

impl fmt::Debug for LocalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("reactor::LocalHandle").finish()
    }
}

/// The event loop. Owns the poller, the source registrations, the
/// deadline timers and the task set.
pub(crate) struct Reactor {
    poll: Poll,
    events: Events,
    shared: Arc<Shared>,
    local: Rc<RefCell<LocalState>>,
    tasks: TaskSet,
    timers: HashMap<u64, Instant>,
}

impl Reactor {
    pub(crate) fn new() -> io::Result<Reactor> {
        let poll = Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), WAKE)?;
        let registry = poll.registry().try_clone()?;
        let shared = Arc::new(Shared {
            waker,
            ready: MpmcQueue::new(READY_QUEUE_CAPACITY),
            stopped: AtomicBool::new(false),
        });
        let local = Rc::new(RefCell::new(LocalState {
            registrations: Slab::new(),
            registry,
            deferred: Vec::new(),
        }));
        Ok(Reactor {
            poll,
            events: Events::with_capacity(1024),
            shared,
            local,
            tasks: TaskSet::new(),
            timers: HashMap::new(),
        })
    }

    pub(crate) fn handle(&self) -> Handle {
        Handle {
            shared: self.shared.clone(),
        }
    }

    pub(crate) fn local_handle(&self) -> LocalHandle {
        LocalHandle {
            local: self.local.clone(),
            shared: self.shared.clone(),
        }
    }

    /// Registers a source whose readiness is delivered to the driver.
    pub(crate) fn register_machine(
        &mut self,
        source: &mut impl mio::event::Source,
        interest: Interest,
    ) -> io::Result<usize> {
        self.register(source, interest, Registration::Machine)
    }

    /// Registers a source whose readiness wakes parked task wakers.
    pub(crate) fn register_futures(
        &mut self,
        source: &mut impl mio::event::Source,
        interest: Interest,
    ) -> io::Result<usize> {
        self.register(
            source,
            interest,
            Registration::Futures {
                reader: None,
                writer: None,
            },
        )
    }

    fn register(
        &mut self,
        source: &mut impl mio::event::Source,
        interest: Interest,
        registration: Registration,
    ) -> io::Result<usize> {
        let mut local = self.local.borrow_mut();
        let key = local.registrations.insert(registration);
        match local.registry.register(source, Token(key), interest) {
            Ok(()) => Ok(key),
            Err(err) => {
                local.registrations.remove(key);
                Err(err)
            }
        }
    }

    /// Switches an existing machine registration to futures mode. Used
    /// when a TLS connection negotiates `h2` and hands its socket to a
    /// connection task.
    pub(crate) fn set_futures_mode(&mut self, key: usize) {
        let mut local = self.local.borrow_mut();
        if let Some(slot) = local.registrations.get_mut(key) {
            *slot = Registration::Futures {
                reader: None,
                writer: None,
            };
        }
    }

    pub(crate) fn deregister(&mut self, key: usize, source: &mut impl mio::event::Source) {
        self.local_handle().deregister(key, source);
        self.timers.remove(&(key as u64));
    }

    /// Arms (or re-arms) a deadline timer. `key` is caller-allocated.
    pub(crate) fn set_timer(&mut self, key: u64, deadline: Instant) {
        self.timers.insert(key, deadline);
    }

    pub(crate) fn clear_timer(&mut self, key: u64) {
        self.timers.remove(&key);
    }

    /// Spawns a future onto this reactor's task set. The future is
    /// polled for the first time on the next loop turn.
    pub(crate) fn spawn<F>(&mut self, fut: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let id = self.tasks.insert(Box::pin(fut), &self.shared);
        self.shared.schedule(id);
    }

    /// Runs the loop until [`Handle::stop`] is observed.
    pub(crate) fn run<D: Driver>(&mut self, driver: &mut D) -> crate::Result<()> {
        trace!("reactor run");
        while !self.shared.stopped.load(Ordering::Acquire) {
            self.turn(driver, None)?;
        }
        trace!("reactor stopped");
        Ok(())
    }

    /// A single poll-dispatch cycle; `max_wait` caps the sleep.
    pub(crate) fn turn<D: Driver>(
        &mut self,
        driver: &mut D,
        max_wait: Option<Duration>,
    ) -> crate::Result<()> {
        // Drain everything runnable before sleeping: resumable tasks,
        // then synthetic readiness scheduled by tasks that completed a
        // response.
        loop {
            let mut progressed = self.poll_ready_tasks();
            progressed |= self.flush_deferred(driver);
            if !progressed {
                break;
            }
        }

        let timeout = self.next_timeout(max_wait);
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(crate::Error::new_io(err)),
        }

        let mut ready = Vec::with_capacity(self.events.iter().count());
        for event in self.events.iter() {
            if event.token() == WAKE {
                continue;
            }
            ready.push((
                event.token().0,
                event.is_readable() || event.is_read_closed(),
                event.is_writable() || event.is_write_closed(),
            ));
        }

        for (key, readable, writable) in ready {
            enum Mode {
                Machine,
                Futures(Option<Waker>, Option<Waker>),
                Gone,
            }
            let mode = {
                let mut local = self.local.borrow_mut();
                match local.registrations.get_mut(key) {
                    Some(Registration::Machine) => Mode::Machine,
                    Some(Registration::Futures { reader, writer }) => Mode::Futures(
                        if readable { reader.take() } else { None },
                        if writable { writer.take() } else { None },
                    ),
                    None => Mode::Gone,
                }
            };
            match mode {
                Mode::Machine => driver.on_readiness(self, key, readable, writable),
                Mode::Futures(reader, writer) => {
                    if let Some(waker) = reader {
                        waker.wake();
                    }
                    if let Some(waker) = writer {
                        waker.wake();
                    }
                }
                Mode::Gone => trace!("readiness for deregistered key {}", key),
            }
        }

        if !self.timers.is_empty() {
            let now = Instant::now();
            let expired: Vec<u64> = self
                .timers
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(key, _)| *key)
                .collect();
            for key in expired {
                self.timers.remove(&key);
                driver.on_timer(self, key, now);
            }
        }

        Ok(())
    }

    fn poll_ready_tasks(&mut self) -> bool {
        let mut progressed = false;
        while let Some(id) = self.shared.ready.try_pop() {
            self.tasks.run(id);
            progressed = true;
        }
        progressed
    }

    fn flush_deferred<D: Driver>(&mut self, driver: &mut D) -> bool {
        let deferred = {
            let mut local = self.local.borrow_mut();
            std::mem::take(&mut local.deferred)
        };
        let progressed = !deferred.is_empty();
        for (key, readable, writable) in deferred {
            let is_machine = matches!(
                self.local.borrow().registrations.get(key),
                Some(Registration::Machine)
            );
            if is_machine {
                driver.on_readiness(self, key, readable, writable);
            }
        }
        progressed
    }

    fn next_timeout(&self, max_wait: Option<Duration>) -> Option<Duration> {
        let timer = self.timers.values().min().map(|deadline| {
            deadline.saturating_duration_since(Instant::now())
        });
        match (timer, max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        }
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("sources", &self.local.borrow().registrations.len())
            .field("timers", &self.timers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::{Read, Write};

    /// A driver that accepts one connection and echoes until close.
    struct EchoDriver {
        listener: mio::net::TcpListener,
        listener_key: usize,
        conns: HashMap<usize, mio::net::TcpStream>,
        served: usize,
    }

    impl Driver for EchoDriver {
        fn on_readiness(
            &mut self,
            reactor: &mut Reactor,
            key: usize,
            readable: bool,
            _writable: bool,
        ) {
            if key == self.listener_key {
                while let Ok((mut stream, _)) = self.listener.accept() {
                    let key = reactor
                        .register_machine(&mut stream, Interest::READABLE)
                        .expect("register conn");
                    self.conns.insert(key, stream);
                }
                return;
            }
            if !readable {
                return;
            }
            let mut gone = false;
            if let Some(stream) = self.conns.get_mut(&key) {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) => {
                            gone = true;
                            break;
                        }
                        Ok(n) => {
                            stream.write_all(&buf[..n]).expect("echo write");
                            self.served += n;
                        }
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(_) => {
                            gone = true;
                            break;
                        }
                    }
                }
            }
            if gone {
                if let Some(mut stream) = self.conns.remove(&key) {
                    reactor.deregister(key, &mut stream);
                }
            }
        }

        fn on_timer(&mut self, _reactor: &mut Reactor, _key: u64, _now: Instant) {}
    }

    #[test]
    fn echo_roundtrip_over_loopback() {
        let mut reactor = Reactor::new().expect("reactor");
        let mut listener =
            mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).expect("bind");
        let addr = listener.local_addr().expect("addr");
        let listener_key = reactor
            .register_machine(&mut listener, Interest::READABLE)
            .expect("register listener");
        let mut driver = EchoDriver {
            listener,
            listener_key,
            conns: HashMap::new(),
            served: 0,
        };

        let handle = reactor.handle();
        let client = std::thread::spawn(move || {
            let mut stream = std::net::TcpStream::connect(addr).expect("connect");
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .expect("timeout");
            stream.write_all(b"ping pong").expect("write");
            let mut echoed = [0u8; 9];
            stream.read_exact(&mut echoed).expect("read");
            assert_eq!(&echoed, b"ping pong");
            drop(stream);
            handle.stop();
        });

        reactor.run(&mut driver).expect("run");
        client.join().expect("client");
        assert_eq!(driver.served, 9);
    }

    #[test]
    fn tasks_resume_on_reactor_thread_after_cross_thread_wake() {
        struct NoopDriver;
        impl Driver for NoopDriver {
            fn on_readiness(&mut self, _: &mut Reactor, _: usize, _: bool, _: bool) {}
            fn on_timer(&mut self, _: &mut Reactor, _: u64, _: Instant) {}
        }

        let mut reactor = Reactor::new().expect("reactor");
        let reactor_thread = std::thread::current().id();
        let (tx, rx) = futures_channel::oneshot::channel::<u32>();
        let handle = reactor.handle();
        let stop = reactor.handle();

        reactor.spawn(async move {
            // Suspended until the other thread fulfils the promise; the
            // resume happens here, on the owning thread.
            let value = rx.await.expect("promise fulfilled");
            assert_eq!(value, 7);
            assert_eq!(std::thread::current().id(), reactor_thread);
            stop.stop();
        });

        let producer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            tx.send(7).expect("send");
            handle.wake();
        });

        let mut driver = NoopDriver;
        reactor.run(&mut driver).expect("run");
        producer.join().expect("producer");
    }
}
