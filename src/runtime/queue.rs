//! Bounded lock-free queues.
//!
//! Two flavors, both fixed-capacity and non-blocking: a single-producer
//! single-consumer ring in [`spsc`], and the multi-producer
//! multi-consumer [`MpmcQueue`]. Overflow is reported as an `Err`; no
//! operation blocks or allocates after construction.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Pads a value out to its own cache line so producer and consumer
/// positions never share one.
#[repr(align(64))]
pub(crate) struct CachePadded<T>(pub(crate) T);

fn assert_capacity(capacity: usize) {
    assert!(capacity >= 1, "queue capacity must be at least 1");
    assert!(
        capacity.is_power_of_two(),
        "queue capacity must be a power of two"
    );
}

/// Single-producer single-consumer bounded queue.
pub mod spsc {
    use super::*;

    struct Inner<T> {
        mask: usize,
        buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
        /// Consumer position. Only stored by the consumer.
        head: CachePadded<AtomicUsize>,
        /// Producer position. Only stored by the producer.
        tail: CachePadded<AtomicUsize>,
    }

    unsafe impl<T: Send> Send for Inner<T> {}
    unsafe impl<T: Send> Sync for Inner<T> {}

    impl<T> Inner<T> {
        fn capacity(&self) -> usize {
            self.mask + 1
        }
    }

    impl<T> Drop for Inner<T> {
        fn drop(&mut self) {
            // Both handles are gone; plain loads are fine.
            let mut head = self.head.0.load(Ordering::Relaxed);
            let tail = self.tail.0.load(Ordering::Relaxed);
            while head != tail {
                unsafe {
                    (*self.buf[head & self.mask].get()).assume_init_drop();
                }
                head = head.wrapping_add(1);
            }
        }
    }

    /// Creates a bounded SPSC channel with the given power-of-two
    /// capacity.
    pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
        assert_capacity(capacity);
        let buf = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let inner = Arc::new(Inner {
            mask: capacity - 1,
            buf,
            head: CachePadded(AtomicUsize::new(0)),
            tail: CachePadded(AtomicUsize::new(0)),
        });
        (
            Sender {
                inner: inner.clone(),
                cached_head: 0,
            },
            Receiver {
                inner,
                cached_tail: 0,
            },
        )
    }

    /// The producing half. Not clonable; exactly one producer exists.
    pub struct Sender<T> {
        inner: Arc<Inner<T>>,
        /// Last observed consumer position; refreshed only on apparent
        /// full so pushes normally never touch the consumer's line.
        cached_head: usize,
    }

    impl<T> Sender<T> {
        /// Attempts to push. Returns the value back if the queue is
        /// full.
        pub fn try_send(&mut self, value: T) -> Result<(), T> {
            let tail = self.inner.tail.0.load(Ordering::Relaxed);
            if tail.wrapping_sub(self.cached_head) == self.inner.capacity() {
                self.cached_head = self.inner.head.0.load(Ordering::Acquire);
                if tail.wrapping_sub(self.cached_head) == self.inner.capacity() {
                    return Err(value);
                }
            }
            unsafe {
                (*self.inner.buf[tail & self.inner.mask].get()).write(value);
            }
            self.inner
                .tail
                .0
                .store(tail.wrapping_add(1), Ordering::Release);
            Ok(())
        }

        /// Approximate number of queued items. For reporting only.
        pub fn len(&self) -> usize {
            let tail = self.inner.tail.0.load(Ordering::Relaxed);
            let head = self.inner.head.0.load(Ordering::Relaxed);
            tail.wrapping_sub(head)
        }

        /// Whether the queue appears empty.
        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    impl<T> fmt::Debug for Sender<T> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("spsc::Sender")
                .field("len", &self.len())
                .finish()
        }
    }

    /// The consuming half. Not clonable; exactly one consumer exists.
    pub struct Receiver<T> {
        inner: Arc<Inner<T>>,
        cached_tail: usize,
    }

    impl<T> Receiver<T> {
        /// Attempts to pop. Returns `None` if the queue is empty.
        pub fn try_recv(&mut self) -> Option<T> {
            let head = self.inner.head.0.load(Ordering::Relaxed);
            if head == self.cached_tail {
                self.cached_tail = self.inner.tail.0.load(Ordering::Acquire);
                if head == self.cached_tail {
                    return None;
                }
            }
            let value = unsafe {
                (*self.inner.buf[head & self.inner.mask].get()).assume_init_read()
            };
            self.inner
                .head
                .0
                .store(head.wrapping_add(1), Ordering::Release);
            Some(value)
        }

        /// Approximate number of queued items. For reporting only.
        pub fn len(&self) -> usize {
            let tail = self.inner.tail.0.load(Ordering::Relaxed);
            let head = self.inner.head.0.load(Ordering::Relaxed);
            tail.wrapping_sub(head)
        }

        /// Whether the queue appears empty.
        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    impl<T> fmt::Debug for Receiver<T> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("spsc::Receiver")
                .field("len", &self.len())
                .finish()
        }
    }
}

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

struct MpmcInner<T> {
    mask: usize,
    buf: Box<[Slot<T>]>,
    enqueue_pos: CachePadded<AtomicUsize>,
    dequeue_pos: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Send for MpmcInner<T> {}
unsafe impl<T: Send> Sync for MpmcInner<T> {}

impl<T> Drop for MpmcInner<T> {
    fn drop(&mut self) {
        let mask = self.mask;
        let mut pos = self.dequeue_pos.0.load(Ordering::Relaxed);
        loop {
            let slot = &self.buf[pos & mask];
            if slot.sequence.load(Ordering::Relaxed) != pos.wrapping_add(1) {
                break;
            }
            unsafe {
                (*slot.value.get()).assume_init_drop();
            }
            pos = pos.wrapping_add(1);
        }
    }
}

/// Multi-producer multi-consumer bounded queue.
///
/// Each slot carries a sequence number: a producer claims position `p`
/// when `sequence == p` (compare-and-set on the claim position), writes
/// the payload and publishes `sequence = p + 1`; a consumer takes at
/// `p` when `sequence == p + 1` and republishes
/// `sequence = p + capacity`.
pub struct MpmcQueue<T> {
    inner: Arc<MpmcInner<T>>,
}

impl<T> MpmcQueue<T> {
    /// Creates a queue with the given power-of-two capacity.
    pub fn new(capacity: usize) -> MpmcQueue<T> {
        assert_capacity(capacity);
        let buf = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        MpmcQueue {
            inner: Arc::new(MpmcInner {
                mask: capacity - 1,
                buf,
                enqueue_pos: CachePadded(AtomicUsize::new(0)),
                dequeue_pos: CachePadded(AtomicUsize::new(0)),
            }),
        }
    }

    /// Attempts to push. Returns the value back if the queue is full.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        let inner = &*self.inner;
        let mut pos = inner.enqueue_pos.0.load(Ordering::Relaxed);
        loop {
            let slot = &inner.buf[pos & inner.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;
            if diff == 0 {
                match inner.enqueue_pos.0.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe {
                            (*slot.value.get()).write(value);
                        }
                        slot.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return Err(value);
            } else {
                pos = inner.enqueue_pos.0.load(Ordering::Relaxed);
            }
        }
    }

    /// Attempts to pop. Returns `None` if the queue is empty.
    pub fn try_pop(&self) -> Option<T> {
        let inner = &*self.inner;
        let mut pos = inner.dequeue_pos.0.load(Ordering::Relaxed);
        loop {
            let slot = &inner.buf[pos & inner.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - pos.wrapping_add(1) as isize;
            if diff == 0 {
                match inner.dequeue_pos.0.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.sequence
                            .store(pos.wrapping_add(inner.mask + 1), Ordering::Release);
                        return Some(value);
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = inner.dequeue_pos.0.load(Ordering::Relaxed);
            }
        }
    }

    /// Approximate number of queued items. For reporting only.
    pub fn len(&self) -> usize {
        let enq = self.inner.enqueue_pos.0.load(Ordering::Relaxed);
        let deq = self.inner.dequeue_pos.0.load(Ordering::Relaxed);
        enq.wrapping_sub(deq)
    }

    /// Whether the queue appears empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for MpmcQueue<T> {
    fn clone(&self) -> MpmcQueue<T> {
        MpmcQueue {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for MpmcQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpmcQueue")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn spsc_capacity_one() {
        let (mut tx, mut rx) = spsc::channel::<u32>(1);
        assert!(tx.try_send(1).is_ok());
        assert_eq!(tx.try_send(2), Err(2));
        assert_eq!(rx.try_recv(), Some(1));
        assert!(tx.try_send(3).is_ok());
        assert_eq!(rx.try_recv(), Some(3));
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn spsc_fifo_order() {
        let (mut tx, mut rx) = spsc::channel::<u32>(8);
        for i in 0..8 {
            tx.try_send(i).unwrap();
        }
        assert!(tx.try_send(99).is_err());
        for i in 0..8 {
            assert_eq!(rx.try_recv(), Some(i));
        }
    }

    #[test]
    fn spsc_stress_sum() {
        const COUNT: u64 = 1_000_000;
        let (mut tx, mut rx) = spsc::channel::<u64>(1024);
        let producer = thread::spawn(move || {
            for i in 0..COUNT {
                let mut v = i;
                loop {
                    match tx.try_send(v) {
                        Ok(()) => break,
                        Err(back) => {
                            v = back;
                            thread::yield_now();
                        }
                    }
                }
            }
        });
        let mut sum = 0u64;
        let mut received = 0u64;
        while received < COUNT {
            match rx.try_recv() {
                Some(v) => {
                    sum += v;
                    received += 1;
                }
                None => thread::yield_now(),
            }
        }
        producer.join().unwrap();
        assert_eq!(sum, 499_999_500_000);
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn mpmc_capacity_one() {
        let q = MpmcQueue::<u32>::new(1);
        assert!(q.try_push(1).is_ok());
        assert_eq!(q.try_push(2), Err(2));
        assert_eq!(q.try_pop(), Some(1));
        assert!(q.try_push(3).is_ok());
        assert_eq!(q.try_pop(), Some(3));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn mpmc_each_push_popped_once() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 50_000;
        let q = MpmcQueue::<u64>::new(256);
        let mut producers = Vec::new();
        for p in 0..PRODUCERS {
            let q = q.clone();
            producers.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let mut v = p * PER_PRODUCER + i;
                    loop {
                        match q.try_push(v) {
                            Ok(()) => break,
                            Err(back) => {
                                v = back;
                                thread::yield_now();
                            }
                        }
                    }
                }
            }));
        }
        let total = PRODUCERS * PER_PRODUCER;
        let mut consumers = Vec::new();
        let popped = Arc::new(AtomicUsize::new(0));
        let sum = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let q = q.clone();
            let popped = popped.clone();
            let sum = sum.clone();
            consumers.push(thread::spawn(move || loop {
                if popped.load(Ordering::Relaxed) as u64 >= total {
                    break;
                }
                match q.try_pop() {
                    Some(v) => {
                        sum.fetch_add(v as usize, Ordering::Relaxed);
                        popped.fetch_add(1, Ordering::Relaxed);
                    }
                    None => thread::yield_now(),
                }
            }));
        }
        for t in producers {
            t.join().unwrap();
        }
        for t in consumers {
            t.join().unwrap();
        }
        assert_eq!(popped.load(Ordering::Relaxed) as u64, total);
        let expected: u64 = (0..total).sum();
        assert_eq!(sum.load(Ordering::Relaxed) as u64, expected);
    }
}
