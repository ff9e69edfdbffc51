//! Thread-local buffer pool for the encode path.
//!
//! Each thread keeps an array of fixed-size slots that are claimed with
//! a compare-and-set and handed out as [`PooledBuffer`]s. When every
//! slot is taken, or a buffer outgrows its slot, the buffer spills to an
//! owned heap allocation; call sites are identical either way.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Size of one pooled slot.
pub const SLOT_SIZE: usize = 4096;

const SLOT_COUNT: usize = 256;

struct Slot {
    taken: AtomicBool,
    data: UnsafeCell<[u8; SLOT_SIZE]>,
}

/// A pool of `SLOT_COUNT` fixed slots. One per thread; buffers may be
/// dropped on another thread, which is why claims are atomic.
pub struct BufferPool {
    slots: Box<[Slot]>,
    next: AtomicUsize,
}

unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

thread_local! {
    static POOL: Arc<BufferPool> = Arc::new(BufferPool::new());
}

impl BufferPool {
    fn new() -> BufferPool {
        let slots = (0..SLOT_COUNT)
            .map(|_| Slot {
                taken: AtomicBool::new(false),
                data: UnsafeCell::new([0u8; SLOT_SIZE]),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        BufferPool {
            slots,
            next: AtomicUsize::new(0),
        }
    }

    /// Scans from a rotating starting slot and claims the first free
    /// one. Returns `None` when every slot is taken.
    fn claim(self: &Arc<BufferPool>) -> Option<usize> {
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        for i in 0..SLOT_COUNT {
            let index = (start + i) % SLOT_COUNT;
            if self.slots[index]
                .taken
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Some(index);
            }
        }
        None
    }

    fn release(&self, index: usize) {
        self.slots[index].taken.store(false, Ordering::Release);
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool").finish()
    }
}

enum Storage {
    Pooled { pool: Arc<BufferPool>, index: usize },
    Heap(Vec<u8>),
}

/// A growable byte buffer that prefers a pooled slot and falls back to
/// the heap, releasing the slot when dropped or outgrown.
pub struct PooledBuffer {
    storage: Storage,
    len: usize,
}

impl PooledBuffer {
    /// Acquires a buffer from the current thread's pool, or a heap
    /// buffer if the pool is exhausted.
    pub fn acquire() -> PooledBuffer {
        POOL.with(|pool| match pool.claim() {
            Some(index) => PooledBuffer {
                storage: Storage::Pooled {
                    pool: pool.clone(),
                    index,
                },
                len: 0,
            },
            None => PooledBuffer {
                storage: Storage::Heap(Vec::with_capacity(SLOT_SIZE)),
                len: 0,
            },
        })
    }

    /// Acquires a buffer known to need `capacity` bytes up front.
    pub fn with_capacity(capacity: usize) -> PooledBuffer {
        if capacity > SLOT_SIZE {
            PooledBuffer {
                storage: Storage::Heap(Vec::with_capacity(capacity)),
                len: 0,
            }
        } else {
            PooledBuffer::acquire()
        }
    }

    /// Whether this buffer is backed by a pool slot.
    pub fn is_pooled(&self) -> bool {
        matches!(self.storage, Storage::Pooled { .. })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
        if let Storage::Heap(ref mut vec) = self.storage {
            vec.clear();
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match self.storage {
            Storage::Pooled { ref pool, index } => {
                // The slot is exclusively ours while `taken` is set.
                unsafe { &(&*pool.slots[index].data.get())[..self.len] }
            }
            Storage::Heap(ref vec) => &vec[..self.len],
        }
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        let new_len = self.len + bytes.len();
        match self.storage {
            Storage::Pooled { ref pool, index } if new_len <= SLOT_SIZE => {
                unsafe {
                    (&mut *pool.slots[index].data.get())[self.len..new_len]
                        .copy_from_slice(bytes);
                }
                self.len = new_len;
            }
            Storage::Pooled { .. } => {
                self.spill(new_len);
                self.extend_from_slice(bytes);
            }
            Storage::Heap(ref mut vec) => {
                vec.truncate(self.len);
                vec.extend_from_slice(bytes);
                self.len = new_len;
            }
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.extend_from_slice(&[v]);
    }

    pub fn put_u16_le(&mut self, v: u16) {
        self.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32_le(&mut self, v: u32) {
        self.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64_le(&mut self, v: u64) {
        self.extend_from_slice(&v.to_le_bytes());
    }

    /// Moves the contents into an owned heap vector, releasing the pool
    /// slot.
    fn spill(&mut self, capacity: usize) {
        let mut vec = Vec::with_capacity(capacity.max(SLOT_SIZE * 2));
        vec.extend_from_slice(self.as_slice());
        if let Storage::Pooled { ref pool, index } = self.storage {
            pool.release(index);
        }
        self.storage = Storage::Heap(vec);
    }

    /// Consumes the buffer, returning its bytes as an owned vector.
    pub fn into_vec(mut self) -> Vec<u8> {
        match std::mem::replace(&mut self.storage, Storage::Heap(Vec::new())) {
            Storage::Pooled { pool, index } => {
                let bytes =
                    unsafe { (&*pool.slots[index].data.get())[..self.len].to_vec() };
                pool.release(index);
                bytes
            }
            Storage::Heap(mut vec) => {
                vec.truncate(self.len);
                vec
            }
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Storage::Pooled { ref pool, index } = self.storage {
            pool.release(index);
        }
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len)
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

unsafe impl Send for PooledBuffer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooled_roundtrip() {
        let mut buf = PooledBuffer::acquire();
        assert!(buf.is_pooled());
        buf.extend_from_slice(b"hello ");
        buf.extend_from_slice(b"world");
        assert_eq!(buf.as_slice(), b"hello world");
        assert_eq!(buf.len(), 11);
    }

    #[test]
    fn growth_spills_to_heap() {
        let mut buf = PooledBuffer::acquire();
        let chunk = [0xABu8; 1024];
        for _ in 0..5 {
            buf.extend_from_slice(&chunk);
        }
        assert!(!buf.is_pooled());
        assert_eq!(buf.len(), 5 * 1024);
        assert!(buf.as_slice().iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn exhaustion_falls_back() {
        let held: Vec<_> = (0..SLOT_COUNT).map(|_| PooledBuffer::acquire()).collect();
        let extra = PooledBuffer::acquire();
        assert!(!extra.is_pooled());
        drop(held);
        let reclaimed = PooledBuffer::acquire();
        assert!(reclaimed.is_pooled());
    }

    #[test]
    fn into_vec_matches() {
        let mut buf = PooledBuffer::with_capacity(16);
        buf.put_u8(0xFA);
        buf.put_u16_le(2);
        buf.put_u32_le(0xDEAD_BEEF);
        assert_eq!(buf.into_vec(), vec![0xFA, 2, 0, 0xEF, 0xBE, 0xAD, 0xDE]);
    }
}
