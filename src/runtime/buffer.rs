//! Pooled I/O handles backed by one contiguous buffer arena.
//!
//! Every handle owns a fixed-size slice carved from a shared arena at pool
//! construction, so steady-state traffic never allocates. Handles are never
//! freed individually: they are popped when a connection token is built and
//! live with that token for the rest of the process.

use crate::runtime::completion::{Completion, CompletionSink, OpKind};
use crate::runtime::{ConnectionId, ConnectionToken};
use bytes::BytesMut;
use crossbeam_queue::SegQueue;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, trace};

/// Which activation a handle is currently serving.
struct Binding {
    owner: Weak<ConnectionToken>,
    conn_id: ConnectionId,
}

/// One reusable asynchronous-operation slot.
///
/// The completion sink is bound once at creation and shared by every
/// connection that later borrows the handle.
pub struct IoHandle {
    index: usize,
    buffer: Mutex<BytesMut>,
    binding: Mutex<Option<Binding>>,
    on_complete: CompletionSink,
}

impl IoHandle {
    fn new(index: usize, buffer: BytesMut, on_complete: CompletionSink) -> Self {
        Self {
            index,
            buffer: Mutex::new(buffer),
            binding: Mutex::new(None),
            on_complete,
        }
    }

    /// Position of this handle in allocation order.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Size of the handle's buffer slice.
    pub fn capacity(&self) -> usize {
        self.buffer().len()
    }

    /// Lock the buffer slice. Never held across an await point.
    pub(crate) fn buffer(&self) -> MutexGuard<'_, BytesMut> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Point the handle at the token activation it now serves.
    pub(crate) fn attach(&self, owner: Weak<ConnectionToken>, conn_id: ConnectionId) {
        *self.binding() = Some(Binding { owner, conn_id });
    }

    pub(crate) fn detach(&self) {
        *self.binding() = None;
    }

    /// Whether operations issued for `conn_id` may still touch the buffer.
    pub(crate) fn serves(&self, conn_id: ConnectionId) -> bool {
        self.binding()
            .as_ref()
            .is_some_and(|b| b.conn_id == conn_id)
    }

    /// Deliver the outcome of an asynchronous operation to the sink.
    ///
    /// Outcomes for an activation the handle no longer serves are dropped.
    pub(crate) fn complete(&self, conn_id: ConnectionId, kind: OpKind, result: io::Result<usize>) {
        let owner = match self.binding().as_ref() {
            Some(binding) if binding.conn_id == conn_id => binding.owner.upgrade(),
            _ => None,
        };
        match owner {
            Some(token) => (self.on_complete)(Completion::new(token, conn_id, kind, result)),
            None => trace!(handle = self.index, %conn_id, ?kind, "dropping stale completion"),
        }
    }

    fn binding(&self) -> MutexGuard<'_, Option<Binding>> {
        self.binding.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lock-free pool of I/O handles.
///
/// `pop` and `push` may be called from any thread without external locking.
/// An empty pool builds a fresh handle instead of blocking; the admission gate
/// bounds how often that can happen.
pub struct HandlePool {
    free: SegQueue<Arc<IoHandle>>,
    buffer_size: usize,
    initial: usize,
    allocated: AtomicUsize,
    on_complete: CompletionSink,
}

impl HandlePool {
    /// Create a pool of `count` handles sharing one arena of
    /// `count * buffer_size` bytes.
    pub fn new(count: usize, buffer_size: usize, on_complete: CompletionSink) -> Self {
        let free = SegQueue::new();
        let mut arena = BytesMut::zeroed(count * buffer_size);

        for index in 0..count {
            let slice = arena.split_to(buffer_size);
            free.push(Arc::new(IoHandle::new(index, slice, Arc::clone(&on_complete))));
        }

        Self {
            free,
            buffer_size,
            initial: count,
            allocated: AtomicUsize::new(count),
            on_complete,
        }
    }

    /// Take a handle, building a new one if the pool is empty.
    pub fn pop(&self) -> Arc<IoHandle> {
        match self.free.pop() {
            Some(handle) => handle,
            None => self.grow(),
        }
    }

    /// Return a handle for reuse.
    pub fn push(&self, handle: Arc<IoHandle>) {
        handle.detach();
        self.free.push(handle);
    }

    fn grow(&self) -> Arc<IoHandle> {
        let index = self.allocated.fetch_add(1, Ordering::AcqRel);
        debug!(
            index,
            buffer_size = self.buffer_size,
            "handle pool exhausted, allocating on demand"
        );
        Arc::new(IoHandle::new(
            index,
            BytesMut::zeroed(self.buffer_size),
            Arc::clone(&self.on_complete),
        ))
    }

    /// Size of each handle's buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of handles carved from the initial arena.
    pub fn initial_capacity(&self) -> usize {
        self.initial
    }

    /// Total handles ever created, including on-demand growth.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Number of handles currently sitting in the pool.
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
pub(crate) fn discard_sink() -> CompletionSink {
    Arc::new(|_| {})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_pool_basic() {
        let pool = HandlePool::new(4, 1024, discard_sink());

        assert_eq!(pool.initial_capacity(), 4);
        assert_eq!(pool.allocated(), 4);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.buffer_size(), 1024);

        let handles: Vec<_> = (0..4).map(|_| pool.pop()).collect();
        assert_eq!(pool.available(), 0);
        assert!(handles.iter().all(|h| h.capacity() == 1024));

        // Write and read through the slice
        handles[0].buffer()[0] = 42;
        assert_eq!(handles[0].buffer()[0], 42);

        for handle in handles {
            pool.push(handle);
        }
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.allocated(), 4);
    }

    #[test]
    fn test_arena_slices_are_disjoint_and_contiguous() {
        let pool = HandlePool::new(8, 256, discard_sink());
        let mut spans: Vec<(usize, usize)> = (0..8)
            .map(|_| {
                let handle = pool.pop();
                let start = handle.buffer().as_ptr() as usize;
                (start, start + handle.capacity())
            })
            .collect();
        spans.sort_unstable();

        for pair in spans.windows(2) {
            // Each slice ends exactly where the next begins
            assert_eq!(pair[0].1, pair[1].0);
        }
        assert_eq!(spans[7].1 - spans[0].0, 8 * 256);
    }

    #[test]
    fn test_exhausted_pool_grows_on_demand() {
        let pool = HandlePool::new(2, 64, discard_sink());
        let a = pool.pop();
        let b = pool.pop();
        let c = pool.pop();

        assert_eq!(pool.allocated(), 3);
        assert_eq!(c.index(), 2);
        assert_eq!(c.capacity(), 64);

        pool.push(a);
        pool.push(b);
        pool.push(c);
        // Never shrinks below what was handed out
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.allocated(), 3);
    }

    #[test]
    fn test_concurrent_pop_push_conserves_handles() {
        let pool = HandlePool::new(16, 32, discard_sink());

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        let h1 = pool.pop();
                        let h2 = pool.pop();
                        pool.push(h2);
                        pool.push(h1);
                    }
                });
            }
        });

        // Every handle ever created is back in the pool
        assert_eq!(pool.available(), pool.allocated());
        assert!(pool.allocated() >= 16);
    }

    #[test]
    fn test_detached_handle_drops_completion() {
        use std::sync::atomic::AtomicBool;

        let fired = Arc::new(AtomicBool::new(false));
        let sink: CompletionSink = {
            let fired = Arc::clone(&fired);
            Arc::new(move |_| fired.store(true, Ordering::SeqCst))
        };
        let pool = HandlePool::new(1, 16, sink);
        let handle = pool.pop();

        let conn_id = ConnectionId::new();
        assert!(!handle.serves(conn_id));
        handle.complete(conn_id, OpKind::Read, Ok(4));
        assert!(!fired.load(Ordering::SeqCst));
    }
}
