//! Pool of inactive connection tokens.

use crate::runtime::buffer::HandlePool;
use crate::runtime::protocol::ProtocolCodec;
use crate::runtime::ConnectionToken;
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Lock-free pool of reusable connection tokens.
///
/// Each token takes its two I/O handles from the shared [`HandlePool`] when it
/// is built and keeps them for good. Popping from an empty pool builds a new
/// token instead of failing.
pub struct ConnectionPool {
    free: SegQueue<Arc<ConnectionToken>>,
    handles: Arc<HandlePool>,
    codec: Arc<dyn ProtocolCodec>,
    send_timeout: Duration,
    created: AtomicUsize,
}

impl ConnectionPool {
    /// Create a pool warmed with `initial` tokens.
    pub fn new(
        initial: usize,
        handles: Arc<HandlePool>,
        codec: Arc<dyn ProtocolCodec>,
        send_timeout: Duration,
    ) -> Self {
        let pool = Self {
            free: SegQueue::new(),
            handles,
            codec,
            send_timeout,
            created: AtomicUsize::new(0),
        };
        for _ in 0..initial {
            let token = pool.build();
            pool.free.push(token);
        }
        pool
    }

    /// Take an inactive token, building one if the pool is empty.
    pub fn pop(&self) -> Arc<ConnectionToken> {
        match self.free.pop() {
            Some(token) => token,
            None => {
                debug!(created = self.created(), "token pool exhausted, building a new token");
                self.build()
            }
        }
    }

    /// Return a token for reuse. Its handles stay attached to it.
    pub fn push(&self, token: Arc<ConnectionToken>) {
        if token.unbind().is_some() {
            warn!("active token returned to the pool, socket dropped");
        }
        self.free.push(token);
    }

    /// Number of tokens waiting in the pool.
    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// Total tokens ever built.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    pub fn handles(&self) -> &Arc<HandlePool> {
        &self.handles
    }

    fn build(&self) -> Arc<ConnectionToken> {
        self.created.fetch_add(1, Ordering::AcqRel);
        ConnectionToken::new(
            self.handles.pop(),
            self.handles.pop(),
            Arc::clone(&self.codec),
            self.send_timeout,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::LineCodec;
    use crate::runtime::buffer::discard_sink;

    fn pool(initial: usize, handles: usize) -> ConnectionPool {
        ConnectionPool::new(
            initial,
            Arc::new(HandlePool::new(handles, 32, discard_sink())),
            Arc::new(LineCodec::default()),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_warm_pool_takes_two_handles_per_token() {
        let pool = pool(3, 8);
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.created(), 3);
        assert_eq!(pool.handles().available(), 2);

        let token = pool.pop();
        assert!(!token.is_active());
        assert_ne!(token.read_handle().index(), token.write_handle().index());
    }

    #[test]
    fn test_token_keeps_handles_across_reuse() {
        let pool = pool(1, 2);
        let token = pool.pop();
        let (read, write) = (token.read_handle().index(), token.write_handle().index());
        pool.push(token);

        let again = pool.pop();
        assert_eq!(again.read_handle().index(), read);
        assert_eq!(again.write_handle().index(), write);
        assert_eq!(pool.created(), 1);
    }

    #[test]
    fn test_exhausted_pool_builds_tokens() {
        let pool = pool(1, 2);
        let a = pool.pop();
        let b = pool.pop();

        assert_eq!(pool.created(), 2);
        // Handle pool grew to back the second token
        assert_eq!(pool.handles().allocated(), 4);

        pool.push(a);
        pool.push(b);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_concurrent_pop_push_conserves_tokens() {
        let pool = pool(8, 16);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..500 {
                        let token = pool.pop();
                        pool.push(token);
                    }
                });
            }
        });

        assert_eq!(pool.len(), pool.created());
        // Every handle is either owned by a token or still pooled
        assert_eq!(
            pool.handles().available() + 2 * pool.created(),
            pool.handles().allocated()
        );
    }
}
