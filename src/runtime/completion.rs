//! Completion events and the dispatcher that routes them.
//!
//! Every finished read or write, whether it finished inline while being armed
//! or later on a worker thread, becomes a [`Completion`]. The dispatcher hands
//! each completion to exactly one of two places: a processing hook or the
//! release path.

use crate::error::Error;
use crate::runtime::{ConnectionId, ConnectionToken};
use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Type of operation that completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Accept on the listening socket. Never routed to a connection.
    Accept,
    Read,
    Write,
}

#[derive(Debug)]
pub enum Status {
    Success,
    Fault(io::Error),
}

/// One finished operation on a token's handle.
#[derive(Debug)]
pub struct Completion {
    pub token: Arc<ConnectionToken>,
    pub conn_id: ConnectionId,
    pub kind: OpKind,
    pub bytes: usize,
    pub status: Status,
}

impl Completion {
    pub fn new(
        token: Arc<ConnectionToken>,
        conn_id: ConnectionId,
        kind: OpKind,
        result: io::Result<usize>,
    ) -> Self {
        let (bytes, status) = match result {
            Ok(n) => (n, Status::Success),
            Err(e) => (0, Status::Fault(e)),
        };
        Self {
            token,
            conn_id,
            kind,
            bytes,
            status,
        }
    }
}

/// Callback bound to every I/O handle at creation.
pub type CompletionSink = Arc<dyn Fn(Completion) + Send + Sync>;

/// Processing and release hooks the dispatcher routes to.
///
/// Hooks push completions produced by re-arming inline onto `follow_ups`
/// instead of dispatching them, so bursts of inline completions are drained
/// by a loop rather than by recursion.
pub trait CompletionHooks {
    fn process_read(
        &self,
        token: &Arc<ConnectionToken>,
        conn_id: ConnectionId,
        bytes: usize,
        follow_ups: &mut VecDeque<Completion>,
    ) -> Result<(), Error>;

    fn process_write(
        &self,
        token: &Arc<ConnectionToken>,
        conn_id: ConnectionId,
        bytes: usize,
        follow_ups: &mut VecDeque<Completion>,
    ) -> Result<(), Error>;

    /// Tear down `conn_id`. Must be idempotent.
    fn release(&self, conn_id: ConnectionId, reason: Option<Error>) -> bool;
}

/// Where a single completion was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Processed,
    Released,
    /// The completion belonged to an activation that already ended.
    Stale,
}

pub struct CompletionDispatcher<'a, H: ?Sized> {
    hooks: &'a H,
}

impl<'a, H: CompletionHooks + ?Sized> CompletionDispatcher<'a, H> {
    pub fn new(hooks: &'a H) -> Self {
        Self { hooks }
    }

    /// Route `completion` and every inline completion it triggers.
    pub fn dispatch(&self, completion: Completion) {
        let mut queue = VecDeque::with_capacity(2);
        queue.push_back(completion);
        self.drain(queue);
    }

    pub fn drain(&self, mut queue: VecDeque<Completion>) {
        while let Some(completion) = queue.pop_front() {
            self.route(completion, &mut queue);
        }
    }

    /// Route one completion; inline follow-ups are appended to `follow_ups`.
    pub fn route(&self, completion: Completion, follow_ups: &mut VecDeque<Completion>) -> Route {
        let Completion {
            token,
            conn_id,
            kind,
            bytes,
            status,
        } = completion;

        if !token.is_bound_to(conn_id) {
            trace!(%conn_id, ?kind, "completion for a released connection");
            return Route::Stale;
        }

        let outcome = match (status, kind) {
            (Status::Fault(e), _) => {
                debug!(%conn_id, ?kind, error = %e, "operation failed");
                Err(Error::Socket(e))
            }
            (Status::Success, OpKind::Read) if bytes == 0 => {
                debug!(%conn_id, "connection closed by peer");
                Err(Error::PeerClosed)
            }
            (Status::Success, OpKind::Read) => guarded(conn_id, kind, || {
                self.hooks.process_read(&token, conn_id, bytes, follow_ups)
            }),
            (Status::Success, OpKind::Write) => guarded(conn_id, kind, || {
                self.hooks.process_write(&token, conn_id, bytes, follow_ups)
            }),
            (Status::Success, kind) => Err(Error::UnexpectedOperation(kind)),
        };

        match outcome {
            Ok(()) => Route::Processed,
            Err(reason) => {
                self.hooks.release(conn_id, Some(reason));
                Route::Released
            }
        }
    }
}

/// Run a processing hook, turning a panic into an error so the connection is
/// still released.
fn guarded(
    conn_id: ConnectionId,
    kind: OpKind,
    hook: impl FnOnce() -> Result<(), Error>,
) -> Result<(), Error> {
    panic::catch_unwind(AssertUnwindSafe(hook)).unwrap_or_else(|payload| {
        let error = Error::from_panic(payload);
        error!(%conn_id, ?kind, %error, "processing hook panicked");
        Err(error)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::LineCodec;
    use crate::runtime::buffer::{discard_sink, HandlePool};
    use crate::runtime::token::tests::socket_pair;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, PartialEq, Eq)]
    enum Call {
        Read(usize),
        Write(usize),
        Release(String),
    }

    /// Records every hook call. Reads can be told to fail or to produce an
    /// inline follow-up completion.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Call>>,
        fail_reads: bool,
        panic_writes: bool,
        chain_reads: Mutex<usize>,
    }

    impl CompletionHooks for Recorder {
        fn process_read(
            &self,
            token: &Arc<ConnectionToken>,
            conn_id: ConnectionId,
            bytes: usize,
            follow_ups: &mut VecDeque<Completion>,
        ) -> Result<(), Error> {
            self.calls.lock().unwrap().push(Call::Read(bytes));
            if self.fail_reads {
                return Err(Error::Handler("bad frame".into()));
            }
            let mut remaining = self.chain_reads.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                follow_ups.push_back(Completion::new(
                    Arc::clone(token),
                    conn_id,
                    OpKind::Read,
                    Ok(bytes + 1),
                ));
            }
            Ok(())
        }

        fn process_write(
            &self,
            _token: &Arc<ConnectionToken>,
            _conn_id: ConnectionId,
            bytes: usize,
            _follow_ups: &mut VecDeque<Completion>,
        ) -> Result<(), Error> {
            self.calls.lock().unwrap().push(Call::Write(bytes));
            if self.panic_writes {
                panic!("write hook exploded");
            }
            Ok(())
        }

        fn release(&self, _conn_id: ConnectionId, reason: Option<Error>) -> bool {
            let reason = reason.map(|e| e.to_string()).unwrap_or_default();
            self.calls.lock().unwrap().push(Call::Release(reason));
            true
        }
    }

    async fn bound_token() -> (Arc<ConnectionToken>, ConnectionId, tokio::net::TcpStream) {
        let pool = HandlePool::new(2, 64, discard_sink());
        let token = ConnectionToken::new(
            pool.pop(),
            pool.pop(),
            Arc::new(LineCodec::default()),
            Duration::from_secs(1),
        );
        let (server, client) = socket_pair().await;
        let conn_id = token.bind(server);
        (token, conn_id, client)
    }

    fn route(hooks: &Recorder, completion: Completion) -> Route {
        CompletionDispatcher::new(hooks).route(completion, &mut VecDeque::new())
    }

    #[tokio::test]
    async fn test_decision_table() {
        let (token, conn_id, _client) = bound_token().await;
        let hooks = Recorder::default();
        let c = |kind, result| Completion::new(Arc::clone(&token), conn_id, kind, result);

        assert_eq!(route(&hooks, c(OpKind::Read, Ok(7))), Route::Processed);
        assert_eq!(route(&hooks, c(OpKind::Write, Ok(3))), Route::Processed);
        assert_eq!(route(&hooks, c(OpKind::Write, Ok(0))), Route::Processed);
        assert_eq!(route(&hooks, c(OpKind::Read, Ok(0))), Route::Released);
        assert_eq!(
            route(&hooks, c(OpKind::Read, Err(io::ErrorKind::ConnectionReset.into()))),
            Route::Released
        );
        assert_eq!(route(&hooks, c(OpKind::Accept, Ok(1))), Route::Released);

        let calls = hooks.calls.lock().unwrap();
        assert_eq!(calls[0], Call::Read(7));
        assert_eq!(calls[1], Call::Write(3));
        assert_eq!(calls[2], Call::Write(0));
        assert_eq!(calls[3], Call::Release("peer closed the connection".into()));
        assert!(matches!(&calls[4], Call::Release(r) if r.starts_with("socket fault")));
        assert!(matches!(&calls[5], Call::Release(r) if r.contains("Accept")));
        assert_eq!(calls.len(), 6);
    }

    #[tokio::test]
    async fn test_hook_failure_releases() {
        let (token, conn_id, _client) = bound_token().await;
        let hooks = Recorder {
            fail_reads: true,
            ..Default::default()
        };

        let completion = Completion::new(Arc::clone(&token), conn_id, OpKind::Read, Ok(4));
        assert_eq!(route(&hooks, completion), Route::Released);

        let calls = hooks.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(matches!(&calls[1], Call::Release(r) if r.contains("bad frame")));
    }

    #[tokio::test]
    async fn test_hook_panic_releases() {
        let (token, conn_id, _client) = bound_token().await;
        let hooks = Recorder {
            panic_writes: true,
            ..Default::default()
        };

        let completion = Completion::new(Arc::clone(&token), conn_id, OpKind::Write, Ok(2));
        assert_eq!(route(&hooks, completion), Route::Released);

        let calls = hooks.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], Call::Write(2));
        assert!(matches!(&calls[1], Call::Release(r) if r.contains("write hook exploded")));
    }

    #[tokio::test]
    async fn test_stale_completion_is_dropped() {
        let (token, conn_id, _client) = bound_token().await;
        let hooks = Recorder::default();
        token.unbind();

        let completion = Completion::new(Arc::clone(&token), conn_id, OpKind::Read, Ok(0));
        assert_eq!(route(&hooks, completion), Route::Stale);
        assert!(hooks.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inline_follow_ups_drain_iteratively() {
        let (token, conn_id, _client) = bound_token().await;
        let hooks = Recorder {
            chain_reads: Mutex::new(10_000),
            ..Default::default()
        };

        // A long chain of inline completions must not grow the stack
        CompletionDispatcher::new(&hooks).dispatch(Completion::new(
            Arc::clone(&token),
            conn_id,
            OpKind::Read,
            Ok(1),
        ));

        let calls = hooks.calls.lock().unwrap();
        assert_eq!(calls.len(), 10_001);
        assert_eq!(calls.last(), Some(&Call::Read(10_001)));
    }
}
