//! Connection tokens: the server-side resources of one logical connection.
//!
//! A token permanently owns a read handle and a write handle. It is either
//! pooled (no socket, not registered) or active (socket bound, registered
//! exactly once under its current connection id).

use crate::runtime::buffer::IoHandle;
use crate::runtime::completion::{Completion, OpKind};
use crate::runtime::protocol::{CodecError, Frame, ProtocolCodec};
use bytes::{Buf, BytesMut};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::AbortHandle;
use uuid::Uuid;

/// Identifier of one activation of a connection token.
///
/// A fresh id is generated every time a token is bound to a socket, so an id
/// never names two different connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outcome of arming an operation on a token's handle.
#[derive(Debug)]
pub enum Armed {
    /// Finished without waiting; the caller must dispatch it.
    Completed(Completion),
    /// In flight; the handle's sink will receive the completion.
    Pending,
    /// Nothing to do (no queued output).
    Idle,
    /// The token no longer serves the given connection id.
    Inactive,
}

/// What the write side should do after a write completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    /// More output is queued.
    More,
    /// Queue drained.
    Idle,
    /// Queue drained and the handler asked to close.
    Close,
}

#[derive(Default)]
struct TokenState {
    conn_id: Option<ConnectionId>,
    socket: Option<Arc<TcpStream>>,
    /// Bytes received but not yet forming a complete frame.
    pending: BytesMut,
    /// Encoded output not yet handed to a write operation.
    outbound: BytesMut,
    writing: bool,
    close_after_flush: bool,
    /// Reads are not re-armed until the outbound queue drains.
    read_paused: bool,
    read_op: Option<AbortHandle>,
    write_op: Option<AbortHandle>,
}

impl TokenState {
    fn socket_for(&self, conn_id: ConnectionId) -> Option<Arc<TcpStream>> {
        if self.conn_id == Some(conn_id) {
            self.socket.clone()
        } else {
            None
        }
    }

    fn clear(&mut self) -> Option<Arc<TcpStream>> {
        if let Some(op) = self.read_op.take() {
            op.abort();
        }
        if let Some(op) = self.write_op.take() {
            op.abort();
        }
        self.conn_id = None;
        self.pending.clear();
        self.outbound.clear();
        self.writing = false;
        self.close_after_flush = false;
        self.read_paused = false;
        self.socket.take()
    }
}

pub struct ConnectionToken {
    read: Arc<IoHandle>,
    write: Arc<IoHandle>,
    codec: Arc<dyn ProtocolCodec>,
    send_timeout: Duration,
    state: Mutex<TokenState>,
}

impl ConnectionToken {
    pub fn new(
        read: Arc<IoHandle>,
        write: Arc<IoHandle>,
        codec: Arc<dyn ProtocolCodec>,
        send_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            read,
            write,
            codec,
            send_timeout,
            state: Mutex::new(TokenState::default()),
        })
    }

    /// Bind a socket, moving the token from pooled to active.
    pub fn bind(self: &Arc<Self>, socket: TcpStream) -> ConnectionId {
        let conn_id = ConnectionId::new();
        let mut state = self.lock();
        debug_assert!(state.conn_id.is_none(), "binding an active token");

        state.conn_id = Some(conn_id);
        state.socket = Some(Arc::new(socket));
        self.read.attach(Arc::downgrade(self), conn_id);
        self.write.attach(Arc::downgrade(self), conn_id);
        conn_id
    }

    /// Move the token back to pooled, aborting in-flight operations.
    ///
    /// Returns the socket that was bound, if any, for the caller to close.
    pub fn unbind(&self) -> Option<Arc<TcpStream>> {
        let socket = self.lock().clear();
        self.read.detach();
        self.write.detach();
        socket
    }

    pub fn conn_id(&self) -> Option<ConnectionId> {
        self.lock().conn_id
    }

    pub fn is_active(&self) -> bool {
        self.lock().conn_id.is_some()
    }

    pub fn is_bound_to(&self, conn_id: ConnectionId) -> bool {
        self.lock().conn_id == Some(conn_id)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.lock().socket.as_ref().and_then(|s| s.peer_addr().ok())
    }

    pub fn read_handle(&self) -> &Arc<IoHandle> {
        &self.read
    }

    pub fn write_handle(&self) -> &Arc<IoHandle> {
        &self.write
    }

    /// Bytes waiting for the rest of their frame.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Encoded bytes not yet handed to a write.
    pub fn outbound_len(&self) -> usize {
        self.lock().outbound.len()
    }

    /// Arm a receive into the read handle.
    pub fn arm_read(self: &Arc<Self>, conn_id: ConnectionId) -> Armed {
        let mut state = self.lock();
        let Some(socket) = state.socket_for(conn_id) else {
            return Armed::Inactive;
        };

        let attempt = {
            let mut buf = self.read.buffer();
            socket.try_read(&mut buf[..])
        };
        match attempt {
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            result => {
                return Armed::Completed(Completion::new(
                    Arc::clone(self),
                    conn_id,
                    OpKind::Read,
                    result,
                ))
            }
        }

        let handle = Arc::clone(&self.read);
        let task = tokio::spawn(async move {
            let result = read_op(&socket, &handle, conn_id).await;
            handle.complete(conn_id, OpKind::Read, result);
        });
        state.read_op = Some(task.abort_handle());
        Armed::Pending
    }

    /// Arm the first write, which only waits for the socket to accept data.
    pub fn arm_write_ready(self: &Arc<Self>, conn_id: ConnectionId) -> Armed {
        self.arm_write_inner(conn_id, true)
    }

    /// Arm a write of the next outbound chunk, unless one is in flight.
    pub fn arm_write(self: &Arc<Self>, conn_id: ConnectionId) -> Armed {
        self.arm_write_inner(conn_id, false)
    }

    fn arm_write_inner(self: &Arc<Self>, conn_id: ConnectionId, ready_only: bool) -> Armed {
        let mut state = self.lock();
        let Some(socket) = state.socket_for(conn_id) else {
            return Armed::Inactive;
        };
        if state.writing {
            return Armed::Pending;
        }
        if state.outbound.is_empty() && !ready_only {
            return Armed::Idle;
        }

        let len = state.outbound.len().min(self.write.capacity());
        let attempt = {
            let mut buf = self.write.buffer();
            buf[..len].copy_from_slice(&state.outbound[..len]);
            socket.try_write(&buf[..len])
        };
        state.outbound.advance(len);
        state.writing = true;

        let written = match attempt {
            Ok(n) if n == len => {
                return Armed::Completed(Completion::new(
                    Arc::clone(self),
                    conn_id,
                    OpKind::Write,
                    Ok(n),
                ))
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => {
                return Armed::Completed(Completion::new(
                    Arc::clone(self),
                    conn_id,
                    OpKind::Write,
                    Err(e),
                ))
            }
        };

        let handle = Arc::clone(&self.write);
        let send_timeout = self.send_timeout;
        let task = tokio::spawn(async move {
            let op = write_op(&socket, &handle, conn_id, written, len);
            let result = match tokio::time::timeout(send_timeout, op).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "send timed out")),
            };
            handle.complete(conn_id, OpKind::Write, result);
        });
        state.write_op = Some(task.abort_handle());
        Armed::Pending
    }

    /// Move `bytes` just read into the partial-frame buffer and decode every
    /// complete frame now available.
    ///
    /// Returns `Ok(None)` if the token no longer serves `conn_id`.
    pub fn absorb(
        &self,
        conn_id: ConnectionId,
        bytes: usize,
    ) -> Result<Option<Vec<Frame>>, CodecError> {
        let mut state = self.lock();
        if state.conn_id != Some(conn_id) {
            return Ok(None);
        }

        state.pending.extend_from_slice(&self.read.buffer()[..bytes]);
        let mut frames = Vec::new();
        while let Some(frame) = self.codec.decode(&mut state.pending)? {
            frames.push(frame);
        }
        Ok(Some(frames))
    }

    /// Encode frames onto the outbound queue.
    ///
    /// Returns `Ok(false)` if the token no longer serves `conn_id`.
    pub fn queue_output(
        &self,
        conn_id: ConnectionId,
        frames: Vec<Frame>,
        close_after_flush: bool,
    ) -> Result<bool, CodecError> {
        let mut state = self.lock();
        if state.conn_id != Some(conn_id) {
            return Ok(false);
        }

        for frame in frames {
            self.codec
                .encode(&frame.payload, &frame.header, &mut state.outbound)?;
        }
        state.close_after_flush |= close_after_flush;
        Ok(true)
    }

    /// Pause reading if more than `limit` encoded bytes wait to be written.
    ///
    /// Returns `true` if reads are now paused.
    pub fn pause_read_if_backlogged(&self, conn_id: ConnectionId, limit: usize) -> bool {
        let mut state = self.lock();
        if state.conn_id != Some(conn_id) || state.outbound.len() <= limit {
            return false;
        }
        state.read_paused = true;
        true
    }

    /// Lift a read pause once the outbound queue is back under `limit`.
    ///
    /// Returns `true` if the caller must re-arm the read.
    pub fn resume_read_if_drained(&self, conn_id: ConnectionId, limit: usize) -> bool {
        let mut state = self.lock();
        if state.conn_id != Some(conn_id)
            || !state.read_paused
            || state.close_after_flush
            || state.outbound.len() > limit
        {
            return false;
        }
        state.read_paused = false;
        true
    }

    pub fn is_read_paused(&self) -> bool {
        self.lock().read_paused
    }

    /// Whether a close was requested and nothing is left to write.
    pub fn ready_to_close(&self, conn_id: ConnectionId) -> bool {
        let state = self.lock();
        state.conn_id == Some(conn_id)
            && state.close_after_flush
            && !state.writing
            && state.outbound.is_empty()
    }

    /// Record that the in-flight write finished.
    ///
    /// Returns `None` if the token no longer serves `conn_id`.
    pub fn write_completed(&self, conn_id: ConnectionId) -> Option<WriteState> {
        let mut state = self.lock();
        if state.conn_id != Some(conn_id) {
            return None;
        }

        state.writing = false;
        state.write_op = None;
        Some(if !state.outbound.is_empty() {
            WriteState::More
        } else if state.close_after_flush {
            WriteState::Close
        } else {
            WriteState::Idle
        })
    }

    fn lock(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ConnectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionToken")
            .field("conn_id", &self.conn_id())
            .field("read", &self.read.index())
            .field("write", &self.write.index())
            .field("codec", &self.codec.name())
            .finish()
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "operation outlived its connection")
}

async fn read_op(socket: &TcpStream, handle: &IoHandle, conn_id: ConnectionId) -> io::Result<usize> {
    loop {
        socket.readable().await?;
        let attempt = {
            let mut buf = handle.buffer();
            if !handle.serves(conn_id) {
                return Err(aborted());
            }
            socket.try_read(&mut buf[..])
        };
        match attempt {
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            result => return result,
        }
    }
}

async fn write_op(
    socket: &TcpStream,
    handle: &IoHandle,
    conn_id: ConnectionId,
    mut written: usize,
    len: usize,
) -> io::Result<usize> {
    loop {
        socket.writable().await?;
        let attempt = {
            let buf = handle.buffer();
            if !handle.serves(conn_id) {
                return Err(aborted());
            }
            socket.try_write(&buf[written..len])
        };
        match attempt {
            Ok(0) if len > 0 => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                written += n;
                if written >= len {
                    return Ok(written);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocols::LineCodec;
    use crate::runtime::buffer::{discard_sink, HandlePool};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// A connected (server side, client side) loopback pair.
    pub(crate) async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (accepted.unwrap().0, client.unwrap())
    }

    fn token(pool: &HandlePool) -> Arc<ConnectionToken> {
        ConnectionToken::new(
            pool.pop(),
            pool.pop(),
            Arc::new(LineCodec::default()),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), a.as_uuid().to_string());
    }

    #[tokio::test]
    async fn test_bind_and_unbind_transitions() {
        let pool = HandlePool::new(2, 64, discard_sink());
        let token = token(&pool);
        assert!(!token.is_active());

        let (server, _client) = socket_pair().await;
        let conn_id = token.bind(server);
        assert!(token.is_active());
        assert!(token.is_bound_to(conn_id));
        assert!(token.read_handle().serves(conn_id));
        assert!(token.peer_addr().is_some());

        let socket = token.unbind();
        assert!(socket.is_some());
        assert!(!token.is_active());
        assert!(!token.read_handle().serves(conn_id));
        assert!(token.unbind().is_none());

        // A stale id can no longer arm anything
        assert!(matches!(token.arm_read(conn_id), Armed::Inactive));
    }

    #[tokio::test]
    async fn test_sync_read_completes_inline() {
        let pool = HandlePool::new(2, 64, discard_sink());
        let token = token(&pool);
        let (server, mut client) = socket_pair().await;
        let conn_id = token.bind(server);

        client.write_all(b"5\r\nhello3\r\nab").await.unwrap();
        // Let the reactor observe readiness so the first attempt succeeds
        tokio::time::sleep(Duration::from_millis(50)).await;

        let completion = match token.arm_read(conn_id) {
            Armed::Completed(c) => c,
            other => panic!("expected inline completion, got {other:?}"),
        };
        assert_eq!(completion.kind, OpKind::Read);
        assert_eq!(completion.bytes, 13);

        let frames = token.absorb(conn_id, completion.bytes).unwrap().unwrap();
        assert_eq!(frames, vec![Frame::data(&b"hello"[..])]);
        // "3\r\nab" waits for its last byte
        assert_eq!(token.pending_len(), 5);
    }

    #[tokio::test]
    async fn test_queue_output_and_write() {
        let pool = HandlePool::new(2, 64, discard_sink());
        let token = token(&pool);
        let (server, mut client) = socket_pair().await;
        let conn_id = token.bind(server);

        assert!(matches!(token.arm_write(conn_id), Armed::Idle));
        assert!(token
            .queue_output(conn_id, vec![Frame::data(&b"hi"[..])], false)
            .unwrap());
        assert_eq!(token.outbound_len(), 5);

        match token.arm_write(conn_id) {
            Armed::Completed(c) => {
                assert_eq!(c.bytes, 5);
                assert_eq!(token.write_completed(conn_id), Some(WriteState::Idle));
            }
            Armed::Pending => {}
            other => panic!("unexpected {other:?}"),
        }

        let mut received = [0u8; 5];
        client.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"2\r\nhi");
    }

    #[tokio::test]
    async fn test_read_pause_follows_outbound_queue() {
        let pool = HandlePool::new(2, 4, discard_sink());
        let token = token(&pool);
        let (server, _client) = socket_pair().await;
        let conn_id = token.bind(server);
        // Let the reactor observe write readiness so writes complete inline
        tokio::time::sleep(Duration::from_millis(50)).await;

        token
            .queue_output(conn_id, vec![Frame::data(&b"0123456789"[..])], false)
            .unwrap();
        assert_eq!(token.outbound_len(), 14);

        assert!(!token.pause_read_if_backlogged(conn_id, 14));
        assert!(!token.resume_read_if_drained(conn_id, 64));
        assert!(token.pause_read_if_backlogged(conn_id, 8));
        assert!(token.is_read_paused());
        assert!(!token.pause_read_if_backlogged(ConnectionId::new(), 8));

        // Still above the mark
        assert!(!token.resume_read_if_drained(conn_id, 8));
        // Each write hands over at most one buffer (4 bytes)
        while token.outbound_len() > 8 {
            match token.arm_write(conn_id) {
                Armed::Completed(_) => {
                    token.write_completed(conn_id);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(token.resume_read_if_drained(conn_id, 8));
        assert!(!token.is_read_paused());
        assert!(!token.resume_read_if_drained(conn_id, 8));

        token.pause_read_if_backlogged(conn_id, 0);
        token.unbind();
        assert!(!token.is_read_paused());
    }

    #[tokio::test]
    async fn test_close_after_flush() {
        let pool = HandlePool::new(2, 64, discard_sink());
        let token = token(&pool);
        let (server, _client) = socket_pair().await;
        let conn_id = token.bind(server);

        token.queue_output(conn_id, Vec::new(), true).unwrap();
        assert!(token.ready_to_close(conn_id));
        assert!(!token.ready_to_close(ConnectionId::new()));
    }
}
