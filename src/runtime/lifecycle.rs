//! Connection lifecycle: admit, serve and release.
//!
//! [`ConnectionManager`] owns every shared resource of one server or client
//! context: the admission gate, both pools, the registry and the notifier.
//! It is also the processing side of the completion dispatcher, deciding when
//! to re-arm reads and when to issue writes.

use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::runtime::admission::AdmissionController;
use crate::runtime::buffer::HandlePool;
use crate::runtime::completion::{Completion, CompletionDispatcher, CompletionHooks, CompletionSink};
use crate::runtime::connection::ConnectionRegistry;
use crate::runtime::net;
use crate::runtime::notify::{ErrorSource, Event, Notifier};
use crate::runtime::pool::ConnectionPool;
use crate::runtime::protocol::{ConnectionHandler, Frame, Outbox, ProtocolCodec};
use crate::runtime::token::{Armed, WriteState};
use crate::runtime::{ConnectionId, ConnectionToken};
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

/// Which side of a connection the manager serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sockets come from an accept loop.
    Server,
    /// Sockets come from outbound connects.
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => f.write_str("server"),
            Role::Client => f.write_str("client"),
        }
    }
}

pub struct ConnectionManager {
    role: Role,
    config: ManagerConfig,
    admission: AdmissionController,
    handles: Arc<HandlePool>,
    pool: ConnectionPool,
    registry: ConnectionRegistry,
    handler: Arc<dyn ConnectionHandler>,
    notifier: Notifier,
    runtime: Handle,
}

impl ConnectionManager {
    /// Build a manager and warm its pools.
    ///
    /// Must be called from within a tokio runtime; spawned I/O and the
    /// notification task run on it.
    pub fn new(
        role: Role,
        config: ManagerConfig,
        codec: Arc<dyn ProtocolCodec>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;

        info!(
            %role,
            max_connections = config.max_connections,
            initial_resources = config.initial_resources,
            buffer_size = config.buffer_size,
            codec = codec.name(),
            "building connection manager"
        );

        Ok(Arc::new_cyclic(|weak: &Weak<Self>| {
            let sink: CompletionSink = {
                let weak = weak.clone();
                Arc::new(move |completion: Completion| {
                    if let Some(manager) = weak.upgrade() {
                        CompletionDispatcher::new(&*manager).dispatch(completion);
                    }
                })
            };
            let handles = Arc::new(HandlePool::new(
                2 * config.initial_resources,
                config.buffer_size,
                sink,
            ));
            let pool = ConnectionPool::new(
                config.initial_resources,
                Arc::clone(&handles),
                codec,
                config.send_timeout(),
            );

            Self {
                role,
                admission: AdmissionController::new(config.max_connections),
                handles,
                pool,
                registry: ConnectionRegistry::with_capacity(config.max_connections),
                handler,
                notifier: Notifier::new(&runtime),
                runtime,
                config,
            }
        }))
    }

    /// Admit a freshly connected socket.
    ///
    /// Waits up to the admission timeout for a free slot. On timeout the
    /// socket is closed and nothing else is touched. Returns the id of the new
    /// connection; it may already have been released again if the peer went
    /// away during the initial reads.
    pub async fn admit(self: &Arc<Self>, socket: TcpStream) -> Option<ConnectionId> {
        let timeout = self.config.admission_timeout();
        if !self.admission.acquire(timeout).await {
            net::close_socket(&socket);
            if self.admission.is_closed() {
                debug!(role = %self.role, "manager shut down, refusing connection");
            } else {
                warn!(role = %self.role, ?timeout, "no connection slot free, refusing connection");
                self.notifier
                    .error(ErrorSource::Admission, Error::AdmissionTimeout(timeout));
            }
            return None;
        }
        self.activate(socket)
    }

    /// Bind an admitted socket to a token and start serving it.
    fn activate(self: &Arc<Self>, socket: TcpStream) -> Option<ConnectionId> {
        if let Err(e) = net::configure_stream(&socket, &self.config) {
            net::close_socket(&socket);
            self.admission.release();
            self.notifier.error(ErrorSource::Admission, Error::Socket(e));
            return None;
        }
        let peer = socket.peer_addr().ok();

        let token = self.pool.pop();
        let conn_id = token.bind(socket);

        if !self.registry.insert(conn_id, Arc::clone(&token)) {
            // The existing entry belongs to someone else; only undo our own work
            if let Some(socket) = token.unbind() {
                net::close_socket(&socket);
            }
            self.pool.push(token);
            self.admission.release();
            self.notifier.error(
                ErrorSource::Connection(conn_id),
                Error::DuplicateConnection(conn_id),
            );
            return None;
        }

        debug!(role = %self.role, %conn_id, ?peer, "connection admitted");
        self.notifier.connection_status(conn_id, true, None);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| {
            self.handler.on_connected(conn_id)
        })) {
            self.release(conn_id, Some(Error::from_panic(payload)));
            return None;
        }

        let mut follow_ups = VecDeque::new();
        queue_inline(token.arm_read(conn_id), &mut follow_ups);
        queue_inline(token.arm_write_ready(conn_id), &mut follow_ups);
        CompletionDispatcher::new(&**self).drain(follow_ups);

        Some(conn_id)
    }

    /// Tear down a connection. Returns `false` if it was already released.
    pub fn release(&self, conn_id: ConnectionId, reason: Option<Error>) -> bool {
        let Some(token) = self.registry.remove(conn_id) else {
            trace!(%conn_id, "connection already released");
            return false;
        };

        if let Some(socket) = token.unbind() {
            net::close_socket(&socket);
        }
        self.pool.push(token);
        self.admission.release();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| {
            self.handler.on_disconnected(conn_id)
        })) {
            warn!(%conn_id, error = %Error::from_panic(payload), "disconnect hook failed");
        }

        match reason {
            Some(error) if !error.is_peer_closed() => {
                warn!(%conn_id, %error, "connection terminated");
                let error = Arc::new(error);
                self.notifier.emit(Event::Error {
                    source: ErrorSource::Connection(conn_id),
                    error: Arc::clone(&error),
                });
                self.notifier.emit(Event::ConnectionStatus {
                    conn_id,
                    connected: false,
                    error: Some(error),
                });
            }
            _ => {
                debug!(%conn_id, "connection closed");
                self.notifier.connection_status(conn_id, false, None);
            }
        }
        true
    }

    /// Release every registered connection. Returns how many were released.
    pub fn close_all(&self) -> usize {
        let released = self
            .registry
            .ids()
            .into_iter()
            .filter(|&conn_id| self.release(conn_id, None))
            .count();
        if released > 0 {
            info!(role = %self.role, released, "closed all connections");
        }
        released
    }

    /// Close every connection and fail all pending and future admits.
    pub fn shutdown(&self) -> usize {
        self.admission.close();
        self.close_all()
    }

    /// Queue `payload` as one data frame for the peer.
    pub fn send(&self, conn_id: ConnectionId, payload: impl Into<Bytes>) -> Result<()> {
        let token = self
            .registry
            .get(conn_id)
            .ok_or(Error::UnknownConnection(conn_id))?;
        if token.outbound_len() > self.config.max_outbound_bytes {
            return Err(Error::OutboundFull(conn_id));
        }
        if !token.queue_output(conn_id, vec![Frame::data(payload)], false)? {
            return Err(Error::UnknownConnection(conn_id));
        }

        // Writes may be armed from outside the runtime
        let _guard = self.runtime.enter();
        if let Armed::Completed(completion) = token.arm_write(conn_id) {
            CompletionDispatcher::new(self).dispatch(completion);
        }
        Ok(())
    }

    /// Close a connection on the application's request.
    pub fn disconnect(&self, conn_id: ConnectionId) -> Result<()> {
        if self.release(conn_id, None) {
            Ok(())
        } else {
            Err(Error::UnknownConnection(conn_id))
        }
    }

    pub fn is_connected(&self, conn_id: ConnectionId) -> bool {
        self.registry.contains(conn_id)
    }

    /// Number of active connections.
    pub fn total_connected_count(&self) -> usize {
        self.registry.len()
    }

    /// Maximum number of concurrently active connections.
    pub fn total_count(&self) -> usize {
        self.config.max_connections
    }

    pub fn available_slots(&self) -> usize {
        self.admission.available()
    }

    pub fn pooled_tokens(&self) -> usize {
        self.pool.len()
    }

    pub fn allocated_handles(&self) -> usize {
        self.handles.allocated()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }
}

impl CompletionHooks for ConnectionManager {
    fn process_read(
        &self,
        token: &Arc<ConnectionToken>,
        conn_id: ConnectionId,
        bytes: usize,
        follow_ups: &mut VecDeque<Completion>,
    ) -> Result<()> {
        trace!(%conn_id, bytes, "read completed");
        let Some(frames) = token.absorb(conn_id, bytes)? else {
            return Ok(());
        };

        let mut out = Outbox::new();
        for frame in frames {
            self.handler
                .on_frame(conn_id, frame, &mut out)
                .map_err(Error::Handler)?;
            if out.close_requested() {
                break;
            }
        }

        let close = out.close_requested();
        let replies = out.take_frames();
        if (!replies.is_empty() || close) && !token.queue_output(conn_id, replies, close)? {
            return Ok(());
        }

        if close {
            if token.ready_to_close(conn_id) {
                self.release(conn_id, None);
                return Ok(());
            }
        } else if token.pause_read_if_backlogged(conn_id, self.config.max_outbound_bytes) {
            debug!(%conn_id, queued = token.outbound_len(), "output backlog, pausing reads");
        } else {
            queue_inline(token.arm_read(conn_id), follow_ups);
        }
        queue_inline(token.arm_write(conn_id), follow_ups);
        Ok(())
    }

    fn process_write(
        &self,
        token: &Arc<ConnectionToken>,
        conn_id: ConnectionId,
        bytes: usize,
        follow_ups: &mut VecDeque<Completion>,
    ) -> Result<()> {
        trace!(%conn_id, bytes, "write completed");
        match token.write_completed(conn_id) {
            Some(WriteState::More) => queue_inline(token.arm_write(conn_id), follow_ups),
            Some(WriteState::Close) => {
                self.release(conn_id, None);
                return Ok(());
            }
            Some(WriteState::Idle) => {}
            None => return Ok(()),
        }
        if token.resume_read_if_drained(conn_id, self.config.max_outbound_bytes) {
            trace!(%conn_id, "output backlog drained, resuming reads");
            queue_inline(token.arm_read(conn_id), follow_ups);
        }
        Ok(())
    }

    fn release(&self, conn_id: ConnectionId, reason: Option<Error>) -> bool {
        ConnectionManager::release(self, conn_id, reason)
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("role", &self.role)
            .field("connected", &self.registry.len())
            .field("max_connections", &self.config.max_connections)
            .finish()
    }
}

fn queue_inline(armed: Armed, follow_ups: &mut VecDeque<Completion>) {
    if let Armed::Completed(completion) = armed {
        follow_ups.push_back(completion);
    }
}
