//! TCP server built on the connection lifecycle engine.
//!
//! Owns a server-role [`ConnectionManager`] and at most one running
//! [`AcceptLoop`]. Stopping the listener leaves established connections
//! alone; `close_all` or `shutdown` ends them.

use crate::config::{ListenerConfig, ManagerConfig};
use crate::error::{Error, Result};
use crate::runtime::{
    net, AcceptLoop, ConnectionHandler, ConnectionId, ConnectionManager, ErrorSource,
    ProtocolCodec, Role,
};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info};

/// Server instance
pub struct Server {
    manager: Arc<ConnectionManager>,
    listener: Mutex<Option<AcceptLoop>>,
}

impl Server {
    /// Create a server and warm its pools. Must run inside a tokio runtime.
    pub fn new(
        config: ManagerConfig,
        codec: Arc<dyn ProtocolCodec>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Self> {
        Ok(Self {
            manager: ConnectionManager::new(Role::Server, config, codec, handler)?,
            listener: Mutex::new(None),
        })
    }

    /// Resolve, bind and start accepting. Returns the bound address.
    pub async fn start(&self, config: &ListenerConfig) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Err(Error::AlreadyRunning(addr));
        }

        let addr = net::resolve_endpoint(&config.host, config.port, config.prefer_ipv4)
            .await
            .inspect_err(|e| {
                error!(host = %config.host, error = %e, "failed to resolve listen address");
                self.manager
                    .notifier()
                    .error(ErrorSource::Listener, Error::Unresolvable(config.host.trim().to_string()));
            })?;
        let listener = net::bind_listener(addr, config.backlog, self.manager.config())
            .and_then(|listener| AcceptLoop::spawn(listener, Arc::clone(&self.manager)))
            .map_err(|e| {
                error!(%addr, error = %e, "failed to start listener");
                self.manager.notifier().error(
                    ErrorSource::Listener,
                    Error::Listener(io::Error::new(e.kind(), e.to_string())),
                );
                Error::Listener(e)
            })?;
        let local_addr = listener.local_addr();

        {
            let mut slot = self.lock();
            if let Some(running) = slot.as_ref() {
                // Lost a race with a concurrent start; ours stops on drop
                return Err(Error::AlreadyRunning(running.local_addr()));
            }
            *slot = Some(listener);
        }

        info!(addr = %local_addr, backlog = config.backlog, "server started");
        self.manager.notifier().running(true);
        Ok(local_addr)
    }

    /// Stop accepting new connections. Returns `false` if not running.
    pub fn stop(&self) -> bool {
        let Some(listener) = self.lock().take() else {
            return false;
        };
        listener.stop();
        info!(addr = %listener.local_addr(), "server stopped");
        self.manager.notifier().running(false);
        true
    }

    pub fn is_running(&self) -> bool {
        self.lock().as_ref().is_some_and(|l| !l.is_stopped())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().as_ref().map(AcceptLoop::local_addr)
    }

    /// Release every established connection. The listener keeps running.
    pub fn close_all(&self) -> usize {
        self.manager.close_all()
    }

    /// Stop the listener, close every connection and refuse further admits.
    pub fn shutdown(&self) -> usize {
        self.stop();
        self.manager.shutdown()
    }

    pub fn send(&self, conn_id: ConnectionId, payload: impl Into<Bytes>) -> Result<()> {
        self.manager.send(conn_id, payload)
    }

    pub fn disconnect(&self, conn_id: ConnectionId) -> Result<()> {
        self.manager.disconnect(conn_id)
    }

    pub fn total_connected_count(&self) -> usize {
        self.manager.total_connected_count()
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    fn lock(&self) -> MutexGuard<'_, Option<AcceptLoop>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
