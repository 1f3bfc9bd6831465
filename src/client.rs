//! Outbound connections served by the same lifecycle engine.

use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::runtime::{net, ConnectionHandler, ConnectionId, ConnectionManager, ProtocolCodec, Role};
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::debug;

/// Client-role connection manager.
///
/// Connected sockets go through the same admission, pooling and completion
/// handling as accepted ones. A failed connect is reported once and never
/// retried.
pub struct Client {
    manager: Arc<ConnectionManager>,
}

impl Client {
    /// Must run inside a tokio runtime.
    pub fn new(
        config: ManagerConfig,
        codec: Arc<dyn ProtocolCodec>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Self> {
        Ok(Self {
            manager: ConnectionManager::new(Role::Client, config, codec, handler)?,
        })
    }

    /// Connect to `host:port` and start serving the connection.
    ///
    /// The send timeout bounds the connect attempt.
    pub async fn connect(&self, host: &str, port: u16, prefer_ipv4: bool) -> Result<ConnectionId> {
        let addr = net::resolve_endpoint(host, port, prefer_ipv4).await?;
        let timeout = self.manager.config().send_timeout();

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(result) => result.map_err(Error::Socket)?,
            Err(_) => {
                return Err(Error::Socket(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {addr} timed out"),
                )))
            }
        };
        debug!(%addr, "connected");

        self.manager.admit(stream).await.ok_or(Error::NotAdmitted)
    }

    pub fn send(&self, conn_id: ConnectionId, payload: impl Into<Bytes>) -> Result<()> {
        self.manager.send(conn_id, payload)
    }

    pub fn disconnect(&self, conn_id: ConnectionId) -> Result<()> {
        self.manager.disconnect(conn_id)
    }

    pub fn close_all(&self) -> usize {
        self.manager.close_all()
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }
}
