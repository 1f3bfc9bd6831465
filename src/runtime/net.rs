//! Socket setup and teardown helpers.

use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace};

/// Resolve `host` to one socket address.
///
/// Literal addresses are used as-is and an empty host means the unspecified
/// address of the preferred family. Names go through system resolution.
pub async fn resolve_endpoint(host: &str, port: u16, prefer_ipv4: bool) -> Result<SocketAddr> {
    let host = host.trim();
    if host.is_empty() {
        let ip = if prefer_ipv4 {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        };
        return Ok(SocketAddr::new(ip, port));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let resolved: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| {
            debug!(host, error = %e, "name resolution failed");
            Error::Unresolvable(host.to_string())
        })?
        .collect();

    pick_address(&resolved, prefer_ipv4).ok_or_else(|| Error::Unresolvable(host.to_string()))
}

/// First address of the preferred family, else the first address at all.
pub fn pick_address(addrs: &[SocketAddr], prefer_ipv4: bool) -> Option<SocketAddr> {
    addrs
        .iter()
        .find(|addr| addr.is_ipv4() == prefer_ipv4)
        .or_else(|| addrs.first())
        .copied()
}

/// Create a listening socket with the given backlog.
///
/// Must be called from within a tokio runtime.
pub fn bind_listener(addr: SocketAddr, backlog: u32, config: &ManagerConfig) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    // Accepted sockets inherit these
    socket.set_recv_buffer_size(config.buffer_size)?;
    socket.set_send_buffer_size(config.buffer_size)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;

    TcpListener::from_std(socket.into())
}

/// Apply per-connection socket options.
pub fn configure_stream(stream: &TcpStream, config: &ManagerConfig) -> io::Result<()> {
    let socket = SockRef::from(stream);
    socket.set_nodelay(true)?;
    if config.send_timeout_ms > 0 {
        socket.set_write_timeout(Some(config.send_timeout()))?;
    }
    if config.receive_timeout_ms > 0 {
        socket.set_read_timeout(Some(config.receive_timeout()))?;
    }
    Ok(())
}

/// Shut down both directions. Failures are expected for sockets the peer
/// already reset and are ignored; the descriptor closes on drop.
pub fn close_socket(stream: &TcpStream) {
    if let Err(e) = SockRef::from(stream).shutdown(Shutdown::Both) {
        trace!(error = %e, "socket shutdown failed");
    }
}
