//! Error types for the connection engine.
//!
//! Connection-level failures never reach an external caller directly: they
//! are reclaimed locally and surface as notifications. Only listener setup
//! and application calls that name a connection return these synchronously.

use crate::runtime::{CodecError, ConnectionId, OpKind};
use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Boxed error returned by application processing hooks.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    /// No admission slot became free within the wait window.
    #[error("no connection slot became free within {0:?}")]
    AdmissionTimeout(Duration),

    /// A read, write or socket option call failed.
    #[error("socket fault: {0}")]
    Socket(#[source] io::Error),

    /// The peer performed an orderly close.
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("protocol processing failed: {0}")]
    Protocol(#[from] CodecError),

    #[error("connection handler failed: {0}")]
    Handler(#[source] HandlerError),

    /// Bind, listen or accept failure on the listening socket.
    #[error("listener fault: {0}")]
    Listener(#[source] io::Error),

    /// The manager refused to register a new connection.
    #[error("connection was not admitted")]
    NotAdmitted,

    #[error("could not resolve '{0}' to an address")]
    Unresolvable(String),

    #[error("listener is already running on {0}")]
    AlreadyRunning(SocketAddr),

    /// A freshly generated id was already registered.
    #[error("connection id {0} is already registered")]
    DuplicateConnection(ConnectionId),

    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),

    /// The connection's outbound queue is above its high-water mark.
    #[error("connection {0} has too much output queued")]
    OutboundFull(ConnectionId),

    /// A completion arrived for an operation the dispatcher does not route.
    #[error("unexpected completion of a {0:?} operation")]
    UnexpectedOperation(OpKind),

    #[error("a tokio runtime must be running to build a connection manager")]
    NoRuntime,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether this error means the peer went away rather than a fault.
    pub fn is_peer_closed(&self) -> bool {
        matches!(self, Error::PeerClosed)
    }

    /// Turn the payload of a caught handler panic into a handler error.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => match payload.downcast_ref::<&'static str>() {
                Some(message) => (*message).to_string(),
                None => "non-string panic payload".to_string(),
            },
        };
        Error::Handler(format!("handler panicked: {message}").into())
    }
}


pub type Result<T, E = Error> = std::result::Result<T, E>;
