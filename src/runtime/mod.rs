//! Connection lifecycle engine.
//!
//! Completion-based I/O on top of tokio:
//! - `AdmissionController`: bounds concurrently active connections
//! - `HandlePool`: reusable I/O handles carved from one buffer arena
//! - `ConnectionPool`: reusable connection tokens, each owning two handles
//! - `ConnectionRegistry`: id to token map of live connections
//! - `CompletionDispatcher`: routes finished operations to processing or release
//! - `ConnectionManager`: admit, serve and release
//! - `AcceptLoop`: feeds accepted sockets to admission

mod accept;
mod admission;
mod buffer;
mod completion;
mod connection;
mod lifecycle;
pub mod net;
mod notify;
mod pool;
pub mod protocol;
mod token;

pub use accept::AcceptLoop;
pub use admission::AdmissionController;
pub use buffer::{HandlePool, IoHandle};
pub use completion::{
    Completion, CompletionDispatcher, CompletionHooks, CompletionSink, OpKind, Route, Status,
};
pub use connection::ConnectionRegistry;
pub use lifecycle::{ConnectionManager, Role};
pub use notify::{ErrorSource, Event, Notification, Notifier, SubscriptionId};
pub use pool::ConnectionPool;
pub use protocol::{
    CodecError, ConnectionHandler, Frame, FrameHeader, FrameKind, Outbox, ProtocolCodec,
};
pub use token::{Armed, ConnectionId, ConnectionToken, WriteState};
