//! pooled-tcp: an asynchronous TCP connection server with pooled resources.
//!
//! Connections are served without a task per connection:
//! - Bounded admission of concurrent connections
//! - Connection tokens and I/O buffers pooled and reused across connections
//! - Completion-driven reads and writes with pluggable framing
//! - Server and client roles sharing one lifecycle engine
//! - Configuration via CLI arguments or TOML file

pub mod client;
pub mod config;
pub mod error;
pub mod protocols;
pub mod runtime;
pub mod server;

pub use client::Client;
pub use config::{Config, ListenerConfig, ManagerConfig};
pub use error::{Error, Result};
pub use runtime::{ConnectionHandler, ConnectionId, Frame, Outbox, ProtocolCodec};
pub use server::Server;
