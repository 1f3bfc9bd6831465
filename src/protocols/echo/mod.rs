//! Echo protocol implementation.
//!
//! A simple echo service for throughput and I/O testing:
//! - Client sends: `<length>\r\n<data>`
//! - Server echoes: `<length>\r\n<data>`
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  <length>\r\n<data of exactly length bytes>
//! Response: <length>\r\n<data of exactly length bytes>
//!
//! Example:
//! Request:  5\r\nhello
//! Response: 5\r\nhello
//! ```
//!
//! Special commands (line-based):
//! - `QUIT\r\n` - answered with `2\r\nOK`, then the connection closes
//!
//! The framing lives in [`LineCodec`] and can be paired with any handler.

pub mod handler;
pub mod parser;

pub use handler::EchoHandler;
pub use parser::{LineCodec, MAX_FRAME_SIZE};
