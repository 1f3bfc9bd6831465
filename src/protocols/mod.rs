//! Protocol implementations.
//!
//! Each protocol provides a codec the runtime frames connections with.
//!
//! - `echo`: length-line framing plus an echo handler
//! - `length`: binary length-prefixed framing

pub mod echo;
pub mod length;

pub use echo::{EchoHandler, LineCodec};
pub use length::LengthPrefixedCodec;
