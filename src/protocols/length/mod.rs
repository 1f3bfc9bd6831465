//! Binary length-prefixed framing.
//!
//! ```text
//! +----------------+---------------------+
//! | length: u32 BE | payload (length)    |
//! +----------------+---------------------+
//! ```
//!
//! There is no close frame; sessions end when either side closes the socket.

pub mod parser;

pub use parser::LengthPrefixedCodec;
