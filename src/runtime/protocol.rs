//! Pluggable framing and processing contracts.
//!
//! The engine never interprets bytes itself. A [`ProtocolCodec`] turns the
//! raw byte stream of a connection into frames and back, and a
//! [`ConnectionHandler`] decides what to do with each decoded frame.

use crate::error::HandlerError;
use crate::runtime::ConnectionId;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// What a frame means to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameKind {
    /// Application payload.
    #[default]
    Data,
    /// The peer asked to end the session.
    Close,
}

/// Per-frame metadata produced by `decode` and consumed by `encode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    pub kind: FrameKind,
    /// Payload length in bytes.
    pub len: usize,
}

impl FrameHeader {
    pub fn data(len: usize) -> Self {
        Self {
            kind: FrameKind::Data,
            len,
        }
    }

    pub fn close() -> Self {
        Self {
            kind: FrameKind::Close,
            len: 0,
        }
    }
}

/// One complete application-level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn data(payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            header: FrameHeader::data(payload.len()),
            payload,
        }
    }

    pub fn close() -> Self {
        Self {
            header: FrameHeader::close(),
            payload: Bytes::new(),
        }
    }

    pub fn is_close(&self) -> bool {
        self.header.kind == FrameKind::Close
    }
}

/// Framing errors. Any of these terminates the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("invalid frame header: {0}")]
    InvalidHeader(String),
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("frame kind {0:?} cannot be encoded by this codec")]
    UnsupportedKind(FrameKind),
}

/// Frame encoder/decoder shared by every connection of a manager.
///
/// Implementations hold no per-connection state: partial input lives in the
/// connection token and is handed to `decode` on every call.
pub trait ProtocolCodec: Send + Sync + 'static {
    /// Append the framed form of `payload` to `dst`.
    fn encode(
        &self,
        payload: &[u8],
        header: &FrameHeader,
        dst: &mut BytesMut,
    ) -> Result<(), CodecError>;

    /// Extract exactly one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched when it does not yet hold
    /// a complete frame. On success the frame's bytes are split off `src`,
    /// which then holds only the unconsumed remainder.
    fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Output produced while handling a frame.
#[derive(Debug, Default)]
pub struct Outbox {
    frames: Vec<Frame>,
    close: bool,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a data frame for the peer.
    pub fn send(&mut self, payload: impl Into<Bytes>) {
        self.frames.push(Frame::data(payload));
    }

    /// Queue a frame with an explicit header.
    pub fn send_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Close the connection once all queued output has been written.
    pub fn close(&mut self) {
        self.close = true;
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && !self.close
    }

    pub fn close_requested(&self) -> bool {
        self.close
    }

    pub(crate) fn take_frames(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.frames)
    }
}

/// Application processing hooks.
///
/// Called on the worker thread that delivered the completion. A connection's
/// frames arrive in order, but frames of different connections interleave
/// freely. Returning an error terminates the connection.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn on_frame(
        &self,
        conn_id: ConnectionId,
        frame: Frame,
        out: &mut Outbox,
    ) -> Result<(), HandlerError>;

    fn on_connected(&self, _conn_id: ConnectionId) {}

    fn on_disconnected(&self, _conn_id: ConnectionId) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbox_collects_frames() {
        let mut out = Outbox::new();
        assert!(out.is_empty());

        out.send(&b"hello"[..]);
        out.send_frame(Frame::close());
        assert!(!out.is_empty());
        assert!(!out.close_requested());

        let frames = out.take_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].header, FrameHeader::data(5));
        assert!(frames[1].is_close());
        assert!(out.is_empty());

        out.close();
        assert!(out.close_requested());
        assert!(!out.is_empty());
    }
}
