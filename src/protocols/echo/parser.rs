//! Length-line framing.

use crate::runtime::{CodecError, Frame, FrameHeader, FrameKind, ProtocolCodec};
use bytes::{Buf, BytesMut};

/// Largest payload accepted or produced by default.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Longest length line before the CRLF. Enough for any `usize`.
const MAX_HEADER_LEN: usize = 20;

const QUIT: &[u8] = b"QUIT";

/// Text framing: `<length>\r\n<data of exactly length bytes>`.
///
/// A `QUIT\r\n` line (any case) decodes to a close frame.
#[derive(Debug, Clone, Copy)]
pub struct LineCodec {
    max_frame: usize,
}

impl LineCodec {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl ProtocolCodec for LineCodec {
    fn encode(
        &self,
        payload: &[u8],
        header: &FrameHeader,
        dst: &mut BytesMut,
    ) -> Result<(), CodecError> {
        match header.kind {
            FrameKind::Close => {
                dst.extend_from_slice(QUIT);
                dst.extend_from_slice(b"\r\n");
            }
            FrameKind::Data => {
                if payload.len() > self.max_frame {
                    return Err(CodecError::FrameTooLarge {
                        len: payload.len(),
                        max: self.max_frame,
                    });
                }
                let header = format!("{}\r\n", payload.len());
                dst.reserve(header.len() + payload.len());
                dst.extend_from_slice(header.as_bytes());
                dst.extend_from_slice(payload);
            }
        }
        Ok(())
    }

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        let window = &src[..src.len().min(MAX_HEADER_LEN + 2)];
        let Some(line_end) = find_crlf(window) else {
            if src.len() > MAX_HEADER_LEN {
                return Err(CodecError::InvalidHeader("length line too long".into()));
            }
            return Ok(None);
        };
        let header_len = line_end + 2;

        let line = &src[..line_end];
        if line.eq_ignore_ascii_case(QUIT) {
            src.advance(header_len);
            return Ok(Some(Frame::close()));
        }

        let length = parse_length(line)?;
        if length > self.max_frame {
            return Err(CodecError::FrameTooLarge {
                len: length,
                max: self.max_frame,
            });
        }
        if src.len() < header_len + length {
            return Ok(None);
        }

        src.advance(header_len);
        let payload = src.split_to(length).freeze();
        Ok(Some(Frame {
            header: FrameHeader::data(length),
            payload,
        }))
    }

    fn name(&self) -> &'static str {
        "line"
    }
}

fn parse_length(line: &[u8]) -> Result<usize, CodecError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            CodecError::InvalidHeader(format!("invalid length '{}'", String::from_utf8_lossy(line)))
        })
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}
