use crate::protocols::echo::MAX_FRAME_SIZE;
use crate::runtime::{CodecError, Frame, FrameHeader, FrameKind, ProtocolCodec};
use bytes::{Buf, BufMut, BytesMut};

const PREFIX_LEN: usize = 4;

/// 4-byte big-endian length followed by the payload.
#[derive(Debug, Clone, Copy)]
pub struct LengthPrefixedCodec {
    max_frame: usize,
}

impl LengthPrefixedCodec {
    pub fn new(max_frame: usize) -> Self {
        Self {
            max_frame: max_frame.min(u32::MAX as usize),
        }
    }
}

impl Default for LengthPrefixedCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl ProtocolCodec for LengthPrefixedCodec {
    fn encode(
        &self,
        payload: &[u8],
        header: &FrameHeader,
        dst: &mut BytesMut,
    ) -> Result<(), CodecError> {
        if header.kind != FrameKind::Data {
            return Err(CodecError::UnsupportedKind(header.kind));
        }
        if payload.len() > self.max_frame {
            return Err(CodecError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame,
            });
        }
        dst.reserve(PREFIX_LEN + payload.len());
        // max_frame is capped at u32::MAX
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(payload);
        Ok(())
    }

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        let Some(prefix) = src.get(..PREFIX_LEN) else {
            return Ok(None);
        };
        let length = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if length > self.max_frame {
            return Err(CodecError::FrameTooLarge {
                len: length,
                max: self.max_frame,
            });
        }
        if src.len() < PREFIX_LEN + length {
            src.reserve(PREFIX_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(PREFIX_LEN);
        let payload = src.split_to(length).freeze();
        Ok(Some(Frame {
            header: FrameHeader::data(length),
            payload,
        }))
    }

    fn name(&self) -> &'static str {
        "length-prefixed"
    }
}
