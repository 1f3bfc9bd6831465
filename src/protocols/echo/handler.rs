//! Echo processing hooks.

use crate::error::HandlerError;
use crate::runtime::{ConnectionHandler, ConnectionId, Frame, FrameKind, Outbox};
use tracing::trace;

/// Replies with every data frame it receives.
///
/// A close frame is answered with `OK` and ends the session once the reply
/// has been written.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl ConnectionHandler for EchoHandler {
    fn on_frame(
        &self,
        conn_id: ConnectionId,
        frame: Frame,
        out: &mut Outbox,
    ) -> Result<(), HandlerError> {
        match frame.header.kind {
            FrameKind::Data => {
                trace!(%conn_id, len = frame.payload.len(), "echo");
                out.send(frame.payload);
            }
            FrameKind::Close => {
                out.send(&b"OK"[..]);
                out.close();
            }
        }
        Ok(())
    }
}
