//! Listening socket and the loop that feeds accepted sockets to admission.

use crate::error::Error;
use crate::runtime::lifecycle::ConnectionManager;
use crate::runtime::notify::ErrorSource;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// A running accept loop.
///
/// Each accepted socket waits for admission on its own task, so a saturated
/// admission gate never stalls further accepts. Stopping the loop also
/// refuses sockets still waiting for a slot.
pub struct AcceptLoop {
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl AcceptLoop {
    pub fn spawn(listener: TcpListener, manager: Arc<ConnectionManager>) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (stop, stopped) = watch::channel(false);
        let task = manager
            .runtime()
            .spawn(run(listener, Arc::clone(&manager), stopped));

        info!(addr = %local_addr, "accepting connections");
        Ok(Self {
            local_addr,
            stop,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close the listening socket.
    ///
    /// Connections already registered are left alone.
    pub fn stop(&self) {
        if !self.stop.send_replace(true) {
            info!(addr = %self.local_addr, "accept loop stopping");
        }
        self.task.abort();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow() || self.task.is_finished()
    }
}

impl Drop for AcceptLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(listener: TcpListener, manager: Arc<ConnectionManager>, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    trace!(%peer, "accepted socket");
                    let manager = Arc::clone(&manager);
                    let mut stop = stop.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            biased;
                            _ = stopped(&mut stop) => {
                                debug!(%peer, "listener stopped, dropping socket awaiting admission");
                            }
                            _ = manager.admit(socket) => {}
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    manager.notifier().error(ErrorSource::Accept, Error::Listener(e));
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
    debug!("accept loop exited");
}

/// Resolves once a stop is requested or the loop's owner is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}
