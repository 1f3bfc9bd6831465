//! pooled-tcp: echo server on the pooled connection engine
//!
//! Serves the echo protocol over either framing:
//! - `line`: `<length>\r\n<data>`, `QUIT\r\n` to close
//! - `length-prefixed`: 4-byte big-endian length, then data

use pooled_tcp::config::{Config, ProtocolType};
use pooled_tcp::protocols::{EchoHandler, LengthPrefixedCodec, LineCodec};
use pooled_tcp::runtime::{Event, ProtocolCodec};
use pooled_tcp::Server;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.listener.host,
        port = config.listener.port,
        protocol = ?config.protocol,
        max_connections = config.manager.max_connections,
        initial_resources = config.manager.initial_resources,
        buffer_size = config.manager.buffer_size,
        "Starting pooled-tcp server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(serve(config))
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let codec: Arc<dyn ProtocolCodec> = match config.protocol {
        ProtocolType::Line => Arc::new(LineCodec::default()),
        ProtocolType::LengthPrefixed => Arc::new(LengthPrefixedCodec::default()),
    };

    let server = Server::new(config.manager, codec, Arc::new(EchoHandler))?;
    server.manager().notifier().subscribe(|notification| match &notification.event {
        Event::ConnectionStatus {
            conn_id,
            connected,
            error,
        } => match error {
            Some(error) => debug!(%conn_id, connected, %error, at = %notification.at, "connection status"),
            None => debug!(%conn_id, connected, at = %notification.at, "connection status"),
        },
        Event::Error { source, error } => {
            warn!(%source, %error, at = %notification.at, "error notification")
        }
        Event::RunningState { running } => {
            info!(running, at = %notification.at, "server running state changed")
        }
    });

    let addr = server.start(&config.listener).await?;
    info!(%addr, "listening, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.stop();
    let closed = server.close_all();
    info!(closed, "connections closed");
    Ok(())
}
