use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    net::{
        TcpListener, TcpSocket, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::watch,
    task::{JoinError, JoinSet},
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::{
    config::RelayConfig,
    handler::{ConnectionHandler, HandlerExit, HandlerSettings},
    registry::ConnectionRegistry,
};

pub const DEFAULT_BACKLOG: u32 = 3;

/// Pause after a transient accept failure so running out of file
/// descriptors does not turn into a hot loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub type TcpRegistry = ConnectionRegistry<OwnedWriteHalf>;

/// Accepts TCP clients, registers them and spawns one handler task each.
pub struct Relay {
    listener: TcpListener,
    registry: Arc<TcpRegistry>,
    settings: HandlerSettings,
}

impl Relay {
    /// Creates the listening socket with `SO_REUSEADDR` set.
    pub fn bind(config: &RelayConfig) -> Result<Self> {
        let socket = if config.listen.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .context("failed to create listening socket")?;

        socket
            .set_reuseaddr(true)
            .context("failed to enable address reuse on listening socket")?;
        socket
            .bind(config.listen)
            .with_context(|| format!("failed to bind {}", config.listen))?;
        let listener = socket
            .listen(config.backlog)
            .with_context(|| format!("failed to listen on {}", config.listen))?;

        Ok(Self::from_listener(listener, config))
    }

    pub fn from_listener(listener: TcpListener, config: &RelayConfig) -> Self {
        Self {
            listener,
            registry: Arc::new(ConnectionRegistry::with_write_timeout(config.write_timeout)),
            settings: config.handler,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<TcpRegistry> {
        Arc::clone(&self.registry)
    }

    /// Runs the accept loop until `shutdown` resolves or the listener becomes
    /// unusable, then waits for every handler to finish its teardown.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay {
            listener,
            registry,
            settings,
        } = self;
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut handlers = JoinSet::new();
        tokio::pin!(shutdown);

        let outcome = loop {
            select! {
                _ = &mut shutdown => break Ok(()),
                accept_result = listener.accept() => match accept_result {
                    Ok((stream, peer)) => {
                        let handler = register_connection(stream, peer, &registry, &stop_rx, settings).await;
                        handlers.spawn(handler.run());
                    }
                    Err(err) if listener_unusable(&err) => {
                        break Err(anyhow::Error::new(err).context("listener is no longer usable"));
                    }
                    Err(err) => {
                        warn!(error = ?err, "failed to accept connection");
                        sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    log_handler_exit(joined);
                }
            }
        };

        drop(listener);
        info!(active = handlers.len(), "relay shutting down");
        stop_tx.send_replace(true);
        while let Some(joined) = handlers.join_next().await {
            log_handler_exit(joined);
        }
        info!("all connections closed");

        outcome
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Registers the write half before the handler exists, so the connection can
/// receive broadcasts from the moment it is accepted.
async fn register_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Arc<TcpRegistry>,
    stop_rx: &watch::Receiver<bool>,
    settings: HandlerSettings,
) -> ConnectionHandler<OwnedReadHalf, OwnedWriteHalf> {
    let (reader, writer) = stream.into_split();
    let connection = registry.add_connection(writer).await;
    info!(conn = %connection.id(), %peer, "connection accepted");

    ConnectionHandler::new(
        reader,
        connection,
        Arc::clone(registry),
        stop_rx.clone(),
        settings,
    )
}

/// Distinguishes a dead listener from failures tied to one incoming
/// connection (aborted handshakes, descriptor exhaustion, interrupts).
fn listener_unusable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::NotConnected | io::ErrorKind::Unsupported
    )
}

fn log_handler_exit(joined: Result<HandlerExit, JoinError>) {
    match joined {
        Ok(exit) => debug!(
            conn = %exit.id,
            reason = ?exit.reason,
            state = %exit.final_state(),
            "handler finished"
        ),
        Err(err) => warn!(error = ?err, "connection handler panicked"),
    }
}
