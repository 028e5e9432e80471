//! Per-connection receive loop.
//!
//! A handler owns one accepted connection: it reads raw chunks from the peer
//! and hands each one to [`ConnectionRegistry::broadcast`]. There is no
//! framing, so whatever a single read returns is one message. An application
//! message that arrives split across reads is relayed as several messages and
//! never reassembled.

use std::{fmt, io, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    select,
    sync::watch,
};
use tracing::{debug, info, warn};

use crate::registry::{Connection, ConnectionId, ConnectionRegistry};

pub const DEFAULT_MAX_CHUNK: usize = 2000;

pub fn greeting(id: ConnectionId) -> String {
    format!("connection {id} accepted, start chatting\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerSettings {
    pub max_chunk: usize,
    pub greeting: bool,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            max_chunk: DEFAULT_MAX_CHUNK,
            greeting: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reading,
    Disconnected,
    Errored,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connected => "connected",
            Self::Reading => "reading",
            Self::Disconnected => "disconnected",
            Self::Errored => "errored",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a handler stopped serving its connection.
#[derive(Debug)]
pub enum Disconnect {
    /// The peer closed its side cleanly.
    PeerClosed,
    /// Writing the greeting to the peer failed.
    GreetingFailed(io::Error),
    /// Reading from the peer failed.
    ReadFailed(io::Error),
    /// The relay is shutting down.
    Shutdown,
}

/// What a finished handler reports back to whoever spawned it.
#[derive(Debug)]
pub struct HandlerExit {
    pub id: ConnectionId,
    pub reason: Disconnect,
    /// Every state the connection passed through, starting at `Connected`.
    pub states: Vec<ConnectionState>,
}

impl HandlerExit {
    pub fn final_state(&self) -> ConnectionState {
        self.states
            .last()
            .copied()
            .unwrap_or(ConnectionState::Connected)
    }
}

pub struct ConnectionHandler<R, W> {
    reader: R,
    connection: Connection<W>,
    registry: Arc<ConnectionRegistry<W>>,
    shutdown: watch::Receiver<bool>,
    settings: HandlerSettings,
    states: Vec<ConnectionState>,
}

impl<R, W> ConnectionHandler<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    /// `connection` must already be registered in `registry`.
    pub fn new(
        reader: R,
        connection: Connection<W>,
        registry: Arc<ConnectionRegistry<W>>,
        shutdown: watch::Receiver<bool>,
        settings: HandlerSettings,
    ) -> Self {
        Self {
            reader,
            connection,
            registry,
            shutdown,
            settings,
            states: vec![ConnectionState::Connected],
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn state(&self) -> ConnectionState {
        self.states
            .last()
            .copied()
            .unwrap_or(ConnectionState::Connected)
    }

    /// Serves the connection until the peer leaves, the transport fails, or
    /// the relay shuts down, then tears it down.
    pub async fn run(mut self) -> HandlerExit {
        let reason = self.serve().await;
        match &reason {
            Disconnect::PeerClosed => {
                self.transition(ConnectionState::Disconnected);
                info!(conn = %self.id(), "client disconnected");
            }
            Disconnect::GreetingFailed(error) => {
                self.transition(ConnectionState::Errored);
                warn!(conn = %self.id(), %error, "failed to greet client");
            }
            Disconnect::ReadFailed(error) => {
                self.transition(ConnectionState::Errored);
                warn!(conn = %self.id(), %error, "client connection failed");
            }
            Disconnect::Shutdown => {
                self.transition(ConnectionState::Disconnected);
                info!(conn = %self.id(), "closing client for shutdown");
            }
        }
        let id = self.id();
        let states = self.teardown().await;
        HandlerExit { id, reason, states }
    }

    async fn serve(&mut self) -> Disconnect {
        if self.settings.greeting {
            let greeting = greeting(self.id());
            if let Err(error) = self.connection.send(greeting.as_bytes()).await {
                return Disconnect::GreetingFailed(error);
            }
        }

        self.transition(ConnectionState::Reading);
        let mut buf = vec![0u8; self.settings.max_chunk.max(1)];

        loop {
            if *self.shutdown.borrow() {
                return Disconnect::Shutdown;
            }

            select! {
                read = self.reader.read(&mut buf) => match read {
                    Ok(0) => return Disconnect::PeerClosed,
                    Ok(len) => {
                        let report = self.registry.broadcast(self.connection.id(), &buf[..len]).await;
                        debug!(conn = %self.id(), bytes = len, ?report, "relayed chunk");
                    }
                    Err(error) => return Disconnect::ReadFailed(error),
                },
                changed = self.shutdown.changed() => {
                    // A dropped sender also means nobody is left to keep the relay running.
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Disconnect::Shutdown;
                    }
                }
            }
        }
    }

    async fn teardown(mut self) -> Vec<ConnectionState> {
        let id = self.id();
        self.registry.remove_connection(id).await;
        if let Err(error) = self.connection.shutdown().await {
            debug!(conn = %id, ?error, "failed to shut down connection");
        }
        self.transition(ConnectionState::Closed);
        self.states
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(conn = %self.id(), from = %self.state(), to = %next, "connection state changed");
        self.states.push(next);
    }
}
