use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::{
    handler::DEFAULT_MAX_CHUNK, registry::DEFAULT_WRITE_TIMEOUT_MS, server::DEFAULT_BACKLOG,
};

/// Relays raw bytes from each connected client to every other client.
///
/// Without a subcommand the relay server runs.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(flatten)]
    pub serve: ServeArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect to a relay and exchange raw bytes through stdin/stdout.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:8888")]
    pub listen: SocketAddr,

    /// Pending connection queue length passed to listen(2).
    #[arg(long, default_value_t = DEFAULT_BACKLOG)]
    pub backlog: u32,

    /// Largest chunk read from a client and relayed as one message.
    #[arg(long, default_value_t = DEFAULT_MAX_CHUNK)]
    pub max_chunk: usize,

    /// Give up on a single recipient write after this many milliseconds.
    #[arg(long, default_value_t = DEFAULT_WRITE_TIMEOUT_MS)]
    pub write_timeout_ms: u64,

    /// Do not send the greeting line to new connections.
    #[arg(long)]
    pub no_greeting: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:8888")]
    pub server: SocketAddr,
}
