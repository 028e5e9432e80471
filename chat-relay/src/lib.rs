//! Raw-byte chat relay: every chunk one client sends is copied to every
//! other connected client.
//!
//! Each module focuses on a concrete responsibility:
//!
//! - [`registry`] tracks live connections under one lock and fans payloads
//!   out to everyone except the sender.
//! - [`handler`] runs the per-connection read loop and tears the connection
//!   down when the peer leaves or the transport fails.
//! - [`server`] binds the listener, accepts clients, spawns one handler task
//!   per connection and drains them on shutdown.
//! - [`client`] is a small netcat-style terminal client.
//! - [`cli`] and [`config`] turn command-line flags into a [`config::RelayConfig`].
//!
//! There is no message framing: a message is whatever one read returns, up to
//! the configured chunk size.

pub mod cli;
pub mod client;
pub mod config;
pub mod handler;
pub mod registry;
pub mod server;
