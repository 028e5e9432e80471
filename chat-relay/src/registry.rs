//! Shared set of live connections and the fan-out used to relay bytes
//! between them.
//!
//! The registry never owns a connection. Each entry holds a [`Weak`] pointer
//! to the writer owned by the connection's [`Connection`] handle, so once a
//! handler tears down and drops its handle a broadcast can no longer reach the
//! transport, even if the entry has not been removed yet.

use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
    time::timeout,
};
use tracing::debug;

pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type SharedWriter<W> = Arc<Mutex<W>>;

/// Owning side of a registered connection.
///
/// Held by the handler serving the connection. Dropping it releases the
/// writer; the registry only ever observes it through a weak pointer.
pub struct Connection<W> {
    id: ConnectionId,
    writer: SharedWriter<W>,
}

impl<W> Connection<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Writes directly to this connection, bypassing the registry.
    pub async fn send(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Shuts down the write direction of the transport.
    pub async fn shutdown(&self) -> std::io::Result<()> {
        self.writer.lock().await.shutdown().await
    }
}

struct Entry<W> {
    id: ConnectionId,
    writer: Weak<Mutex<W>>,
}

/// Outcome of one broadcast pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
    /// Entries dropped because their connection was already released.
    pub pruned: usize,
}

pub struct ConnectionRegistry<W> {
    entries: Mutex<Vec<Entry<W>>>,
    next_id: AtomicU64,
    write_timeout: Duration,
}

impl<W> Default for ConnectionRegistry<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<W> ConnectionRegistry<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new() -> Self {
        Self::with_write_timeout(DEFAULT_WRITE_TIMEOUT)
    }

    /// Creates a registry whose per-recipient writes give up after
    /// `write_timeout`, so one stalled peer cannot hold the lock forever.
    pub fn with_write_timeout(write_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            write_timeout,
        }
    }

    /// Registers the write side of a freshly accepted connection.
    ///
    /// Capacity is bounded only by memory and the process file descriptor
    /// limit.
    pub async fn add_connection(&self, writer: W) -> Connection<W> {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let writer = Arc::new(Mutex::new(writer));

        let mut entries = self.entries.lock().await;
        entries.push(Entry {
            id,
            writer: Arc::downgrade(&writer),
        });
        debug!(conn = %id, active = entries.len(), "connection registered");

        Connection { id, writer }
    }

    /// Returns `true` if the connection was registered.
    pub async fn remove_connection(&self, id: ConnectionId) -> bool {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let removed = entries.len() != before;
        if removed {
            debug!(conn = %id, active = entries.len(), "connection unregistered");
        }
        removed
    }

    /// Sends `payload` to every registered connection except `sender`.
    ///
    /// A failed or timed out write only affects that recipient; its own
    /// handler notices the broken transport on its next read.
    pub async fn broadcast(&self, sender: ConnectionId, payload: &[u8]) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut entries = self.entries.lock().await;

        let mut index = 0;
        while index < entries.len() {
            let Some(writer) = entries[index].writer.upgrade() else {
                let stale = entries.remove(index);
                debug!(conn = %stale.id, "pruned released connection");
                report.pruned += 1;
                continue;
            };

            let id = entries[index].id;
            index += 1;
            if id == sender {
                continue;
            }

            match self.deliver(&writer, payload).await {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    debug!(conn = %id, ?error, "failed to deliver broadcast");
                    report.failed += 1;
                }
            }
        }

        report
    }

    async fn deliver(&self, writer: &Mutex<W>, payload: &[u8]) -> std::io::Result<()> {
        let write = async {
            let mut writer = writer.lock().await;
            writer.write_all(payload).await?;
            writer.flush().await
        };

        match timeout(self.write_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "broadcast write timed out",
            )),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.entries.lock().await.iter().any(|entry| entry.id == id)
    }

    /// Registered connection ids in insertion order.
    pub async fn ids(&self) -> Vec<ConnectionId> {
        self.entries.lock().await.iter().map(|entry| entry.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, DuplexStream, duplex};

    async fn register(
        registry: &ConnectionRegistry<DuplexStream>,
    ) -> (Connection<DuplexStream>, DuplexStream) {
        let (relay_side, peer_side) = duplex(4096);
        (registry.add_connection(relay_side).await, peer_side)
    }

    async fn read_exactly(peer: &mut DuplexStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        peer.read_exact(&mut buf).await.expect("read payload");
        buf
    }

    async fn assert_nothing_pending(peer: &mut DuplexStream) {
        let mut buf = [0u8; 16];
        let pending = timeout(Duration::from_millis(50), peer.read(&mut buf)).await;
        assert!(pending.is_err(), "expected no data, got {pending:?}");
    }

    #[tokio::test]
    async fn ids_are_unique_and_ordered() {
        let registry = ConnectionRegistry::new();
        let (a, _pa) = register(&registry).await;
        let (b, _pb) = register(&registry).await;
        let (c, _pc) = register(&registry).await;

        assert!(a.id() < b.id() && b.id() < c.id());
        assert_eq!(registry.ids().await, vec![a.id(), b.id(), c.id()]);
    }

    #[tokio::test]
    async fn broadcast_skips_sender() {
        let registry = ConnectionRegistry::new();
        let (a, mut peer_a) = register(&registry).await;
        let (_b, mut peer_b) = register(&registry).await;
        let (_c, mut peer_c) = register(&registry).await;

        let report = registry.broadcast(a.id(), b"hello").await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(read_exactly(&mut peer_b, 5).await, b"hello");
        assert_eq!(read_exactly(&mut peer_c, 5).await, b"hello");
        assert_nothing_pending(&mut peer_a).await;
    }

    #[tokio::test]
    async fn broken_recipient_does_not_stop_delivery() {
        let registry = ConnectionRegistry::new();
        let (a, _peer_a) = register(&registry).await;
        let (_b, peer_b) = register(&registry).await;
        let (_c, mut peer_c) = register(&registry).await;

        // Dropping the far end makes every write to b fail with BrokenPipe.
        drop(peer_b);
        let report = registry.broadcast(a.id(), b"still here").await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(read_exactly(&mut peer_c, 10).await, b"still here");
    }

    #[tokio::test]
    async fn stalled_recipient_times_out() {
        let registry = ConnectionRegistry::with_write_timeout(Duration::from_millis(50));
        let (a, _peer_a) = register(&registry).await;
        let (stalled_side, mut stalled_peer) = duplex(4);
        let _stalled = registry.add_connection(stalled_side).await;
        let (_c, mut peer_c) = register(&registry).await;

        let report = registry.broadcast(a.id(), b"larger than four bytes").await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(read_exactly(&mut peer_c, 22).await, b"larger than four bytes");

        // The write gave up after filling the pipe, so the recipient holds a
        // truncated chunk rather than nothing.
        assert_eq!(read_exactly(&mut stalled_peer, 4).await, b"larg");
    }

    #[tokio::test]
    async fn membership_tracks_adds_and_removes() {
        let registry = ConnectionRegistry::new();
        let (a, _pa) = register(&registry).await;
        let (b, _pb) = register(&registry).await;
        let (c, _pc) = register(&registry).await;

        assert!(registry.remove_connection(b.id()).await);
        assert!(!registry.remove_connection(b.id()).await);
        assert_eq!(registry.ids().await, vec![a.id(), c.id()]);

        let (d, _pd) = register(&registry).await;
        assert!(registry.remove_connection(a.id()).await);
        assert_eq!(registry.ids().await, vec![c.id(), d.id()]);
        assert!(!registry.contains(a.id()).await);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn removed_connection_is_never_written() {
        let registry = ConnectionRegistry::new();
        let (a, _peer_a) = register(&registry).await;
        let (b, mut peer_b) = register(&registry).await;

        registry.remove_connection(b.id()).await;
        let report = registry.broadcast(a.id(), b"gone").await;

        assert_eq!(report, BroadcastReport::default());
        drop(b);
        let mut buf = [0u8; 8];
        // The relay side was dropped without a write, so the peer sees EOF.
        assert_eq!(peer_b.read(&mut buf).await.expect("read eof"), 0);
    }

    #[tokio::test]
    async fn released_handles_are_pruned() {
        let registry = ConnectionRegistry::new();
        let (a, _peer_a) = register(&registry).await;
        let (b, _peer_b) = register(&registry).await;

        drop(b);
        let report = registry.broadcast(a.id(), b"x").await;

        assert_eq!(report.pruned, 1);
        assert_eq!(report.delivered, 0);
        assert_eq!(registry.ids().await, vec![a.id()]);
    }
}
