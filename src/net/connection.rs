//! Connection state machine and lifecycle tracking.
//!
//! # Responsibilities
//! - Track connection state (Accepted → Parsing → Classified → Forwarding | Tunneling → Closed)
//! - Generate unique connection IDs for tracing
//! - Count in-flight connections for draining and metrics
//! - Remember whether any response byte has reached the client

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::http::response::Status;
use crate::observability::metrics;

/// Most request bytes discarded after an error response before giving up.
pub const LINGER_MAX_BYTES: u64 = 256 * 1024;

/// Longest wait for the client to finish sending after an error response.
pub const LINGER_TIMEOUT: Duration = Duration::from_secs(2);

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state for lifecycle tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket accepted, nothing read yet.
    Accepted,
    /// Reading the request head.
    Parsing,
    /// Request head parsed and classified.
    Classified,
    /// Relaying a single request/response round-trip.
    Forwarding,
    /// Relaying opaque tunnel bytes.
    Tunneling,
    /// Connection is closed.
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Accepted => "accepted",
            ConnectionState::Parsing => "parsing",
            ConnectionState::Classified => "classified",
            ConnectionState::Forwarding => "forwarding",
            ConnectionState::Tunneling => "tunneling",
            ConnectionState::Closed => "closed",
        }
    }
}

/// Tracks active connections for graceful shutdown.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new active connection. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        let count = self.active_count.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_active_connections(count);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id: ConnectionId::new(),
        }
    }

    /// Get current active connection count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let remaining = self.active_count.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::set_active_connections(remaining);
        tracing::trace!(connection_id = %self.id, "Connection released");
    }
}

/// An accepted inbound client stream, owned by exactly one handler.
///
/// The read side is buffered so the parser can stop at the end of the
/// head while any bytes read past it stay available to the handler.
#[derive(Debug)]
pub struct ClientConnection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    accepted_at: Instant,
    state: ConnectionState,
    response_started: bool,
    pub(crate) reader: BufReader<OwnedReadHalf>,
    pub(crate) writer: OwnedWriteHalf,
}

impl ClientConnection {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, id: ConnectionId) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            id,
            peer_addr,
            accepted_at: Instant::now(),
            state: ConnectionState::Accepted,
            response_started: false,
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn accepted_at(&self) -> Instant {
        self.accepted_at
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn transition(&mut self, next: ConnectionState) {
        tracing::trace!(
            connection_id = %self.id,
            from = self.state.as_str(),
            to = next.as_str(),
            "Connection state change"
        );
        self.state = next;
    }

    /// Whether any response byte has been handed to the client socket.
    pub fn response_started(&self) -> bool {
        self.response_started
    }

    /// Write response bytes, marking the response as started.
    pub async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.response_started = true;
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }

    /// Write an empty-bodied status response unless a response is already underway.
    ///
    /// Returns `Ok(false)` when nothing was written.
    pub async fn respond(&mut self, status: Status) -> std::io::Result<bool> {
        if self.response_started {
            return Ok(false);
        }
        self.send(&status.to_bytes()).await?;
        Ok(true)
    }

    /// Flush and half-close the write side, then drop both halves.
    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
        self.transition(ConnectionState::Closed);
    }

    /// Close after an error response while the request may still be arriving.
    ///
    /// Dropping a socket with unread input sends a reset, which can discard
    /// the response before the client reads it. The write side is shut down
    /// first, then input is discarded until EOF, [`LINGER_MAX_BYTES`], or
    /// [`LINGER_TIMEOUT`], whichever comes first.
    pub async fn linger_close(mut self) {
        let _ = self.writer.shutdown().await;
        let mut unread = (&mut self.reader).take(LINGER_MAX_BYTES);
        let mut discard = tokio::io::sink();
        let drained = tokio::time::timeout(LINGER_TIMEOUT, tokio::io::copy(&mut unread, &mut discard)).await;
        match drained {
            Ok(Ok(discarded)) => {
                tracing::trace!(connection_id = %self.id, discarded, "Drained unread request bytes")
            }
            Ok(Err(e)) => tracing::trace!(connection_id = %self.id, error = %e, "Drain ended early"),
            Err(_) => tracing::trace!(connection_id = %self.id, "Client still sending at linger deadline"),
        }
        self.transition(ConnectionState::Closed);
    }
}
