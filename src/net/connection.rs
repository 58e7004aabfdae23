//! Per-connection identity and lifetime tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Record the peer's host/service strings (best effort, reverse resolved)
//! - Count live connections so shutdown can drain them

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::net::resolver::PeerResolver;
use crate::observability::metrics;

/// Relaxed ordering is enough: IDs only need to be unique.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

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

/// Transient state for one accepted client connection.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub id: ConnectionId,
    /// Address reported by `accept`.
    pub peer: SocketAddr,
    /// Peer host, when it could be confirmed.
    pub host: Option<String>,
    /// Peer service (port), when it could be confirmed.
    pub service: Option<String>,
}

impl ConnectionContext {
    pub fn new(id: ConnectionId, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            host: None,
            service: None,
        }
    }

    /// Confirm the peer of an accepted socket and record its host and
    /// service strings. The host is the reverse-resolved name when the
    /// resolver finds one, the numeric address otherwise. Failure is logged
    /// and otherwise ignored.
    pub async fn confirm(&mut self, stream: &TcpStream, resolver: &PeerResolver) {
        match stream.peer_addr() {
            Ok(addr) => {
                let host = match resolver.reverse(addr.ip()).await {
                    Some(name) => name,
                    None => addr.ip().to_string(),
                };
                let service = addr.port().to_string();
                tracing::info!(
                    connection_id = %self.id,
                    "Accepted connection from {}:{}",
                    host,
                    service
                );
                self.host = Some(host);
                self.service = Some(service);
            }
            Err(e) => {
                tracing::warn!(
                    connection_id = %self.id,
                    peer = %self.peer,
                    error = %e,
                    "Could not confirm peer address"
                );
            }
        }
    }

    /// `host:service` when confirmed, otherwise the accepted address.
    pub fn peer_label(&self) -> String {
        match (&self.host, &self.service) {
            (Some(host), Some(service)) => format!("{host}:{service}"),
            _ => self.peer.to_string(),
        }
    }
}

/// Counts live connections for graceful shutdown.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new live connection. The returned guard decrements the count
    /// when dropped, on every exit path of the connection task.
    pub fn track(&self) -> ConnectionGuard {
        let active = self.active_count.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::record_connection_opened(active);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id: ConnectionId::new(),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Wait until all tracked connections have closed.
    pub async fn wait_for_idle(&self) {
        while self.active_count() > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Guard that tracks a connection's lifetime.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let active = self.active_count.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::record_connection_closed(active);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}
