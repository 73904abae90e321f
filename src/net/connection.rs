//! Connection identity and lifecycle tracking.
//!
//! # Responsibilities
//! - Derive the connection ID from the peer address (16-bit CRC)
//! - Count live connections for graceful shutdown
//! - Release the count when a connection task ends, even on panic

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crc16::{State, ARC};

/// Identifier of a connection.
///
/// Deterministic per peer: the CRC-16 of the remote IP text followed by the
/// remote port in decimal. Two sockets from the same address and port map to
/// the same ID; the ID is a label, not an ownership key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u16);

impl ConnectionId {
    /// Derive the ID for a remote peer.
    pub fn from_peer(peer: &SocketAddr) -> Self {
        let seed = format!("{}{}", peer.ip(), peer.port());
        Self(State::<ARC>::calculate(seed.as_bytes()))
    }

    /// Get the raw ID value.
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl From<u16> for ConnectionId {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tracks active connections for graceful shutdown.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new active connection. Returns a guard that decrements on drop.
    pub fn track(&self, id: ConnectionId) -> ConnectionGuard {
        let active = self.active_count.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!("wtvp_connections_active").set(active as f64);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id,
        }
    }

    /// Get current active connection count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Wait until all connections are closed or `deadline` elapses.
    ///
    /// Returns `true` when the count reached zero in time.
    pub async fn wait_for_drain(&self, deadline: Duration) -> bool {
        let drained = async {
            while self.active_count.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        tokio::time::timeout(deadline, drained).await.is_ok()
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
        let active = self.active_count.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::gauge!("wtvp_connections_active").set(active as f64);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_is_deterministic() {
        let peer: SocketAddr = "10.0.0.5:1615".parse().unwrap();
        assert_eq!(ConnectionId::from_peer(&peer), ConnectionId::from_peer(&peer));
    }

    #[test]
    fn connection_id_differs_by_port() {
        let a: SocketAddr = "10.0.0.5:50000".parse().unwrap();
        let b: SocketAddr = "10.0.0.5:50001".parse().unwrap();
        assert_ne!(ConnectionId::from_peer(&a), ConnectionId::from_peer(&b));
    }

    #[test]
    fn connection_tracker_counts() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track(ConnectionId::from(1));
        assert_eq!(tracker.active_count(), 1);

        let guard2 = tracker.track(ConnectionId::from(2));
        assert_eq!(tracker.active_count(), 2);

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);

        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn drain_times_out_with_live_connection() {
        let tracker = ConnectionTracker::new();
        let _guard = tracker.track(ConnectionId::from(9));
        assert!(!tracker.wait_for_drain(Duration::from_millis(150)).await);
    }
}
