//! TCP listeners with backpressure.
//!
//! # Responsibilities
//! - Bind one listener per distinct service port
//! - Accept incoming TCP connections
//! - Enforce max_connections (shared across ports) via semaphore
//! - Graceful handling of accept errors

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to accept: {0}")]
    Accept(#[source] std::io::Error),
    #[error("connection limiter closed")]
    LimiterClosed,
}

/// A TCP listener whose accepts are gated by a shared connection limit.
///
/// When the limit is reached, accepting waits until a slot frees up.
pub struct Listener {
    inner: TcpListener,
    connection_limit: Arc<Semaphore>,
}

impl Listener {
    /// Wrap an already bound listener.
    pub fn from_tcp(inner: TcpListener, connection_limit: Arc<Semaphore>) -> Self {
        Self {
            inner,
            connection_limit,
        }
    }

    /// Bind `host:port`.
    pub async fn bind(host: &str, port: u16, connection_limit: Arc<Semaphore>) -> Result<Self, ListenerError> {
        let address = format!("{}:{}", host, port);
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| ListenerError::Bind {
                address: address.clone(),
                source,
            })?;

        tracing::info!(
            address = %address,
            available_permits = connection_limit.available_permits(),
            "Listener bound"
        );

        Ok(Self::from_tcp(listener, connection_limit))
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// Returns the stream and a permit that must be held for the connection's lifetime.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        // Acquire permit first (backpressure)
        let permit = self
            .connection_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::LimiterClosed)?;

        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

/// Sorted, de-duplicated list of ports to bind.
pub fn dedup_ports(ports: impl IntoIterator<Item = u16>) -> Vec<u16> {
    let mut ports: Vec<u16> = ports.into_iter().collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}
