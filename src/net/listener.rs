//! TCP listener wrapper.
//!
//! # Responsibilities
//! - Bind to the configured host and the CLI port
//! - Accept incoming TCP connections
//! - Report bind and accept failures as distinct errors

use std::net::SocketAddr;
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};

use crate::config::ListenerConfig;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Failed to bind to address.
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to accept connection.
    #[error("Failed to accept: {0}")]
    Accept(#[source] std::io::Error),
}

/// Listening socket for client connections.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    #[cfg(test)]
    failing_accepts: AtomicUsize,
}

impl Listener {
    /// Bind to the configured address.
    pub async fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let address = config.bind_address();
        let bind_error = |source| ListenerError::Bind {
            address: address.clone(),
            source,
        };

        let listener = TcpListener::bind(address.as_str()).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        tracing::info!(address = %local_addr, "Listener bound");

        Ok(Self::from_tokio(listener))
    }

    /// Wrap an already-bound Tokio listener.
    pub fn from_tokio(inner: TcpListener) -> Self {
        Self {
            inner,
            #[cfg(test)]
            failing_accepts: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` calls to `accept` fail without touching the socket.
    #[cfg(test)]
    pub(crate) fn fail_next_accepts(&self, n: usize) {
        self.failing_accepts.store(n, Ordering::SeqCst);
    }

    /// Accept the next client connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ListenerError> {
        #[cfg(test)]
        if self
            .failing_accepts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ListenerError::Accept(std::io::Error::other("simulated accept failure")));
        }

        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;
        tracing::debug!(peer_addr = %addr, "Connection accepted");
        Ok((stream, addr))
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_ephemeral_port_and_accepts() {
        let config = ListenerConfig {
            bind_host: "127.0.0.1".into(),
            port: 0,
            ..ListenerConfig::default()
        };
        let listener = Listener::bind(&config).await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (_stream, peer) = listener.accept().await.unwrap();
        let client = client.await.unwrap().unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let first = Listener::bind(&ListenerConfig {
            bind_host: "127.0.0.1".into(),
            port: 0,
            ..ListenerConfig::default()
        })
        .await
        .unwrap();
        let taken = first.local_addr().unwrap().port();

        let err = Listener::bind(&ListenerConfig {
            bind_host: "127.0.0.1".into(),
            port: taken,
            ..ListenerConfig::default()
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ListenerError::Bind { .. }));
    }

    #[tokio::test]
    async fn scheduled_accept_failures_are_reported_then_cleared() {
        let listener = Listener::from_tokio(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let addr = listener.local_addr().unwrap();
        listener.fail_next_accepts(2);

        for _ in 0..2 {
            assert!(matches!(listener.accept().await, Err(ListenerError::Accept(_))));
        }

        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        assert!(listener.accept().await.is_ok());
        client.await.unwrap().unwrap();
    }
}
