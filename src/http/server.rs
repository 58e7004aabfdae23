//! Connection acceptor.
//!
//! # Responsibilities
//! - Accept client connections until shutdown is signalled
//! - Spawn one handler task per connection, each in its own tracing span
//! - Keep accepting after transient accept failures
//! - On shutdown: stop accepting, drain live connections, release the cache
//!
//! # Design Decisions
//! - The acceptor never awaits a handler; tasks are detached and tracked only
//!   through `ConnectionTracker`
//! - The cache is built once here and shared with every handler via `Arc`

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::Instrument;

use crate::cache::ResponseCache;
use crate::config::ProxyConfig;
use crate::http::handler::RequestHandler;
use crate::net::{ConnectionContext, ConnectionTracker, Listener, PeerResolver};

/// The caching proxy server.
#[derive(Debug)]
pub struct ProxyServer {
    cache: Arc<ResponseCache>,
    resolver: Arc<PeerResolver>,
    tracker: ConnectionTracker,
    drain_timeout: Duration,
}

impl ProxyServer {
    /// Create a new server with the given configuration.
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            cache: Arc::new(ResponseCache::new(&config.cache)),
            resolver: Arc::new(PeerResolver::from_config(&config.listener)),
            tracker: ConnectionTracker::new(),
            drain_timeout: Duration::from_secs(config.lifecycle.drain_timeout_secs),
        }
    }

    /// Shared response cache.
    pub fn cache(&self) -> Arc<ResponseCache> {
        Arc::clone(&self.cache)
    }

    /// Live connection tracker.
    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Accept connections until `shutdown` fires, then drain.
    pub async fn run(
        self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            max_cache_size = self.cache.max_cache_size(),
            max_object_size = self.cache.max_object_size(),
            "Caching proxy listening"
        );

        let handler = RequestHandler::new(Arc::clone(&self.cache), Arc::clone(&self.resolver));

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let guard = self.tracker.track();
                            let ctx = ConnectionContext::new(guard.id(), peer);
                            let span = tracing::info_span!("connection", connection_id = %guard.id());
                            let handler = handler.clone();
                            tokio::spawn(
                                async move {
                                    let _guard = guard;
                                    handler.handle(stream, ctx).await;
                                }
                                .instrument(span),
                            );
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, no longer accepting");
                    break;
                }
            }
        }
        drop(listener);

        self.drain().await;
        self.cache.shutdown();
        tracing::info!("Proxy server stopped");
        Ok(())
    }

    async fn drain(&self) {
        let active = self.tracker.active_count();
        if active == 0 {
            return;
        }
        tracing::info!(active, timeout_secs = self.drain_timeout.as_secs(), "Draining connections");
        if tokio::time::timeout(self.drain_timeout, self.tracker.wait_for_idle())
            .await
            .is_err()
        {
            tracing::warn!(
                active = self.tracker.active_count(),
                "Drain timeout elapsed with connections still open"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn start() -> (std::net::SocketAddr, Arc<ResponseCache>, crate::lifecycle::Shutdown, tokio::task::JoinHandle<()>) {
        let listener = Listener::from_tokio(TcpListener::bind("127.0.0.1:0").await.unwrap());
        start_on(listener).await
    }

    async fn start_on(
        listener: Listener,
    ) -> (std::net::SocketAddr, Arc<ResponseCache>, crate::lifecycle::Shutdown, tokio::task::JoinHandle<()>) {
        let addr = listener.local_addr().unwrap();
        let mut config = ProxyConfig::default();
        config.listener.reverse_dns = false;
        let server = ProxyServer::new(&config);
        let cache = server.cache();
        let shutdown = crate::lifecycle::Shutdown::new();
        let rx = shutdown.subscribe();
        let task = tokio::spawn(async move {
            server.run(listener, rx).await.unwrap();
        });
        (addr, cache, shutdown, task)
    }

    #[tokio::test]
    async fn stalled_client_does_not_block_others() {
        let (addr, _cache, shutdown, task) = start().await;

        let stalled = TcpStream::connect(addr).await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET /nothing\r\n").await.unwrap();
        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert!(response.starts_with(b"HTTP/1.0 400 Bad Request"));

        drop(stalled);
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_clears_cache() {
        let (_addr, cache, shutdown, task) = start().await;
        cache
            .insert("http://origin.test/", bytes::Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(cache.len(), 1);

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn accept_failures_do_not_stop_the_loop() {
        let listener = Listener::from_tokio(TcpListener::bind("127.0.0.1:0").await.unwrap());
        listener.fail_next_accepts(3);
        let (addr, _cache, shutdown, task) = start_on(listener).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET /nothing\r\n").await.unwrap();
        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert!(response.starts_with(b"HTTP/1.0 400 Bad Request"));

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
