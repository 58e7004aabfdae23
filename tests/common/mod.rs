//! Shared utilities for integration and load testing.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use caching_proxy::config::ProxyConfig;
use caching_proxy::net::Listener;
use caching_proxy::{ProxyServer, ResponseCache, Shutdown};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// A raw HTTP origin serving fixed responses by path.
pub struct MockOrigin {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    heads: Arc<Mutex<Vec<String>>>,
}

impl MockOrigin {
    /// Number of connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Request heads received, in arrival order.
    pub fn heads(&self) -> Vec<String> {
        self.heads.lock().unwrap().clone()
    }

    /// Absolute URL for `path` on this origin.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Start a mock origin. Unknown paths get a 404 with an empty body.
pub async fn start_mock_origin(routes: Vec<(&'static str, Vec<u8>)>) -> MockOrigin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let routes: Arc<HashMap<&'static str, Vec<u8>>> = Arc::new(routes.into_iter().collect());
    let connections = Arc::new(AtomicUsize::new(0));
    let heads = Arc::new(Mutex::new(Vec::new()));

    let origin = MockOrigin {
        addr,
        connections: Arc::clone(&connections),
        heads: Arc::clone(&heads),
    };

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            connections.fetch_add(1, Ordering::SeqCst);
            let routes = Arc::clone(&routes);
            let heads = Arc::clone(&heads);
            tokio::spawn(async move {
                let mut reader = BufReader::new(socket);
                let mut head = String::new();
                loop {
                    let mut line = String::new();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                    head.push_str(&line);
                    if line == "\r\n" {
                        break;
                    }
                }

                let path = head
                    .split_whitespace()
                    .nth(1)
                    .unwrap_or("/")
                    .to_string();
                heads.lock().unwrap().push(head);

                let mut socket = reader.into_inner();
                let response = match routes.get(path.as_str()) {
                    Some(response) => response.clone(),
                    None => b"HTTP/1.0 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_vec(),
                };
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    origin
}

/// A complete HTTP/1.0 response of exactly `total` bytes.
pub fn http_response_of_size(total: usize) -> Vec<u8> {
    const PREFIX: &str = "HTTP/1.0 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: ";
    const SUFFIX: &str = "\r\n\r\n";
    let base = PREFIX.len() + SUFFIX.len();

    // Content-Length is zero-padded to `width` digits so every total past the
    // minimum has an exact fit.
    for width in 1..=20 {
        let Some(body_len) = total.checked_sub(base + width) else {
            break;
        };
        if body_len.to_string().len() <= width {
            let mut response = format!("{PREFIX}{body_len:0width$}{SUFFIX}").into_bytes();
            response.extend((0..body_len).map(|i| b'a' + (i % 26) as u8));
            assert_eq!(response.len(), total);
            return response;
        }
    }
    panic!("a {total}-byte response cannot hold a {}-byte head", base + 1);
}

/// A running proxy on an ephemeral port.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub cache: Arc<ResponseCache>,
    shutdown: Shutdown,
    task: tokio::task::JoinHandle<()>,
}

impl TestProxy {
    pub async fn stop(self) {
        self.shutdown.trigger();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }
}

pub async fn start_proxy() -> TestProxy {
    start_proxy_with(ProxyConfig::default()).await
}

pub async fn start_proxy_with(config: ProxyConfig) -> TestProxy {
    let listener = Listener::from_tokio(TcpListener::bind("127.0.0.1:0").await.unwrap());
    let addr = listener.local_addr().unwrap();
    let server = ProxyServer::new(&config);
    let cache = server.cache();
    let shutdown = Shutdown::new();
    let rx = shutdown.subscribe();
    let task = tokio::spawn(async move {
        let _ = server.run(listener, rx).await;
    });
    TestProxy {
        addr,
        cache,
        shutdown,
        task,
    }
}

/// Send `request` as-is and read until the proxy closes the connection.
pub async fn raw_request(proxy: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut response))
        .await
        .expect("proxy did not close the connection")
        .unwrap();
    response
}

/// `GET <url> HTTP/1.0` through the proxy.
pub async fn get(proxy: SocketAddr, url: &str) -> Vec<u8> {
    raw_request(proxy, format!("GET {url} HTTP/1.0\r\n\r\n").as_bytes()).await
}

/// Poll until `cond` holds or two seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
