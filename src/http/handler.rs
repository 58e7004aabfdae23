//! Per-connection request handling.
//!
//! # Data Flow
//! ```text
//! accepted socket
//!     → confirm peer (best effort)
//!     → read request head line by line (parser.rs)
//!     → cache probe ── hit ──→ write pinned bytes → release → close
//!     → miss → forwarder.rs → relay each chunk to the client
//!                           → copy into capture buffer (≤ max object size)
//!     → end the client's response (write half shut down)
//!     → populate cache if the whole response was captured
//!     → close
//! ```
//!
//! # Design Decisions
//! - Every failure ends only this connection; nothing propagates to the acceptor
//! - Chunks reach the client before the next origin read; nothing waits for
//!   the full response
//! - Client protocol errors get a 400 page, an unreachable origin a 502 page;
//!   mid-stream failures just close

use std::collections::TryReserveError;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures_util::TryStreamExt;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::cache::{InsertOutcome, ResponseCache};
use crate::http::forwarder::{ForwardError, OriginConnection};
use crate::http::parser::{ParseError, RequestDescriptor, RequestParser, MAX_LINE};
use crate::http::response::{send_client_error, ErrorPage};
use crate::net::{ConnectionContext, PeerResolver};
use crate::observability::metrics;

/// Errors that end a single connection.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("request line exceeds the line limit")]
    LineTooLong,

    #[error("request head is not valid UTF-8")]
    InvalidUtf8,

    #[error("connection closed before the end of the request head")]
    IncompleteHead,

    #[error("failed to read request: {0}")]
    Read(#[source] std::io::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Forward(#[from] ForwardError),

    #[error("failed to write to client: {0}")]
    ClientWrite(#[source] std::io::Error),

    #[error("out of memory capturing response: {0}")]
    OutOfMemory(#[from] TryReserveError),
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The client closed before sending anything.
    Closed,
    ServedFromCache,
    /// Relayed from the origin; `cached` if the response entered the cache.
    Forwarded { cached: bool },
    BadRequest,
    OriginUnreachable,
    /// The origin failed after the connection was made.
    OriginFailed,
    /// The client went away mid-response.
    ClientGone,
    Aborted,
}

impl Outcome {
    /// Label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Closed => "closed",
            Outcome::ServedFromCache => "cache_hit",
            Outcome::Forwarded { .. } => "forwarded",
            Outcome::BadRequest => "bad_request",
            Outcome::OriginUnreachable => "origin_unreachable",
            Outcome::OriginFailed => "origin_error",
            Outcome::ClientGone => "client_gone",
            Outcome::Aborted => "aborted",
        }
    }
}

/// Accumulates a response for caching, up to a fixed cap.
///
/// Once the cap would be exceeded the buffer is dropped and the response is
/// flagged too large; later chunks are ignored.
#[derive(Debug)]
pub struct CaptureBuffer {
    buf: Vec<u8>,
    limit: usize,
    too_large: bool,
}

impl CaptureBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            too_large: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<(), HandlerError> {
        if self.too_large {
            return Ok(());
        }
        if self.buf.len() + chunk.len() > self.limit {
            self.too_large = true;
            self.buf = Vec::new();
            return Ok(());
        }
        self.buf.try_reserve(chunk.len())?;
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_too_large(&self) -> bool {
        self.too_large
    }

    /// The captured response, if it is worth caching.
    pub fn into_bytes(self) -> Option<Bytes> {
        if self.too_large || self.buf.is_empty() {
            None
        } else {
            Some(Bytes::from(self.buf))
        }
    }
}

/// Serves one client connection against the shared cache.
#[derive(Debug, Clone)]
pub struct RequestHandler {
    cache: Arc<ResponseCache>,
    resolver: Arc<PeerResolver>,
}

impl RequestHandler {
    pub fn new(cache: Arc<ResponseCache>, resolver: Arc<PeerResolver>) -> Self {
        Self { cache, resolver }
    }

    /// Run the connection to completion.
    pub async fn handle(&self, mut stream: TcpStream, mut ctx: ConnectionContext) -> Outcome {
        let start = Instant::now();
        ctx.confirm(&stream, &self.resolver).await;

        let (read_half, mut write_half) = stream.split();
        let mut reader = BufReader::new(read_half);
        let outcome = self.serve(&mut reader, &mut write_half).await;
        let _ = write_half.shutdown().await;

        metrics::record_request(outcome.label(), start);
        tracing::debug!(peer = %ctx.peer_label(), outcome = outcome.label(), "Connection finished");
        outcome
    }

    /// Read one request from `reader` and answer it on `writer`.
    pub async fn serve<R, W>(&self, reader: &mut R, writer: &mut W) -> Outcome
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        match self.process(reader, writer).await {
            Ok(outcome) => outcome,
            Err(error) => recover(error, writer).await,
        }
    }

    async fn process<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<Outcome, HandlerError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let Some(request) = read_request(reader).await? else {
            return Ok(Outcome::Closed);
        };
        tracing::debug!(method = %request.method, uri = %request.uri, "Request parsed");

        if let Some(entry) = self.cache.lookup_and_pin(&request.uri) {
            tracing::info!(uri = %request.uri, bytes = entry.len(), "Serving from cache");
            let written = writer.write_all(entry.bytes()).await;
            self.cache.release(entry);
            written.map_err(HandlerError::ClientWrite)?;
            writer.flush().await.map_err(HandlerError::ClientWrite)?;
            return Ok(Outcome::ServedFromCache);
        }

        self.relay(&request, writer).await
    }

    async fn relay<W>(&self, request: &RequestDescriptor, writer: &mut W) -> Result<Outcome, HandlerError>
    where
        W: AsyncWrite + Unpin,
    {
        let origin = OriginConnection::forward(request).await?;
        let mut chunks = std::pin::pin!(origin.into_chunks());
        let mut capture = CaptureBuffer::new(self.cache.max_object_size());
        let mut relayed = 0usize;

        while let Some(chunk) = chunks.try_next().await? {
            writer
                .write_all(&chunk)
                .await
                .map_err(HandlerError::ClientWrite)?;
            relayed += chunk.len();
            capture.push(&chunk)?;
        }
        writer.flush().await.map_err(HandlerError::ClientWrite)?;
        // EOF goes out before populating; the insert may wait on pins.
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(error = %e, "Client write shutdown failed");
        }

        tracing::debug!(
            uri = %request.uri,
            bytes = relayed,
            too_large = capture.is_too_large(),
            "Response relayed"
        );

        let cached = match capture.into_bytes() {
            Some(bytes) => self.populate(&request.uri, bytes).await,
            None => false,
        };
        Ok(Outcome::Forwarded { cached })
    }

    async fn populate(&self, uri: &str, bytes: Bytes) -> bool {
        let len = bytes.len();
        match self.cache.insert(uri, bytes).await {
            Ok(InsertOutcome::Inserted) => {
                tracing::debug!(uri = %uri, bytes = len, "Cached response");
                true
            }
            Ok(InsertOutcome::AlreadyPresent) => false,
            Err(e) => {
                tracing::warn!(uri = %uri, error = %e, "Failed to cache response");
                false
            }
        }
    }
}

/// Turn a connection-ending error into an outcome, answering the client
/// where a page is owed.
async fn recover<W>(error: HandlerError, writer: &mut W) -> Outcome
where
    W: AsyncWrite + Unpin,
{
    match &error {
        HandlerError::Forward(ForwardError::Unreachable { host, port, .. }) => {
            tracing::error!(error = %error, "Could not connect to {}:{}", host, port);
            metrics::record_origin_error("unreachable");
            let message = format!("Could not connect to {host}:{port}");
            send_client_error(writer, ErrorPage::bad_gateway(&message)).await;
            Outcome::OriginUnreachable
        }
        HandlerError::Forward(e) => {
            tracing::error!(error = %e, "Origin failed");
            metrics::record_origin_error(e.kind());
            Outcome::OriginFailed
        }
        HandlerError::ClientWrite(e) => {
            tracing::warn!(error = %e, "Error writing to client");
            Outcome::ClientGone
        }
        HandlerError::OutOfMemory(e) => {
            tracing::error!(error = %e, "Abandoning connection");
            Outcome::Aborted
        }
        HandlerError::LineTooLong
        | HandlerError::InvalidUtf8
        | HandlerError::IncompleteHead
        | HandlerError::Read(_)
        | HandlerError::Parse(_) => {
            tracing::warn!(error = %error, "Rejecting request");
            send_client_error(
                writer,
                ErrorPage::bad_request("The proxy could not understand the request"),
            )
            .await;
            Outcome::BadRequest
        }
    }
}

/// Read the request head. `None` when the client closed without sending
/// anything.
async fn read_request<R>(reader: &mut R) -> Result<Option<RequestDescriptor>, HandlerError>
where
    R: AsyncBufRead + Unpin,
{
    let mut parser = RequestParser::new();
    let mut buf = Vec::with_capacity(256);
    let mut first = true;

    loop {
        let Some(line) = read_line(reader, &mut buf).await? else {
            if first {
                return Ok(None);
            }
            return Err(HandlerError::IncompleteHead);
        };
        if !first && line.trim_end_matches(['\r', '\n']).is_empty() {
            break;
        }
        parser.parse_line(line)?;
        first = false;
    }

    Ok(Some(parser.into_descriptor()?))
}

/// Read one `\n`-terminated line of at most `MAX_LINE` bytes.
async fn read_line<'b, R>(reader: &mut R, buf: &'b mut Vec<u8>) -> Result<Option<&'b str>, HandlerError>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let read = (&mut *reader)
        .take(MAX_LINE as u64)
        .read_until(b'\n', buf)
        .await
        .map_err(HandlerError::Read)?;

    if read == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        if read >= MAX_LINE {
            return Err(HandlerError::LineTooLong);
        }
        return Err(HandlerError::IncompleteHead);
    }

    let bytes: &'b [u8] = buf;
    std::str::from_utf8(bytes)
        .map(Some)
        .map_err(|_| HandlerError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use tokio::net::TcpListener;

    fn handler() -> RequestHandler {
        handler_with(CacheConfig::default())
    }

    fn handler_with(config: CacheConfig) -> RequestHandler {
        RequestHandler::new(
            Arc::new(ResponseCache::new(&config)),
            Arc::new(PeerResolver::disabled()),
        )
    }

    /// One-shot origin: reads a request head, answers with `response`.
    async fn spawn_origin(response: Vec<u8>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut socket = BufReader::new(socket);
            let mut line = String::new();
            loop {
                line.clear();
                socket.read_line(&mut line).await.unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            socket.get_mut().write_all(&response).await.unwrap();
        });
        port
    }

    async fn serve_bytes(handler: &RequestHandler, request: &[u8]) -> (Outcome, Vec<u8>) {
        let mut reader = BufReader::new(request);
        let mut out = Vec::new();
        let outcome = handler.serve(&mut reader, &mut out).await;
        (outcome, out)
    }

    #[test]
    fn capture_keeps_response_within_limit() {
        let mut capture = CaptureBuffer::new(10);
        capture.push(b"hello").unwrap();
        capture.push(b"world").unwrap();
        assert_eq!(capture.len(), 10);
        assert_eq!(capture.into_bytes().unwrap(), Bytes::from_static(b"helloworld"));
    }

    #[test]
    fn capture_abandons_past_limit() {
        let mut capture = CaptureBuffer::new(10);
        capture.push(b"hello").unwrap();
        capture.push(b"world!").unwrap();
        assert!(capture.is_too_large());
        assert!(capture.is_empty());

        capture.push(b"x").unwrap();
        assert!(capture.is_empty());
        assert!(capture.into_bytes().is_none());
    }

    #[test]
    fn empty_capture_is_not_cacheable() {
        assert!(CaptureBuffer::new(10).into_bytes().is_none());
    }

    #[tokio::test]
    async fn serves_cached_bytes() {
        let handler = handler();
        let body = Bytes::from_static(b"HTTP/1.0 200 OK\r\n\r\ncached body");
        handler
            .cache
            .insert("http://origin.test/a.html", body.clone())
            .await
            .unwrap();

        let (outcome, out) =
            serve_bytes(&handler, b"GET http://origin.test/a.html HTTP/1.1\r\n\r\n").await;

        assert_eq!(outcome, Outcome::ServedFromCache);
        assert_eq!(out, body.to_vec());
        assert_eq!(handler.cache.stats().pinned_entries, 0);
    }

    #[tokio::test]
    async fn missing_version_gets_bad_request() {
        let (outcome, out) = serve_bytes(&handler(), b"GET http://origin.test/\r\n\r\n").await;
        assert_eq!(outcome, Outcome::BadRequest);
        assert!(out.starts_with(b"HTTP/1.0 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn silent_close_before_request_line() {
        let (outcome, out) = serve_bytes(&handler(), b"").await;
        assert_eq!(outcome, Outcome::Closed);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn truncated_head_is_bad_request() {
        let (outcome, out) =
            serve_bytes(&handler(), b"GET http://origin.test/ HTTP/1.0\r\nAccept: */*\r\n").await;
        assert_eq!(outcome, Outcome::BadRequest);
        assert!(out.starts_with(b"HTTP/1.0 400"));
    }

    #[tokio::test]
    async fn overlong_line_is_bad_request() {
        let mut request = b"GET http://origin.test/".to_vec();
        request.extend(std::iter::repeat(b'a').take(MAX_LINE));
        request.extend_from_slice(b" HTTP/1.0\r\n\r\n");

        let (outcome, out) = serve_bytes(&handler(), &request).await;
        assert_eq!(outcome, Outcome::BadRequest);
        assert!(out.starts_with(b"HTTP/1.0 400"));
    }

    #[tokio::test]
    async fn invalid_utf8_is_bad_request() {
        let (outcome, _) = serve_bytes(&handler(), b"GET http://o/\xff HTTP/1.0\r\n\r\n").await;
        assert_eq!(outcome, Outcome::BadRequest);
    }

    #[tokio::test]
    async fn unreachable_origin_gets_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let request = format!("GET http://127.0.0.1:{port}/ HTTP/1.0\r\n\r\n");
        let (outcome, out) = serve_bytes(&handler(), request.as_bytes()).await;

        assert_eq!(outcome, Outcome::OriginUnreachable);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.0 502 Bad Gateway\r\n"));
        assert!(text.contains(&format!("Could not connect to 127.0.0.1:{port}")));
    }

    #[tokio::test]
    async fn forwards_and_caches_small_response() {
        let response = b"HTTP/1.0 200 OK\r\nContent-Length: 5\r\n\r\nhello".to_vec();
        let port = spawn_origin(response.clone()).await;

        let handler = handler();
        let uri = format!("http://127.0.0.1:{port}/small");
        let request = format!("GET {uri} HTTP/1.1\r\nAccept: */*\r\n\r\n");
        let (outcome, out) = serve_bytes(&handler, request.as_bytes()).await;

        assert_eq!(outcome, Outcome::Forwarded { cached: true });
        assert_eq!(out, response);
        assert_eq!(handler.cache.size_of(&uri), Some(response.len()));
    }

    #[tokio::test]
    async fn client_sees_eof_while_insert_waits_on_pins() {
        let handler = handler_with(CacheConfig {
            max_cache_size: 100,
            max_object_size: 100,
        });
        let cache = Arc::clone(&handler.cache);
        cache
            .insert("http://origin.test/pinned", Bytes::from(vec![b'p'; 100]))
            .await
            .unwrap();
        let pin = cache.lookup_and_pin("http://origin.test/pinned").unwrap();

        let response = b"HTTP/1.0 200 OK\r\n\r\nno length, read to EOF".to_vec();
        let port = spawn_origin(response.clone()).await;
        let uri = format!("http://127.0.0.1:{port}/late");
        let request = format!("GET {uri} HTTP/1.0\r\n\r\n").into_bytes();

        let (mut client, mut proxy_side) = tokio::io::duplex(4096);
        let task = {
            let handler = handler.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(std::io::Cursor::new(request));
                handler.serve(&mut reader, &mut proxy_side).await
            })
        };

        let mut received = Vec::new();
        tokio::time::timeout(std::time::Duration::from_secs(5), client.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, response);
        assert!(!task.is_finished());
        assert!(!cache.contains(&uri));

        drop(pin);
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, Outcome::Forwarded { cached: true });
        assert!(cache.contains(&uri));
        assert!(!cache.contains("http://origin.test/pinned"));
    }
}
