//! Origin forwarding.
//!
//! # Responsibilities
//! - Connect to the origin named by the request target
//! - Rewrite the client's request head as an HTTP/1.0 request
//! - Expose the origin's response as a stream of byte chunks
//!
//! # Design Decisions
//! - `Host` is passed through when the client sent one, synthesized otherwise
//! - `User-Agent`, `Connection` and `Proxy-Connection` are always replaced
//! - Replaced headers are recognised by exact, case-sensitive name; other
//!   spellings (`connection`, `HOST`) pass through untouched
//! - The response is never interpreted or buffered here; the handler decides
//!   what to keep

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, Stream};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::http::parser::RequestDescriptor;

/// User agent sent to every origin.
pub const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:3.10.0) Gecko/20230411 Firefox/63.0.1";

/// Read size used when relaying origin responses.
pub const CHUNK_SIZE: usize = 8192;

/// Headers the proxy always writes itself.
const REPLACED_HEADERS: [&str; 4] = ["Host", "User-Agent", "Connection", "Proxy-Connection"];

/// Errors talking to an origin server.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The origin could not be reached.
    #[error("could not connect to {host}:{port}: {source}")]
    Unreachable {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Sending the rewritten request failed.
    #[error("failed to send request to origin: {0}")]
    Write(#[source] std::io::Error),

    /// Reading the response failed.
    #[error("failed to read origin response: {0}")]
    Read(#[source] std::io::Error),
}

impl ForwardError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ForwardError::Unreachable { .. } => "unreachable",
            ForwardError::Write(_) => "write",
            ForwardError::Read(_) => "read",
        }
    }
}

/// Build the request head sent to the origin.
pub fn rewrite_request(request: &RequestDescriptor) -> String {
    let mut head = format!("{} {} HTTP/1.0\r\n", request.method, request.path);

    match request.headers.iter().find(|h| h.name == "Host") {
        Some(host) => head.push_str(&format!("Host: {}\r\n", host.value)),
        None => head.push_str(&format!("Host: {}:{}\r\n", request.host, request.port)),
    }
    head.push_str(&format!("User-Agent: {USER_AGENT}\r\n"));
    head.push_str("Connection: close\r\n");
    head.push_str("Proxy-Connection: close\r\n");

    for header in &request.headers {
        if REPLACED_HEADERS.contains(&header.name.as_str()) {
            continue;
        }
        head.push_str(&format!("{}: {}\r\n", header.name, header.value));
    }
    head.push_str("\r\n");
    head
}

/// An open connection to an origin server.
#[derive(Debug)]
pub struct OriginConnection {
    stream: TcpStream,
}

impl OriginConnection {
    /// Connect to `host:port`.
    pub async fn connect(host: &str, port: u16) -> Result<Self, ForwardError> {
        // `url` keeps IPv6 literals bracketed; the resolver wants them bare.
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        let stream = TcpStream::connect((bare, port))
            .await
            .map_err(|source| ForwardError::Unreachable {
                host: host.to_string(),
                port,
                source,
            })?;
        tracing::debug!(host = %host, port, "Connected to origin");
        Ok(Self { stream })
    }

    /// Connect to the request's origin and send the rewritten request.
    pub async fn forward(request: &RequestDescriptor) -> Result<Self, ForwardError> {
        let mut origin = Self::connect(&request.host, request.port).await?;
        origin.send_request(request).await?;
        Ok(origin)
    }

    /// Write the rewritten request head.
    pub async fn send_request(&mut self, request: &RequestDescriptor) -> Result<(), ForwardError> {
        let head = rewrite_request(request);
        self.stream
            .write_all(head.as_bytes())
            .await
            .map_err(ForwardError::Write)?;
        self.stream.flush().await.map_err(ForwardError::Write)
    }

    /// Read the next chunk of the response; `None` once the origin closes.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, ForwardError> {
        let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
        let read = self
            .stream
            .read_buf(&mut buf)
            .await
            .map_err(ForwardError::Read)?;
        if read == 0 {
            Ok(None)
        } else {
            Ok(Some(buf.freeze()))
        }
    }

    /// The rest of the response as a stream of chunks. The connection closes
    /// when the stream is dropped.
    pub fn into_chunks(self) -> impl Stream<Item = Result<Bytes, ForwardError>> {
        stream::try_unfold(self, |mut origin| async move {
            Ok(origin.next_chunk().await?.map(|chunk| (chunk, origin)))
        })
    }
}
