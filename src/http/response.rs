//! Synthesized error responses.
//!
//! # Responsibilities
//! - Render the HTML error page for a status code and messages
//! - Refuse pages that would not fit the bounded response buffers
//! - Deliver the page to the client, logging delivery failures
//!
//! # Design Decisions
//! - `Content-Length` always matches the body byte count exactly
//! - Oversized pages are abandoned, never truncated

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Bound on the rendered header block.
pub const MAX_HEADER_LEN: usize = 8192;

/// Bound on the rendered HTML body.
pub const MAX_BODY_LEN: usize = 8192;

/// An error page could not be produced or delivered.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("error page body of {0} bytes exceeds the response buffer")]
    BodyTooLarge(usize),

    #[error("error page header of {0} bytes exceeds the response buffer")]
    HeaderTooLarge(usize),

    #[error("failed to write error page: {0}")]
    Write(#[from] std::io::Error),
}

/// An HTML error page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorPage<'a> {
    pub status: u16,
    pub short_message: &'a str,
    pub long_message: &'a str,
}

impl<'a> ErrorPage<'a> {
    pub fn new(status: u16, short_message: &'a str, long_message: &'a str) -> Self {
        Self {
            status,
            short_message,
            long_message,
        }
    }

    pub fn bad_request(long_message: &'a str) -> Self {
        Self::new(400, "Bad Request", long_message)
    }

    pub fn bad_gateway(long_message: &'a str) -> Self {
        Self::new(502, "Bad Gateway", long_message)
    }

    /// Render the full response: status line, headers, blank line, body.
    pub fn render(&self) -> Result<Bytes, ResponseError> {
        let body = format!(
            "<!DOCTYPE html>\r\n\
             <html>\r\n\
             <head><title>Proxy Error</title></head>\r\n\
             <body bgcolor=\"ffffff\">\r\n\
             <h1>{}: {}</h1>\r\n\
             <p>{}</p>\r\n\
             <hr /><em>The caching web proxy</em>\r\n\
             </body></html>\r\n",
            self.status, self.short_message, self.long_message
        );
        if body.len() >= MAX_BODY_LEN {
            return Err(ResponseError::BodyTooLarge(body.len()));
        }

        let header = format!(
            "HTTP/1.0 {} {}\r\n\
             Content-Type: text/html\r\n\
             Content-Length: {}\r\n\r\n",
            self.status,
            self.short_message,
            body.len()
        );
        if header.len() >= MAX_HEADER_LEN {
            return Err(ResponseError::HeaderTooLarge(header.len()));
        }

        let mut out = BytesMut::with_capacity(header.len() + body.len());
        out.put_slice(header.as_bytes());
        out.put_slice(body.as_bytes());
        Ok(out.freeze())
    }

    /// Render and write the page.
    pub async fn send<W>(&self, writer: &mut W) -> Result<(), ResponseError>
    where
        W: AsyncWrite + Unpin,
    {
        let response = self.render()?;
        writer.write_all(&response).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Best-effort delivery of an error page; failures are only logged.
pub async fn send_client_error<W>(writer: &mut W, page: ErrorPage<'_>)
where
    W: AsyncWrite + Unpin,
{
    match page.send(writer).await {
        Ok(()) => tracing::debug!(status = page.status, "Sent error page"),
        Err(ResponseError::Write(e)) => {
            tracing::warn!(status = page.status, error = %e, "Error writing error response to client");
        }
        Err(e) => {
            tracing::error!(status = page.status, error = %e, "Abandoned error response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(rendered: &[u8]) -> (String, String) {
        let text = String::from_utf8(rendered.to_vec()).unwrap();
        let (head, body) = text.split_once("\r\n\r\n").unwrap();
        (head.to_string(), body.to_string())
    }

    #[test]
    fn content_length_matches_body() {
        let rendered = ErrorPage::bad_request("The proxy received a malformed request")
            .render()
            .unwrap();
        let (head, body) = split(&rendered);

        assert!(head.starts_with("HTTP/1.0 400 Bad Request\r\n"));
        assert!(head.contains("Content-Type: text/html"));
        assert!(head.contains(&format!("Content-Length: {}", body.len())));
        assert!(body.contains("<h1>400: Bad Request</h1>"));
        assert!(body.contains("<p>The proxy received a malformed request</p>"));
    }

    #[test]
    fn oversized_page_is_abandoned() {
        let long = "x".repeat(MAX_BODY_LEN);
        let err = ErrorPage::bad_gateway(&long).render().unwrap_err();
        assert!(matches!(err, ResponseError::BodyTooLarge(_)));

        let short = "y".repeat(MAX_HEADER_LEN);
        let err = ErrorPage::new(500, &short, "").render().unwrap_err();
        assert!(matches!(
            err,
            ResponseError::BodyTooLarge(_) | ResponseError::HeaderTooLarge(_)
        ));
    }

    #[tokio::test]
    async fn send_writes_whole_page() {
        let page = ErrorPage::bad_gateway("Could not connect to origin.test:80");
        let mut out = Vec::new();
        page.send(&mut out).await.unwrap();
        assert_eq!(out, page.render().unwrap().to_vec());
    }

    #[tokio::test]
    async fn send_client_error_swallows_oversized_page() {
        let long = "z".repeat(MAX_BODY_LEN * 2);
        let mut out = Vec::new();
        send_client_error(&mut out, ErrorPage::bad_request(&long)).await;
        assert!(out.is_empty());
    }
}
