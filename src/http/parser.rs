//! Request-line and header parser.
//!
//! # Responsibilities
//! - Classify and absorb one request-head line at a time
//! - Extract method, target host/port/path and the cache key from the
//!   request line
//! - Keep header lines in their original order
//!
//! # Design Decisions
//! - The first line absorbed is always the request line
//! - Absolute-form targets are parsed with `url`; origin-form targets take
//!   their authority from the `Host` header once the head is complete
//! - Header name lookup is case-insensitive

use thiserror::Error;
use url::Url;

/// Longest request-head line accepted, terminator included.
pub const MAX_LINE: usize = 8192;

const DEFAULT_PORT: u16 = 80;

/// Classification of a successfully absorbed line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// The line was the request line.
    Request,
    /// The line was a header.
    Header,
}

/// A request-head line could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),

    #[error("unsupported HTTP version {0:?}")]
    UnsupportedVersion(String),

    #[error("unsupported scheme in {0:?}")]
    UnsupportedScheme(String),

    #[error("invalid request target {0:?}")]
    InvalidTarget(String),

    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    #[error("request has no Host header and no absolute target")]
    MissingHost,

    #[error("no request line parsed")]
    NoRequestLine,
}

/// Fields available through [`RequestParser::retrieve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestField {
    Method,
    Host,
    Port,
    Path,
    Uri,
    Version,
}

/// A single `Name: value` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Case-insensitive name comparison.
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

#[derive(Debug, Clone)]
struct RequestLine {
    method: String,
    /// Authority from an absolute-form target.
    authority: Option<(String, u16)>,
    path: String,
    target: String,
    version: String,
}

/// Fully parsed request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub method: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Cache key for this request.
    pub uri: String,
    pub version: String,
    pub headers: Vec<Header>,
}

impl RequestDescriptor {
    /// First header with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&Header> {
        self.headers.iter().find(|h| h.is(name))
    }
}

/// Incremental parser for one request head.
#[derive(Debug, Default)]
pub struct RequestParser {
    request: Option<RequestLine>,
    port_text: Option<String>,
    headers: Vec<Header>,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb one line. Trailing `\r\n` or `\n` is ignored.
    pub fn parse_line(&mut self, line: &str) -> Result<ParseState, ParseError> {
        let line = trim_line_ending(line);
        if self.request.is_none() {
            let request = parse_request_line(line)?;
            self.port_text = request.authority.as_ref().map(|(_, port)| port.to_string());
            self.request = Some(request);
            Ok(ParseState::Request)
        } else {
            self.headers.push(parse_header(line)?);
            Ok(ParseState::Header)
        }
    }

    /// Value of a request-line field.
    ///
    /// `Host` and `Port` are only known here for absolute-form targets.
    pub fn retrieve(&self, field: RequestField) -> Option<&str> {
        let request = self.request.as_ref()?;
        match field {
            RequestField::Method => Some(&request.method),
            RequestField::Host => request.authority.as_ref().map(|(host, _)| host.as_str()),
            RequestField::Port => self.port_text.as_deref(),
            RequestField::Path => Some(&request.path),
            RequestField::Uri => Some(&request.target),
            RequestField::Version => Some(&request.version),
        }
    }

    /// First header with the given name, compared case-insensitively.
    pub fn lookup_header(&self, name: &str) -> Option<&Header> {
        self.headers.iter().find(|h| h.is(name))
    }

    /// Headers in the order they were received.
    pub fn headers(&self) -> impl Iterator<Item = &Header> {
        self.headers.iter()
    }

    /// Finish parsing and resolve the target authority.
    pub fn into_descriptor(self) -> Result<RequestDescriptor, ParseError> {
        let request = self.request.ok_or(ParseError::NoRequestLine)?;
        let (host, port, uri) = match request.authority {
            Some((host, port)) => (host, port, request.target),
            None => {
                let host_header = self
                    .headers
                    .iter()
                    .find(|h| h.is("Host"))
                    .ok_or(ParseError::MissingHost)?;
                let (host, port) = parse_authority(&host_header.value)
                    .ok_or_else(|| ParseError::InvalidTarget(host_header.value.clone()))?;
                let uri = format!("http://{}{}", host_header.value, request.path);
                (host, port, uri)
            }
        };

        Ok(RequestDescriptor {
            method: request.method,
            host,
            port,
            path: request.path,
            uri,
            version: request.version,
            headers: self.headers,
        })
    }
}

fn trim_line_ending(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

fn parse_request_line(line: &str) -> Result<RequestLine, ParseError> {
    let mut tokens = line.split_whitespace();
    let (Some(method), Some(target), Some(version), None) =
        (tokens.next(), tokens.next(), tokens.next(), tokens.next())
    else {
        return Err(ParseError::MalformedRequestLine(line.to_string()));
    };

    if !method.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(ParseError::MalformedRequestLine(line.to_string()));
    }
    if version != "HTTP/1.0" && version != "HTTP/1.1" {
        return Err(ParseError::UnsupportedVersion(version.to_string()));
    }

    let (authority, path) = parse_target(target)?;
    Ok(RequestLine {
        method: method.to_string(),
        authority,
        path,
        target: target.to_string(),
        version: version.to_string(),
    })
}

type Authority = Option<(String, u16)>;

fn parse_target(target: &str) -> Result<(Authority, String), ParseError> {
    if target.starts_with('/') {
        return Ok((None, target.to_string()));
    }

    let scheme_end = target
        .find("://")
        .ok_or_else(|| ParseError::InvalidTarget(target.to_string()))?;
    if !target[..scheme_end].eq_ignore_ascii_case("http") {
        return Err(ParseError::UnsupportedScheme(target.to_string()));
    }

    let url = Url::parse(target).map_err(|_| ParseError::InvalidTarget(target.to_string()))?;
    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| ParseError::InvalidTarget(target.to_string()))?;
    let port = url.port_or_known_default().unwrap_or(DEFAULT_PORT);

    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }

    Ok((Some((host.to_string(), port)), path))
}

/// Split a `Host` header value into host and port.
fn parse_authority(value: &str) -> Option<(String, u16)> {
    let url = Url::parse(&format!("http://{}/", value.trim())).ok()?;
    let host = url.host_str()?.to_string();
    Some((host, url.port_or_known_default().unwrap_or(DEFAULT_PORT)))
}

fn parse_header(line: &str) -> Result<Header, ParseError> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| ParseError::MalformedHeader(line.to_string()))?;
    if name.is_empty() || name.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(ParseError::MalformedHeader(line.to_string()));
    }
    Ok(Header::new(name, value.trim()))
}
