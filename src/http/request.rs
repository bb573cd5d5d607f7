//! Request head parsing and classification.
//!
//! # Responsibilities
//! - Read the request line and headers up to the blank line
//! - Enforce the head size limit while reading
//! - Classify the request as a CONNECT tunnel or a forward request
//! - Work out the origin a forward request is addressed to
//!
//! # Design Decisions
//! - Only HTTP/1.0 and HTTP/1.1 are accepted
//! - Request line tokens are split on single spaces; anything else is malformed
//! - The body is left unread in the caller's buffered reader

use std::fmt;
use std::io;

use http::uri::{self, PathAndQuery, Scheme, Uri};
use thiserror::Error;
use tokio::io::AsyncBufRead;

use crate::http::body::BodyFraming;
use crate::http::headers::Headers;
use crate::http::response::Status;
use crate::net::dialer::format_authority;
use crate::security::limits::{read_bounded_line, trim_line_ending, LineRead};

/// Why a request head could not be turned into a [`ParsedRequest`].
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("client closed the connection before completing the request head")]
    ClientClosed,
    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),
    #[error("unsupported protocol version {0:?}")]
    UnsupportedVersion(String),
    #[error("request head exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },
    #[error("invalid message framing: {0}")]
    InvalidFraming(String),
    #[error("failed reading request head: {0}")]
    Io(#[from] io::Error),
}

impl ParseError {
    pub fn kind(&self) -> &'static str {
        match self {
            ParseError::ClientClosed => "client-closed-before-headers",
            ParseError::MalformedRequestLine(_) => "malformed-request-line",
            ParseError::MalformedHeader(_) => "malformed-header",
            ParseError::UnsupportedVersion(_) => "unsupported-protocol-version",
            ParseError::HeaderTooLarge { .. } => "header-too-large",
            ParseError::InvalidFraming(_) => "invalid-framing",
            ParseError::Io(_) => "client-read-error",
        }
    }

    /// Status to send back, or `None` when the client is already gone.
    pub fn status(&self) -> Option<Status> {
        match self {
            ParseError::ClientClosed | ParseError::Io(_) => None,
            ParseError::HeaderTooLarge { .. } => Some(Status::RequestHeaderFieldsTooLarge),
            ParseError::UnsupportedVersion(_) => Some(Status::HttpVersionNotSupported),
            ParseError::MalformedRequestLine(_)
            | ParseError::MalformedHeader(_)
            | ParseError::InvalidFraming(_) => Some(Status::BadRequest),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }

    fn parse(token: &str) -> Result<Self, ParseError> {
        match token {
            "HTTP/1.1" => return Ok(Version::Http11),
            "HTTP/1.0" => return Ok(Version::Http10),
            _ => {}
        }
        let well_formed = token
            .strip_prefix("HTTP/")
            .and_then(|v| v.split_once('.'))
            .is_some_and(|(major, minor)| {
                !major.is_empty()
                    && !minor.is_empty()
                    && major.bytes().all(|b| b.is_ascii_digit())
                    && minor.bytes().all(|b| b.is_ascii_digit())
            });
        if well_formed {
            Err(ParseError::UnsupportedVersion(token.to_string()))
        } else {
            Err(ParseError::MalformedRequestLine(format!("bad version {token:?}")))
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `host[:port]` as written in a request target or `Host` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    /// Host without IPv6 brackets.
    pub host: String,
    pub port: Option<u16>,
}

impl Authority {
    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`.
    pub fn parse(input: &str) -> Option<Self> {
        let authority: uri::Authority = input.parse().ok()?;
        Self::from_uri(&authority)
    }

    /// Convert a URI authority, rejecting userinfo and unusable ports.
    pub fn from_uri(authority: &uri::Authority) -> Option<Self> {
        let raw = authority.as_str();
        if raw.contains('@') {
            return None;
        }
        let port = authority.port_u16();
        // Anything after the host that is not a valid port (`host:`, `host:99999`).
        if port.is_none() && authority.host().len() != raw.len() {
            return None;
        }
        let host = authority.host().trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }
        Some(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn port_or(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => f.write_str(&format_authority(&self.host, port)),
            None if self.host.contains(':') => write!(f, "[{}]", self.host),
            None => f.write_str(&self.host),
        }
    }
}

/// The request-target forms a proxy may receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestTarget {
    /// `/path?query`
    Origin(PathAndQuery),
    /// `scheme://authority/path?query`
    Absolute(Uri),
    /// `host:port`, only for CONNECT.
    Authority(Authority),
    /// `*`
    Asterisk,
}

impl RequestTarget {
    fn parse(method: &str, raw: &str) -> Result<Self, ParseError> {
        let malformed = || ParseError::MalformedRequestLine(format!("bad request target {raw:?}"));

        if method == "CONNECT" {
            return Authority::parse(raw).map(RequestTarget::Authority).ok_or_else(malformed);
        }
        if raw == "*" {
            return Ok(RequestTarget::Asterisk);
        }

        let uri: Uri = raw.parse().map_err(|_| malformed())?;
        match (uri.scheme(), uri.authority()) {
            (Some(_), Some(_)) => Ok(RequestTarget::Absolute(uri)),
            (None, None) if raw.starts_with('/') => uri
                .path_and_query()
                .cloned()
                .map(RequestTarget::Origin)
                .ok_or_else(malformed),
            _ => Err(malformed()),
        }
    }
}

/// Where a forward request should be sent and what to send as its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub host: String,
    pub port: u16,
    /// Value for the outbound `Host` header.
    pub host_header: String,
    pub path_and_query: String,
}

/// The first request read from a client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: String,
    pub target: RequestTarget,
    pub version: Version,
    pub headers: Headers,
}

impl ParsedRequest {
    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }

    pub fn is_head(&self) -> bool {
        self.method == "HEAD"
    }

    /// Resolve the origin a forward request addresses.
    ///
    /// An absolute-form target wins over the `Host` header. Only `http`
    /// targets can be forwarded.
    pub fn origin(&self) -> Option<Origin> {
        let (authority, path_and_query) = match &self.target {
            RequestTarget::Absolute(uri) => {
                if uri.scheme() != Some(&Scheme::HTTP) {
                    return None;
                }
                let path = uri.path_and_query().map_or("/", PathAndQuery::as_str);
                let path = if path.starts_with('/') {
                    path.to_string()
                } else {
                    format!("/{path}")
                };
                (Authority::from_uri(uri.authority()?)?, path)
            }
            RequestTarget::Origin(path) => {
                let host = self.headers.get("host")?;
                (Authority::parse(host.trim())?, path.as_str().to_string())
            }
            RequestTarget::Asterisk => {
                let host = self.headers.get("host")?;
                (Authority::parse(host.trim())?, "*".to_string())
            }
            RequestTarget::Authority(_) => return None,
        };

        Some(Origin {
            host: authority.host.clone(),
            port: authority.port_or(80),
            host_header: authority.to_string(),
            path_and_query,
        })
    }

    /// How the request body is delimited.
    pub fn body_framing(&self) -> Result<BodyFraming, ParseError> {
        if self.headers.contains("transfer-encoding") {
            let last = self.headers.list_values("transfer-encoding").last();
            return match last {
                Some(coding) if coding.eq_ignore_ascii_case("chunked") => Ok(BodyFraming::Chunked),
                _ => Err(ParseError::InvalidFraming(
                    "request transfer-encoding must end with chunked".into(),
                )),
            };
        }

        match content_length(&self.headers)? {
            Some(0) | None => Ok(BodyFraming::Empty),
            Some(n) => Ok(BodyFraming::Length(n)),
        }
    }
}

/// Parse every `Content-Length` value; they must agree.
pub fn content_length(headers: &Headers) -> Result<Option<u64>, ParseError> {
    let mut length = None;
    for value in headers.list_values("content-length") {
        let parsed = value
            .parse::<u64>()
            .map_err(|_| ParseError::InvalidFraming(format!("bad content-length {value:?}")))?;
        match length {
            Some(existing) if existing != parsed => {
                return Err(ParseError::InvalidFraming("conflicting content-length values".into()))
            }
            _ => length = Some(parsed),
        }
    }
    Ok(length)
}

/// Read one request head from `reader`, leaving any body bytes unread.
pub async fn read_request<R>(reader: &mut R, max_header_bytes: usize) -> Result<ParsedRequest, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let mut remaining = max_header_bytes;
    let mut line = Vec::new();

    let request_line = match read_head_line(reader, &mut line, &mut remaining, max_header_bytes).await? {
        Some(line) => line,
        None => return Err(ParseError::ClientClosed),
    };
    let (method, raw_target, version) = parse_request_line(&request_line)?;

    let mut headers = Headers::new();
    loop {
        let Some(raw) = read_head_line(reader, &mut line, &mut remaining, max_header_bytes).await? else {
            return Err(ParseError::ClientClosed);
        };
        if raw.is_empty() {
            break;
        }
        let (name, value) = parse_header_line(&raw)?;
        headers.push(name, value);
    }

    let target = RequestTarget::parse(&method, &raw_target)?;
    Ok(ParsedRequest {
        method,
        target,
        version,
        headers,
    })
}

/// Read one line of the head, returning it without its line ending.
async fn read_head_line<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
    remaining: &mut usize,
    limit: usize,
) -> Result<Option<String>, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    match read_bounded_line(reader, line, *remaining).await? {
        LineRead::Complete => {}
        LineRead::Eof | LineRead::Truncated => return Ok(None),
        LineRead::TooLong => return Err(ParseError::HeaderTooLarge { limit }),
    }
    *remaining -= line.len();

    let text = std::str::from_utf8(trim_line_ending(line))
        .map_err(|_| ParseError::MalformedHeader("non UTF-8 bytes in request head".into()))?;
    Ok(Some(text.to_string()))
}

fn parse_request_line(line: &str) -> Result<(String, String, Version), ParseError> {
    let malformed = || ParseError::MalformedRequestLine(line.to_string());

    let mut parts = line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed());
    };
    if method.is_empty() || target.is_empty() || !method.bytes().all(is_token_byte) {
        return Err(malformed());
    }
    let version = Version::parse(version)?;

    Ok((method.to_string(), target.to_string(), version))
}

fn parse_header_line(line: &str) -> Result<(String, String), ParseError> {
    let malformed = || ParseError::MalformedHeader(line.to_string());

    // obs-fold continuation lines are rejected outright.
    if line.starts_with([' ', '\t']) {
        return Err(malformed());
    }
    let (name, value) = line.split_once(':').ok_or_else(malformed)?;
    if name.is_empty() || !name.bytes().all(is_token_byte) {
        return Err(malformed());
    }
    Ok((name.to_string(), value.trim_matches([' ', '\t']).to_string()))
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
