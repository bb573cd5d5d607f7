//! Response heads: canned proxy statuses and upstream head parsing.
//!
//! # Responsibilities
//! - Build the fixed error responses the proxy emits itself
//! - Read and parse an origin's status line and headers
//! - Work out how the origin delimits its response body

use std::io;

use thiserror::Error;
use tokio::io::AsyncBufRead;

use crate::http::body::BodyFraming;
use crate::http::headers::{Header, Headers};
use crate::http::request::content_length;
use crate::security::limits::{read_bounded_line, trim_line_ending, LineRead};

/// Written verbatim once a CONNECT tunnel is up.
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Upper bound on headers in an upstream response head.
const MAX_RESPONSE_HEADERS: usize = 128;

/// Statuses the proxy itself generates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    BadRequest,
    RequestHeaderFieldsTooLarge,
    BadGateway,
    GatewayTimeout,
    HttpVersionNotSupported,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::BadRequest => 400,
            Status::RequestHeaderFieldsTooLarge => 431,
            Status::BadGateway => 502,
            Status::GatewayTimeout => 504,
            Status::HttpVersionNotSupported => 505,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::BadRequest => "Bad Request",
            Status::RequestHeaderFieldsTooLarge => "Request Header Fields Too Large",
            Status::BadGateway => "Bad Gateway",
            Status::GatewayTimeout => "Gateway Timeout",
            Status::HttpVersionNotSupported => "HTTP Version Not Supported",
        }
    }

    /// Full response with an empty body.
    pub fn to_bytes(self) -> Vec<u8> {
        format!(
            "HTTP/1.1 {} {}\r\nContent-Length: 0\r\n\r\n",
            self.code(),
            self.reason()
        )
        .into_bytes()
    }
}

/// Why an upstream response head could not be read.
#[derive(Debug, Error)]
pub enum HeadError {
    #[error("upstream closed before sending a complete response head")]
    Closed,
    #[error("upstream response head exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("malformed upstream response head: {0}")]
    Malformed(String),
    #[error("failed reading upstream response head: {0}")]
    Io(#[from] io::Error),
}

/// An origin's status line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub code: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    /// 1xx responses other than `101 Switching Protocols` precede the final one.
    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.code) && self.code != 101
    }

    /// Status line as this proxy emits it.
    pub fn status_line(&self) -> String {
        format!("HTTP/1.1 {} {}\r\n", self.code, self.reason)
    }

    /// Body delimitation, following RFC 7230 section 3.3.3.
    pub fn framing(&self, request_was_head: bool) -> Result<BodyFraming, HeadError> {
        if request_was_head || (100..200).contains(&self.code) || self.code == 204 || self.code == 304 {
            return Ok(BodyFraming::Empty);
        }
        if self.headers.contains("transfer-encoding") {
            let chunked = self
                .headers
                .list_values("transfer-encoding")
                .last()
                .is_some_and(|coding| coding.eq_ignore_ascii_case("chunked"));
            return Ok(if chunked { BodyFraming::Chunked } else { BodyFraming::Close });
        }
        match content_length(&self.headers).map_err(|e| HeadError::Malformed(e.to_string()))? {
            Some(0) => Ok(BodyFraming::Empty),
            Some(n) => Ok(BodyFraming::Length(n)),
            None => Ok(BodyFraming::Close),
        }
    }
}

/// Read a response head from `reader`, stopping after the blank line.
pub async fn read_response_head<R>(reader: &mut R, max_bytes: usize) -> Result<ResponseHead, HeadError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let mut remaining = max_bytes;

    loop {
        let start = buf.len();
        match read_bounded_line(reader, &mut buf, remaining).await? {
            LineRead::Complete => {}
            LineRead::Eof | LineRead::Truncated => return Err(HeadError::Closed),
            LineRead::TooLong => return Err(HeadError::TooLarge { limit: max_bytes }),
        }
        remaining -= buf.len() - start;

        if trim_line_ending(&buf[start..]).is_empty() {
            if start == 0 {
                // Stray blank line ahead of the status line.
                buf.clear();
                continue;
            }
            break;
        }
    }

    let mut slots = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
    let mut response = httparse::Response::new(&mut slots);
    match response.parse(&buf) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(HeadError::Malformed("incomplete head".into())),
        Err(e) => return Err(HeadError::Malformed(e.to_string())),
    }

    let code = response
        .code
        .ok_or_else(|| HeadError::Malformed("missing status code".into()))?;
    let reason = response.reason.unwrap_or_default().to_string();
    let headers = response
        .headers
        .iter()
        .map(|h| Header::new(h.name, String::from_utf8_lossy(h.value)))
        .collect();

    Ok(ResponseHead {
        code,
        reason,
        headers,
    })
}
