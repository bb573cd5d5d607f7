//! Per-connection error taxonomy.
//!
//! Every failure that ends a connection is a [`ProxyError`]. Each carries
//! a stable kind tag for logs and metrics and, where the client can still
//! be told, the status to answer with.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::http::body::BodyError;
use crate::http::request::ParseError;
use crate::http::response::{HeadError, Status};
use crate::net::dialer::DialError;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("request target has no usable origin: {0}")]
    BadTarget(String),

    #[error("client sent no request head within {0:?}")]
    HeaderTimeout(Duration),

    #[error("upstream did not respond within {0:?}")]
    UpstreamTimeout(Duration),

    #[error("invalid upstream response: {0}")]
    UpstreamProtocol(String),

    #[error("upstream I/O error: {0}")]
    UpstreamIo(#[source] io::Error),

    #[error("client read error: {0}")]
    ClientRead(#[source] io::Error),

    #[error("client write error: {0}")]
    ClientWrite(#[source] io::Error),

    #[error("tunnel copy error: {0}")]
    TunnelCopy(#[source] io::Error),

    #[error("tunnel idle for {0:?}")]
    TunnelIdle(Duration),
}

impl ProxyError {
    /// Stable tag used in logs and the `proxy_errors_total` metric.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Parse(e) => e.kind(),
            ProxyError::Dial(e) => e.kind(),
            ProxyError::BadTarget(_) => "bad-target",
            ProxyError::HeaderTimeout(_) => "client-header-timeout",
            ProxyError::UpstreamTimeout(_) => "upstream-read-timeout",
            ProxyError::UpstreamProtocol(_) => "upstream-protocol-error",
            ProxyError::UpstreamIo(_) => "upstream-io-error",
            ProxyError::ClientRead(_) => "client-read-error",
            ProxyError::ClientWrite(_) => "client-write-error",
            ProxyError::TunnelCopy(_) => "tunnel-copy-error",
            ProxyError::TunnelIdle(_) => "tunnel-idle-timeout",
        }
    }

    /// Status for the client, if one may still be sent.
    ///
    /// The caller must also check that no response byte was written yet.
    pub fn status(&self) -> Option<Status> {
        match self {
            ProxyError::Parse(e) => e.status(),
            ProxyError::Dial(e) => Some(e.status()),
            ProxyError::BadTarget(_) => Some(Status::BadRequest),
            ProxyError::UpstreamTimeout(_) => Some(Status::GatewayTimeout),
            ProxyError::UpstreamProtocol(_) | ProxyError::UpstreamIo(_) => Some(Status::BadGateway),
            ProxyError::HeaderTimeout(_)
            | ProxyError::ClientRead(_)
            | ProxyError::ClientWrite(_)
            | ProxyError::TunnelCopy(_)
            | ProxyError::TunnelIdle(_) => None,
        }
    }

    /// Map a request-body relay failure: reads hit the client, writes hit the origin.
    pub fn from_request_body(err: BodyError) -> Self {
        match err {
            BodyError::Read(e) => ProxyError::ClientRead(e),
            BodyError::Write(e) => ProxyError::UpstreamIo(e),
            BodyError::WriteIdle(d) => ProxyError::UpstreamTimeout(d),
            BodyError::Idle(d) => ProxyError::ClientRead(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("request body stalled for {d:?}"),
            )),
            BodyError::Malformed(msg) => ProxyError::Parse(ParseError::InvalidFraming(msg)),
        }
    }

    /// Map a response-body relay failure: reads hit the origin, writes hit the client.
    pub fn from_response_body(err: BodyError) -> Self {
        match err {
            BodyError::Read(e) => ProxyError::UpstreamIo(e),
            BodyError::Write(e) => ProxyError::ClientWrite(e),
            BodyError::WriteIdle(d) => ProxyError::ClientWrite(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("client accepted no response bytes for {d:?}"),
            )),
            BodyError::Idle(d) => ProxyError::UpstreamTimeout(d),
            BodyError::Malformed(msg) => ProxyError::UpstreamProtocol(msg),
        }
    }
}

impl From<HeadError> for ProxyError {
    fn from(err: HeadError) -> Self {
        match err {
            HeadError::Io(e) => ProxyError::UpstreamIo(e),
            other => ProxyError::UpstreamProtocol(other.to_string()),
        }
    }
}
