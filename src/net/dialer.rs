//! Upstream dialer.
//!
//! Resolves `host:port` with the platform resolver and opens a TCP
//! connection, trying each resolved address in order. Resolution and
//! connection share one deadline.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream};

use crate::http::response::Status;

/// Why an upstream connection could not be opened.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("failed to resolve {host}: {reason}")]
    ResolveFailed { host: String, reason: String },
    #[error("connection to {addr} refused")]
    ConnectRefused { addr: String },
    #[error("connecting to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("{addr} unreachable: {source}")]
    NetworkUnreachable {
        addr: String,
        #[source]
        source: io::Error,
    },
}

impl DialError {
    pub fn kind(&self) -> &'static str {
        match self {
            DialError::ResolveFailed { .. } => "resolve-failed",
            DialError::ConnectRefused { .. } => "connect-refused",
            DialError::ConnectTimeout { .. } => "connect-timeout",
            DialError::NetworkUnreachable { .. } => "network-unreachable",
        }
    }

    /// Gateway status reported to the client for this failure.
    pub fn status(&self) -> Status {
        match self {
            DialError::ConnectTimeout { .. } => Status::GatewayTimeout,
            _ => Status::BadGateway,
        }
    }

    fn from_io(addr: SocketAddr, err: io::Error, timeout: Duration) -> Self {
        let addr = addr.to_string();
        match err.kind() {
            io::ErrorKind::ConnectionRefused => DialError::ConnectRefused { addr },
            io::ErrorKind::TimedOut => DialError::ConnectTimeout { addr, timeout },
            _ => DialError::NetworkUnreachable { addr, source: err },
        }
    }
}

/// An outbound TCP stream to an origin server or tunnel peer.
#[derive(Debug)]
pub struct UpstreamConnection {
    remote_addr: SocketAddr,
    dial_duration: Duration,
    pub(crate) reader: BufReader<OwnedReadHalf>,
    pub(crate) writer: OwnedWriteHalf,
}

impl UpstreamConnection {
    fn new(stream: TcpStream, remote_addr: SocketAddr, dial_duration: Duration) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            remote_addr,
            dial_duration,
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Time spent resolving and connecting.
    pub fn dial_duration(&self) -> Duration {
        self.dial_duration
    }
}

/// Opens upstream connections under a fixed deadline.
#[derive(Debug, Clone, Copy)]
pub struct Dialer {
    timeout: Duration,
}

impl Dialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolve `host` and connect to the first address that accepts.
    ///
    /// A resolver that has not answered by the deadline is reported as a
    /// resolution failure, not a connect timeout.
    pub async fn dial(&self, host: &str, port: u16) -> Result<UpstreamConnection, DialError> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.timeout;

        let addrs: Vec<SocketAddr> = match tokio::time::timeout_at(deadline, lookup_host((host, port))).await {
            Ok(Ok(addrs)) => addrs.collect(),
            Ok(Err(e)) => {
                return Err(DialError::ResolveFailed {
                    host: host.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(DialError::ResolveFailed {
                    host: host.to_string(),
                    reason: format!("no answer within {:?}", self.timeout),
                })
            }
        };

        match tokio::time::timeout_at(deadline, self.connect_any(host, &addrs)).await {
            Ok(Ok((stream, addr))) => {
                let elapsed = started.elapsed();
                tracing::debug!(host, port, remote_addr = %addr, elapsed_ms = elapsed.as_millis() as u64, "Upstream connected");
                Ok(UpstreamConnection::new(stream, addr, elapsed))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DialError::ConnectTimeout {
                addr: format_authority(host, port),
                timeout: self.timeout,
            }),
        }
    }

    async fn connect_any(
        &self,
        host: &str,
        addrs: &[SocketAddr],
    ) -> Result<(TcpStream, SocketAddr), DialError> {
        let mut last_err = None;
        for &addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(remote_addr = %addr, error = %e, "Failed to set TCP_NODELAY");
                    }
                    return Ok((stream, addr));
                }
                Err(e) => {
                    tracing::debug!(remote_addr = %addr, error = %e, "Upstream connect failed");
                    last_err = Some(DialError::from_io(addr, e, self.timeout));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| DialError::ResolveFailed {
            host: host.to_string(),
            reason: "no addresses returned".to_string(),
        }))
    }
}

/// Render `host:port`, bracketing IPv6 literals.
pub fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn dial_connects_to_listening_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let upstream = Dialer::new(Duration::from_secs(2))
            .dial("127.0.0.1", port)
            .await
            .unwrap();
        assert_eq!(upstream.remote_addr().port(), port);
    }

    #[tokio::test]
    async fn refused_port_maps_to_bad_gateway() {
        // Bind then drop to find a port with nothing listening.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let err = Dialer::new(Duration::from_secs(2))
            .dial("127.0.0.1", port)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "connect-refused");
        assert_eq!(err.status(), Status::BadGateway);
    }

    #[tokio::test]
    async fn unresolvable_host_maps_to_bad_gateway() {
        let timeout = Duration::from_secs(3);
        let started = Instant::now();
        let err = Dialer::new(timeout)
            .dial("nonexistent.invalid", 80)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "resolve-failed");
        assert_eq!(err.status(), Status::BadGateway);
        assert!(started.elapsed() < timeout + Duration::from_secs(1));
    }

    #[test]
    fn timeout_maps_to_gateway_timeout() {
        let err = DialError::ConnectTimeout {
            addr: "10.0.0.1:80".into(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(err.status(), Status::GatewayTimeout);
        assert_eq!(err.kind(), "connect-timeout");
    }

    #[test]
    fn ipv6_authority_is_bracketed() {
        assert_eq!(format_authority("::1", 443), "[::1]:443");
        assert_eq!(format_authority("example.com", 80), "example.com:80");
    }
}
