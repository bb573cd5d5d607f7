//! CONNECT tunnel handler.
//!
//! After `200 Connection Established` the client socket carries no more
//! HTTP. Bytes are shuttled in both directions until both sides have
//! closed, either side errors, or the tunnel sits idle too long.
//!
//! ```text
//! client ──read──▶ upstream_dir ──write──▶ upstream
//! client ◀──write── downstream_dir ◀──read── upstream
//! ```
//!
//! EOF in one direction is propagated as a write-side shutdown on the
//! other socket, so half-closed tunnels keep flowing the other way.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::error::ProxyError;
use crate::http::request::{ParsedRequest, RequestTarget};
use crate::http::response::CONNECTION_ESTABLISHED;
use crate::http::server::ProxyContext;
use crate::net::connection::ClientConnection;
use crate::observability::metrics;

const TUNNEL_BUF_SIZE: usize = 16 * 1024;

/// Bytes moved through a finished tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    /// Client to upstream.
    pub upstream_bytes: u64,
    /// Upstream to client.
    pub downstream_bytes: u64,
}

/// Time of the last byte seen in either direction.
#[derive(Debug)]
struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.origin + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}

/// A client and an upstream joined for the lifetime of one CONNECT.
#[derive(Debug)]
pub struct TunnelPair<CR, CW, UR, UW> {
    client_reader: CR,
    client_writer: CW,
    upstream_reader: UR,
    upstream_writer: UW,
}

impl<CR, CW, UR, UW> TunnelPair<CR, CW, UR, UW>
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    UR: AsyncRead + Unpin,
    UW: AsyncWrite + Unpin,
{
    pub fn new(client_reader: CR, client_writer: CW, upstream_reader: UR, upstream_writer: UW) -> Self {
        Self {
            client_reader,
            client_writer,
            upstream_reader,
            upstream_writer,
        }
    }

    /// Relay until both directions finish, one fails, or `idle` passes with no bytes.
    pub async fn run(self, idle: Duration) -> Result<TunnelStats, ProxyError> {
        let TunnelPair {
            mut client_reader,
            mut client_writer,
            mut upstream_reader,
            mut upstream_writer,
        } = self;

        let activity = Activity::new();
        let upstream_dir = copy_direction(&mut client_reader, &mut upstream_writer, &activity);
        let downstream_dir = copy_direction(&mut upstream_reader, &mut client_writer, &activity);
        tokio::pin!(upstream_dir, downstream_dir);

        let mut upstream_bytes = None;
        let mut downstream_bytes = None;

        loop {
            if let (Some(upstream_bytes), Some(downstream_bytes)) = (upstream_bytes, downstream_bytes) {
                return Ok(TunnelStats {
                    upstream_bytes,
                    downstream_bytes,
                });
            }

            tokio::select! {
                result = &mut upstream_dir, if upstream_bytes.is_none() => {
                    upstream_bytes = Some(result.map_err(ProxyError::TunnelCopy)?);
                    tracing::trace!("Client closed its side of the tunnel");
                }
                result = &mut downstream_dir, if downstream_bytes.is_none() => {
                    downstream_bytes = Some(result.map_err(ProxyError::TunnelCopy)?);
                    tracing::trace!("Upstream closed its side of the tunnel");
                }
                _ = tokio::time::sleep_until(activity.last() + idle) => {
                    if activity.last().elapsed() >= idle {
                        return Err(ProxyError::TunnelIdle(idle));
                    }
                }
            }
        }
    }
}

/// Copy until EOF, then shut down the writer so the peer sees the close.
async fn copy_direction<R, W>(reader: &mut R, writer: &mut W, activity: &Activity) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; TUNNEL_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            // The peer may already be gone; the other direction reports that.
            let _ = writer.shutdown().await;
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        activity.touch();
        total += n as u64;
    }
}

/// Establish a CONNECT tunnel and relay it to completion.
pub async fn handle_tunnel(
    ctx: &ProxyContext,
    client: &mut ClientConnection,
    request: &ParsedRequest,
) -> Result<TunnelStats, ProxyError> {
    let RequestTarget::Authority(authority) = &request.target else {
        return Err(ProxyError::BadTarget("CONNECT target must be host:port".into()));
    };
    let Some(port) = authority.port else {
        return Err(ProxyError::BadTarget(format!(
            "CONNECT target {authority} has no port"
        )));
    };

    let mut upstream = ctx.dialer.dial(&authority.host, port).await?;
    client
        .send(CONNECTION_ESTABLISHED)
        .await
        .map_err(ProxyError::ClientWrite)?;
    tracing::debug!(authority = %authority, remote_addr = %upstream.remote_addr(), "Tunnel established");

    let result = TunnelPair::new(
        &mut client.reader,
        &mut client.writer,
        &mut upstream.reader,
        &mut upstream.writer,
    )
    .run(ctx.timeouts.idle)
    .await;

    if let Ok(stats) = &result {
        metrics::record_tunnel_bytes(stats.upstream_bytes, stats.downstream_bytes);
        tracing::info!(
            authority = %authority,
            upstream_bytes = stats.upstream_bytes,
            downstream_bytes = stats.downstream_bytes,
            "Tunnel closed"
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split};

    #[tokio::test]
    async fn relays_both_directions_and_propagates_half_close() {
        let (client_side, mut client_peer) = duplex(1024);
        let (upstream_side, mut upstream_peer) = duplex(1024);
        let (cr, cw) = split(client_side);
        let (ur, uw) = split(upstream_side);

        let tunnel = tokio::spawn(TunnelPair::new(cr, cw, ur, uw).run(Duration::from_secs(5)));

        client_peer.write_all(&[0xAA, 0xBB]).await.unwrap();
        client_peer.shutdown().await.unwrap();

        let mut from_client = Vec::new();
        upstream_peer.read_to_end(&mut from_client).await.unwrap();
        assert_eq!(from_client, vec![0xAA, 0xBB]);

        // Client half-closed; upstream can still answer.
        upstream_peer.write_all(&[0x01, 0x02, 0x03]).await.unwrap();
        upstream_peer.shutdown().await.unwrap();

        let mut from_upstream = Vec::new();
        client_peer.read_to_end(&mut from_upstream).await.unwrap();
        assert_eq!(from_upstream, vec![0x01, 0x02, 0x03]);

        let stats = tunnel.await.unwrap().unwrap();
        assert_eq!(
            stats,
            TunnelStats {
                upstream_bytes: 2,
                downstream_bytes: 3
            }
        );
    }

    #[tokio::test]
    async fn large_transfer_is_byte_exact() {
        let (client_side, mut client_peer) = duplex(4096);
        let (upstream_side, mut upstream_peer) = duplex(4096);
        let (cr, cw) = split(client_side);
        let (ur, uw) = split(upstream_side);
        let tunnel = tokio::spawn(TunnelPair::new(cr, cw, ur, uw).run(Duration::from_secs(5)));

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client_peer.write_all(&payload).await.unwrap();
            client_peer.shutdown().await.unwrap();
            client_peer
        });

        let mut received = Vec::new();
        upstream_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);

        upstream_peer.shutdown().await.unwrap();
        let mut client_peer = writer.await.unwrap();
        let mut rest = Vec::new();
        client_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        assert_eq!(tunnel.await.unwrap().unwrap().upstream_bytes, 200_000);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_tunnel_times_out() {
        let (client_side, _client_peer) = duplex(64);
        let (upstream_side, _upstream_peer) = duplex(64);
        let (cr, cw) = split(client_side);
        let (ur, uw) = split(upstream_side);

        let err = TunnelPair::new(cr, cw, ur, uw)
            .run(Duration::from_secs(300))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::TunnelIdle(_)));
    }

    #[tokio::test]
    async fn read_error_terminates_the_pair() {
        struct Failing;
        impl AsyncRead for Failing {
            fn poll_read(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<io::Result<()>> {
                std::task::Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
            }
        }

        let (upstream_side, _upstream_peer) = duplex(64);
        let (ur, uw) = split(upstream_side);
        let err = TunnelPair::new(Failing, tokio::io::sink(), ur, uw)
            .run(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "tunnel-copy-error");
    }
}
