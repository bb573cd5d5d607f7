//! Accept loop and per-connection dispatch.
//!
//! # Responsibilities
//! - Accept client connections under the listener's connection limit
//! - Spawn one task per connection and classify its first request
//! - Dispatch CONNECT to the tunnel handler, everything else to forwarding
//! - Turn handler failures into a single status response where possible
//! - Drain in-flight connections on shutdown, force-closing after the grace period
//!
//! # Design Decisions
//! - Connection tasks live in a `JoinSet` so shutdown can abort them all
//! - Accept errors back off exponentially instead of spinning
//! - A request head that never completes is dropped without a response
//! - After an error response the client's remaining input is drained for a
//!   bounded time before the socket closes, so the response is not reset away

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::config::{ListenerConfig, ProxyConfig};
use crate::error::ProxyError;
use crate::http::forward::handle_forward;
use crate::http::request::{read_request, ParseError};
use crate::http::tunnel::handle_tunnel;
use crate::lifecycle::SupervisorState;
use crate::net::{ClientConnection, ConnectionState, ConnectionTracker, Dialer, Listener, ListenerError};
use crate::observability::metrics::{self, ConnectionMode};
use crate::resilience::backoff::accept_backoff;
use crate::resilience::Timeouts;
use crate::security::{Limits, ProxySignature};

/// Everything a connection handler needs, shared read-only across tasks.
#[derive(Debug, Clone)]
pub struct ProxyContext {
    pub timeouts: Timeouts,
    pub limits: Limits,
    pub dialer: Dialer,
    pub signature: ProxySignature,
}

impl ProxyContext {
    pub fn new(timeouts: Timeouts, limits: Limits, signature: ProxySignature) -> Self {
        Self {
            dialer: Dialer::new(timeouts.dial),
            timeouts,
            limits,
            signature,
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(
            Timeouts::from_config(&config.timeouts),
            Limits::from_config(&config.limits),
            ProxySignature::new(&config.identity.proxy_name),
        )
    }
}

/// The forward proxy server.
#[derive(Debug)]
pub struct ProxyServer {
    ctx: Arc<ProxyContext>,
    tracker: ConnectionTracker,
}

impl ProxyServer {
    pub fn new(ctx: ProxyContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            tracker: ConnectionTracker::new(),
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(ProxyContext::from_config(config))
    }

    /// Number of connections currently being handled.
    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Bind the listener described by `config`, then serve until shutdown.
    ///
    /// A bind failure moves the supervisor straight from starting to
    /// stopped and is returned to the caller.
    pub async fn serve(
        self,
        config: &ListenerConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ListenerError> {
        let mut state = SupervisorState::Starting;
        match Listener::bind(config).await {
            Ok(listener) => self.drive(listener, shutdown, state).await,
            Err(e) => {
                tracing::error!(bind_address = %config.bind_address, error = %e, "Failed to start listener");
                state.advance(SupervisorState::Stopped);
                Err(e)
            }
        }
    }

    /// Serve on an already bound listener until `shutdown` fires (or its
    /// sender is dropped), then drain.
    pub async fn run(
        self,
        listener: Listener,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ListenerError> {
        self.drive(listener, shutdown, SupervisorState::Starting).await
    }

    async fn drive(
        self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
        mut state: SupervisorState,
    ) -> Result<(), ListenerError> {
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                state.advance(SupervisorState::Stopped);
                return Err(ListenerError::Accept(e));
            }
        };
        state.advance(SupervisorState::Running);
        tracing::info!(
            address = %local_addr,
            max_connections = listener.max_connections(),
            proxy_name = self.ctx.signature.name(),
            "Forward proxy serving"
        );

        let mut connections = JoinSet::new();
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr, permit)) => {
                        consecutive_failures = 0;
                        let guard = self.tracker.track();
                        let connection_id = guard.id();
                        tracing::info!(
                            peer_addr = %peer_addr,
                            connection_id = %connection_id,
                            "Accepted connection"
                        );

                        let ctx = Arc::clone(&self.ctx);
                        let span = tracing::info_span!(
                            "connection",
                            connection_id = %connection_id,
                            peer_addr = %peer_addr
                        );
                        connections.spawn(
                            async move {
                                let _permit = permit;
                                let _guard = guard;
                                let client = ClientConnection::new(stream, peer_addr, connection_id);
                                handle_connection(&ctx, client).await;
                            }
                            .instrument(span),
                        );
                    }
                    Err(ListenerError::Closed) => break,
                    Err(e) => {
                        consecutive_failures = consecutive_failures.saturating_add(1);
                        let delay = accept_backoff(consecutive_failures);
                        metrics::record_accept_error();
                        tracing::warn!(
                            error = %e,
                            consecutive_failures,
                            delay_ms = delay.as_millis() as u64,
                            "Accept failed; backing off"
                        );
                        if backoff_or_shutdown(delay, &mut shutdown).await {
                            break;
                        }
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!(error = %e, "Connection task panicked");
                        }
                    }
                }
            }
        }

        state.advance(SupervisorState::Draining);
        drop(listener);

        let grace = self.ctx.timeouts.shutdown_grace;
        tracing::info!(
            in_flight = connections.len(),
            grace_secs = grace.as_secs_f64(),
            "Stopped accepting; draining connections"
        );

        let drained = tokio::time::timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                remaining = connections.len(),
                "Grace period elapsed; closing remaining connections"
            );
            connections.shutdown().await;
        }

        state.advance(SupervisorState::Stopped);
        tracing::info!("Forward proxy stopped");
        Ok(())
    }
}

/// Sleep for `delay` unless shutdown fires first. Returns `true` on shutdown.
async fn backoff_or_shutdown(delay: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.recv() => true,
    }
}

/// Drive one client connection from its first byte to close.
pub async fn handle_connection(ctx: &ProxyContext, mut client: ClientConnection) {
    client.transition(ConnectionState::Parsing);

    let read = tokio::time::timeout(
        ctx.timeouts.header,
        read_request(&mut client.reader, ctx.limits.max_header_bytes),
    )
    .await;

    let request = match read {
        Ok(Ok(request)) => request,
        Ok(Err(ParseError::ClientClosed)) => {
            tracing::debug!("Client closed before sending a request");
            finish(client, false).await;
            return;
        }
        Ok(Err(e)) => {
            tracing::warn!(kind = e.kind(), error = %e, "Rejected request");
            metrics::record_error(e.kind());
            metrics::record_connection(ConnectionMode::Rejected);
            let responded = match e.status() {
                Some(status) => client.respond(status).await.unwrap_or_else(|write_err| {
                    tracing::debug!(error = %write_err, "Failed to send rejection");
                    false
                }),
                None => false,
            };
            finish(client, responded).await;
            return;
        }
        Err(_) => {
            let err = ProxyError::HeaderTimeout(ctx.timeouts.header);
            tracing::debug!(kind = err.kind(), "Request head not received in time");
            metrics::record_error(err.kind());
            metrics::record_connection(ConnectionMode::Rejected);
            finish(client, false).await;
            return;
        }
    };

    client.transition(ConnectionState::Classified);
    let started = Instant::now();

    let (mode, result) = if request.is_connect() {
        client.transition(ConnectionState::Tunneling);
        let result = handle_tunnel(ctx, &mut client, &request).await.map(|_| ());
        (ConnectionMode::Tunnel, result)
    } else {
        client.transition(ConnectionState::Forwarding);
        let result = handle_forward(ctx, &mut client, &request).await.map(|_| ());
        (ConnectionMode::Forward, result)
    };
    metrics::record_connection(mode);

    let mut responded = false;
    if let Err(e) = result {
        metrics::record_error(e.kind());
        match e.status() {
            Some(status) => {
                tracing::warn!(
                    method = %request.method,
                    kind = e.kind(),
                    error = %e,
                    status = status.code(),
                    "Request failed"
                );
                match client.respond(status).await {
                    Ok(true) => {
                        responded = true;
                        if mode == ConnectionMode::Forward {
                            metrics::record_request(&request.method, status.code(), started);
                        }
                    }
                    Ok(false) => tracing::debug!("Response already started; closing instead"),
                    Err(write_err) => tracing::debug!(error = %write_err, "Failed to send error response"),
                }
            }
            None => tracing::debug!(kind = e.kind(), error = %e, "Connection ended"),
        }
    }

    finish(client, responded).await;
}

/// Close `client`, lingering when an error response may race unread input.
async fn finish(client: ClientConnection, responded_with_error: bool) {
    tracing::debug!(
        state = client.state().as_str(),
        elapsed_ms = client.accepted_at().elapsed().as_millis() as u64,
        lingering = responded_with_error,
        "Closing connection"
    );
    if responded_with_error {
        client.linger_close().await;
    } else {
        client.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Shutdown;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_context() -> ProxyContext {
        let timeouts = Timeouts {
            header: Duration::from_millis(300),
            dial: Duration::from_secs(2),
            upstream: Duration::from_secs(2),
            idle: Duration::from_secs(2),
            shutdown_grace: Duration::from_millis(200),
        };
        ProxyContext::new(timeouts, Limits::default(), ProxySignature::new("TestProxy/1.0"))
    }

    async fn start() -> (std::net::SocketAddr, Shutdown, tokio::task::JoinHandle<Result<(), ListenerError>>) {
        let listener = Listener::bind(&ListenerConfig {
            bind_address: "127.0.0.1:0".into(),
            max_connections: 16,
        })
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Shutdown::new();
        let server = ProxyServer::new(test_context());
        let handle = tokio::spawn(server.run(listener, shutdown.subscribe()));
        (addr, shutdown, handle)
    }

    async fn exchange(addr: std::net::SocketAddr, request: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    #[test]
    fn context_from_default_config() {
        let ctx = ProxyContext::from_config(&ProxyConfig::default());
        assert_eq!(ctx.timeouts.dial, Duration::from_secs(10));
        assert_eq!(ctx.dialer.timeout(), Duration::from_secs(10));
        assert_eq!(ctx.signature.name(), "LocalhostProxy/1.0");
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let (addr, shutdown, handle) = start().await;
        let response = exchange(addr, b"NONSENSE\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
        shutdown.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn rejection_survives_trailing_input() {
        let (addr, shutdown, handle) = start().await;
        let (mut reader, mut writer) = TcpStream::connect(addr).await.unwrap().into_split();
        let sending = tokio::spawn(async move {
            writer.write_all(b"NONSENSE\r\n").await?;
            writer.write_all(&vec![b'j'; 64 * 1024]).await?;
            writer.shutdown().await
        });

        let mut response = Vec::new();
        reader.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n");
        sending.await.unwrap().unwrap();

        shutdown.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn serve_reports_bind_failure() {
        let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ListenerConfig {
            bind_address: occupied.local_addr().unwrap().to_string(),
            max_connections: 4,
        };
        let shutdown = Shutdown::new();
        let result = ProxyServer::new(test_context())
            .serve(&config, shutdown.subscribe())
            .await;
        assert!(matches!(result, Err(ListenerError::Bind { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn accept_backoff_yields_to_shutdown() {
        let shutdown = Shutdown::new();
        let mut receiver = shutdown.subscribe();
        assert!(!backoff_or_shutdown(Duration::from_millis(100), &mut receiver).await);

        shutdown.trigger();
        let started = tokio::time::Instant::now();
        assert!(backoff_or_shutdown(Duration::from_secs(1), &mut receiver).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn connect_without_port_gets_400() {
        let (addr, shutdown, handle) = start().await;
        let response = exchange(addr, b"CONNECT example.com HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400 "), "{response}");
        shutdown.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn silent_client_is_closed_without_response() {
        let (addr, shutdown, handle) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET http://127.0.0.1/ HTTP/1.1\r\n").await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());
        shutdown.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_force_closes_after_grace() {
        let (addr, shutdown, handle) = start().await;
        // Connected but silent.
        let _idle = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("server stops within the grace period")
            .unwrap()
            .unwrap();
    }
}
