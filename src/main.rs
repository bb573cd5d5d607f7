//! forward-proxy binary.
//!
//! Exit codes: 0 after a clean shutdown, 1 when the listener cannot be
//! bound, 2 when the configuration is invalid.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;

use forward_proxy::cli::Cli;
use forward_proxy::lifecycle::{signals, Shutdown};
use forward_proxy::net::ListenerError;
use forward_proxy::observability::{logging, metrics};
use forward_proxy::ProxyServer;

const EXIT_BIND_FAILED: u8 = 1;
const EXIT_INVALID_CONFIG: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Cli::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("forward-proxy: invalid configuration: {e}");
            return ExitCode::from(EXIT_INVALID_CONFIG);
        }
    };

    logging::init(&config.observability);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        dial_timeout_secs = config.timeouts.dial_secs,
        idle_timeout_secs = config.timeouts.idle_secs,
        proxy_name = %config.identity.proxy_name,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        // Validation already checked the address.
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();
    let _signals = match signals::install(shutdown.clone()) {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "Failed to install signal handlers");
            return ExitCode::FAILURE;
        }
    };

    let server = ProxyServer::from_config(&config);
    match server.serve(&config.listener, receiver).await {
        Ok(()) => {}
        Err(ListenerError::Bind { .. }) => return ExitCode::from(EXIT_BIND_FAILED),
        Err(e) => {
            tracing::error!(error = %e, "Proxy server failed");
            return ExitCode::FAILURE;
        }
    }

    tracing::info!("Shutdown complete");
    ExitCode::SUCCESS
}
