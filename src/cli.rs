//! Command-line interface.
//!
//! Flags override individual fields of the optional TOML config file; the
//! merged result is validated once.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{read_config, validate_config, ConfigError, ProxyConfig};

#[derive(Debug, Parser)]
#[command(name = "forward-proxy")]
#[command(version, about = "HTTP/1.x forward proxy with CONNECT tunneling", long_about = None)]
pub struct Cli {
    /// TOML config file; every field has a default.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Address to accept clients on (e.g. 127.0.0.1:8080).
    #[arg(short, long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// Upstream resolve + connect deadline, in seconds.
    #[arg(long, value_name = "SECS")]
    pub dial_timeout: Option<u64>,

    /// Deadline for a client's complete request head, in seconds.
    #[arg(long, value_name = "SECS")]
    pub header_timeout: Option<u64>,

    /// Deadline for the origin to start responding, in seconds.
    #[arg(long, value_name = "SECS")]
    pub upstream_timeout: Option<u64>,

    /// Tunnel and body idle deadline, in seconds.
    #[arg(long, value_name = "SECS")]
    pub idle_timeout: Option<u64>,

    /// Drain period after a shutdown signal, in seconds.
    #[arg(long, value_name = "SECS")]
    pub shutdown_grace: Option<u64>,

    /// Pseudonym announced in the Via header.
    #[arg(long, value_name = "NAME")]
    pub proxy_name: Option<String>,

    /// Maximum concurrent client connections.
    #[arg(long, value_name = "N")]
    pub max_connections: Option<usize>,

    /// Maximum bytes in a request or response head.
    #[arg(long, value_name = "BYTES")]
    pub max_header_bytes: Option<usize>,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Serve Prometheus metrics on this address.
    #[arg(long, value_name = "ADDR")]
    pub metrics_listen: Option<String>,
}

impl Cli {
    /// Load the config file (if any), apply flag overrides, then validate.
    pub fn into_config(self) -> Result<ProxyConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => read_config(path)?,
            None => ProxyConfig::default(),
        };
        self.apply(&mut config);
        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }

    fn apply(self, config: &mut ProxyConfig) {
        if let Some(listen) = self.listen {
            config.listener.bind_address = listen;
        }
        if let Some(max) = self.max_connections {
            config.listener.max_connections = max;
        }
        if let Some(secs) = self.dial_timeout {
            config.timeouts.dial_secs = secs;
        }
        if let Some(secs) = self.header_timeout {
            config.timeouts.header_secs = secs;
        }
        if let Some(secs) = self.upstream_timeout {
            config.timeouts.upstream_secs = secs;
        }
        if let Some(secs) = self.idle_timeout {
            config.timeouts.idle_secs = secs;
        }
        if let Some(secs) = self.shutdown_grace {
            config.timeouts.shutdown_grace_secs = secs;
        }
        if let Some(bytes) = self.max_header_bytes {
            config.limits.max_header_bytes = bytes;
        }
        if let Some(name) = self.proxy_name {
            config.identity.proxy_name = name;
        }
        if let Some(level) = self.log_level {
            config.observability.log_level = level;
        }
        if let Some(addr) = self.metrics_listen {
            config.observability.metrics_enabled = true;
            config.observability.metrics_address = addr;
        }
    }
}
