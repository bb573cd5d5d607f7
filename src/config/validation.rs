//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, limits sane)
//! - Validate addresses and the `Via` pseudonym
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ProxyConfig;

/// Smallest accepted head limit; a request line plus a `Host` header must fit.
pub const MIN_HEADER_BYTES: usize = 1024;

/// A single semantic problem found in a config.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field}: `{value}` is not a socket address")]
    InvalidAddress { field: &'static str, value: String },
    #[error("{field} must be greater than zero")]
    ZeroValue { field: &'static str },
    #[error("limits.max_header_bytes must be at least {MIN_HEADER_BYTES} (got {0})")]
    HeaderLimitTooSmall(usize),
    #[error("identity.proxy_name must be a non-empty token without control characters")]
    InvalidProxyName,
}

/// Validate a fully merged configuration.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_address(
        &mut errors,
        "listener.bind_address",
        &config.listener.bind_address,
    );
    if config.observability.metrics_enabled {
        check_address(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }

    if config.listener.max_connections == 0 {
        errors.push(ValidationError::ZeroValue {
            field: "listener.max_connections",
        });
    }

    let timeouts = &config.timeouts;
    for (field, value) in [
        ("timeouts.dial_secs", timeouts.dial_secs),
        ("timeouts.header_secs", timeouts.header_secs),
        ("timeouts.upstream_secs", timeouts.upstream_secs),
        ("timeouts.idle_secs", timeouts.idle_secs),
        ("timeouts.shutdown_grace_secs", timeouts.shutdown_grace_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::ZeroValue { field });
        }
    }

    if config.limits.max_header_bytes < MIN_HEADER_BYTES {
        errors.push(ValidationError::HeaderLimitTooSmall(
            config.limits.max_header_bytes,
        ));
    }
    if config.limits.max_chunk_line_bytes == 0 {
        errors.push(ValidationError::ZeroValue {
            field: "limits.max_chunk_line_bytes",
        });
    }

    if !is_valid_proxy_name(&config.identity.proxy_name) {
        errors.push(ValidationError::InvalidProxyName);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}

fn is_valid_proxy_name(name: &str) -> bool {
    !name.trim().is_empty() && !name.chars().any(|c| c.is_control())
}
