//! Timeout enforcement.
//!
//! # Responsibilities
//! - Resolve configured second counts into `Duration`s once at startup
//! - Name every deadline a connection handler waits under
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities at the call sites
//! - Timeout errors are distinct from other errors
//! - Timed-out upstream waits return 504 Gateway Timeout

use std::time::Duration;

use crate::config::TimeoutConfig;

/// Resolved deadlines shared by all handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Client must deliver the full request head within this window.
    pub header: Duration,
    /// Resolve + connect deadline for upstream dials.
    pub dial: Duration,
    /// Origin must start its response within this window.
    pub upstream: Duration,
    /// Maximum silence on a tunnel, or between body reads.
    pub idle: Duration,
    /// How long draining waits before force-closing connections.
    pub shutdown_grace: Duration,
}

impl Timeouts {
    pub fn from_config(config: &TimeoutConfig) -> Self {
        Self {
            header: Duration::from_secs(config.header_secs),
            dial: Duration::from_secs(config.dial_secs),
            upstream: Duration::from_secs(config.upstream_secs),
            idle: Duration::from_secs(config.idle_secs),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::from_config(&TimeoutConfig::default())
    }
}
