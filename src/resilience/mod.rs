//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Accept loop error:
//!     → backoff.rs (exponential delay with jitter before the next accept)
//!
//! Connection handler I/O:
//!     → timeouts.rs (header, dial, upstream, idle and shutdown deadlines)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external wait has a deadline
//! - No retries: a failed dial is reported to the client as a gateway error

pub mod backoff;
pub mod timeouts;

pub use backoff::calculate_backoff;
pub use timeouts::Timeouts;
