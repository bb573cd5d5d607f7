//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound request:
//!     → limits.rs (bounded head reading, 431 on overflow)
//!     → headers.rs (strip hop-by-hop, pin Host, append Via / X-Forwarded-For)
//!
//! Upstream response:
//!     → limits.rs (bounded head and chunk-line reading)
//!     → headers.rs (strip hop-by-hop)
//! ```

pub mod headers;
pub mod limits;

pub use headers::{HopByHopHeaders, ProxySignature, HOP_BY_HOP_HEADERS};
pub use limits::Limits;
