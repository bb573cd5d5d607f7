//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (identity, lifecycle tracking, state machine)
//!     → Hand off to HTTP layer
//!     → dialer.rs (outbound connection to origin or tunnel peer)
//!
//! Connection States:
//!     Accepted → Parsing → Classified → Forwarding | Tunneling → Closed
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - Every connection owns its sockets outright; no locking on I/O state

pub mod connection;
pub mod dialer;
pub mod listener;

pub use connection::{ClientConnection, ConnectionGuard, ConnectionId, ConnectionState, ConnectionTracker};
pub use dialer::{DialError, Dialer, UpstreamConnection};
pub use listener::{ConnectionPermit, Listener, ListenerError};
