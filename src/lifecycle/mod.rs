//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Supervisor (supervisor.rs):
//!     starting → running → draining → stopped
//!
//! Shutdown (shutdown.rs):
//!     Signal received → broadcast → accept loop stops → drain → exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Handlers are never messaged about shutdown; once the grace period
//!   elapses their tasks are aborted, which closes their sockets
//! - Shutdown has timeout: forced close after deadline

pub mod shutdown;
pub mod signals;
pub mod supervisor;

pub use shutdown::Shutdown;
pub use supervisor::SupervisorState;
