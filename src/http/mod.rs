//! HTTP/1.x proxy protocol handling.
//!
//! # Data Flow
//! ```text
//! Accepted connection
//!     → server.rs (header deadline, classify)
//!     → request.rs (bounded request head parse)
//!     → CONNECT?
//!         yes → tunnel.rs (dial, 200 Connection Established, byte relay)
//!         no  → forward.rs (dial, rewrite head, relay body, relay response)
//!                 → headers.rs / response.rs / body.rs
//!     → close
//! ```
//!
//! One request is served per client connection.

pub mod body;
pub mod forward;
pub mod headers;
pub mod request;
pub mod response;
pub mod server;
pub mod tunnel;

pub use body::{relay_body, BodyError, BodyFraming};
pub use forward::{handle_forward, ForwardOutcome};
pub use headers::{Header, Headers};
pub use request::{read_request, Authority, ParseError, ParsedRequest, RequestTarget, Version};
pub use response::{read_response_head, ResponseHead, Status};
pub use server::{handle_connection, ProxyContext, ProxyServer};
pub use tunnel::{handle_tunnel, TunnelPair, TunnelStats};
