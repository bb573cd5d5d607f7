//! HTTP/1.x forward proxy with CONNECT tunneling.
//!
//! # Architecture Overview
//!
//! ```text
//!                         ┌──────────────────────────────────────────────┐
//!                         │                FORWARD PROXY                 │
//!   Client                │  ┌──────────┐   ┌──────────┐                 │
//!   ──────────────────────┼─▶│   net    │──▶│   http   │──┐              │
//!                         │  │ listener │   │  server  │  │              │
//!                         │  └──────────┘   └──────────┘  │              │
//!                         │             ┌─────────────────┴──┐           │
//!                         │             ▼                    ▼           │
//!                         │      ┌────────────┐       ┌────────────┐     │   Origin /
//!                         │      │  forward   │       │   tunnel   │─────┼── tunnel peer
//!                         │      │ head+body  │       │ byte relay │     │
//!                         │      └─────┬──────┘       └────────────┘     │
//!                         │            └──── net::dialer ────────────────┼──▶
//!                         │                                              │
//!                         │  config · security · resilience · lifecycle  │
//!                         │  observability                               │
//!                         └──────────────────────────────────────────────┘
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod security;

pub use config::schema::ProxyConfig;
pub use error::ProxyError;
pub use http::{ProxyContext, ProxyServer};
pub use lifecycle::Shutdown;
pub use net::Listener;
