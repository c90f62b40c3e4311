#![deny(clippy::all)]
#![forbid(unsafe_code)]

//! A programmable Layer-7 entry gateway for the Minecraft Java Edition protocol.
//!
//! A single [`Engine`] terminates many client TCP connections, inspects the initial handshake and
//! login frames, and parks each connection until an externally supplied policy layer answers with
//! a routing or MOTD decision through the boundary API. Accepted logins are forwarded to their
//! backend (directly or through a SOCKS5 relay, optionally preceded by a PROXY protocol header)
//! under per-connection token bucket rate limits.
//!
//! The policy layer is reached exclusively through queues: it polls [`Engine::poll_events`] and
//! answers with [`Engine::submit_route_decision`] / [`Engine::submit_motd_decision`]. It holds no
//! engine references and names connections and listeners by id only.

mod cache;
mod connection;
pub mod decision;
mod engine;
mod error;
mod forward;
pub mod limiter;
mod listener;
mod metrics;
pub mod outbound;
pub mod proxy_protocol;
mod registry;

pub use cache::CacheStats;
pub use engine::{
    ConnectionMetrics, DEFAULT_DECISION_TIMEOUT, DEFAULT_SETUP_TIMEOUT, Engine, Events,
    MetricsSnapshot,
};
pub use error::Error;
pub use limiter::RateLimit;
pub use proxy_protocol::ProxyProtocolMode;
