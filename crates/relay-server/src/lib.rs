//! relay-server: edgetun edge relay.
//!
//! Accepts tunnel connections over WebSocket upgrades, authorizes them
//! against a remotely refreshed identity set, and forwards the payload to
//! TCP destinations (with geo-aware egress fallback) or a DNS-over-HTTPS
//! resolver for UDP/53 traffic.

pub mod cache;
pub mod config;
pub mod doh;
pub mod handshake;
pub mod server;
pub mod session;
