//! Trellis broker: per-key topic fan-out for sealed envelopes, plus a
//! relay-credential service for STUN/TURN servers.
//!
//! The broker never holds key material. It sees only envelope metadata
//! (sender and recipient public keys) and routes opaque ciphertext.

#![forbid(unsafe_code)]

pub mod relay;
pub mod server;
pub mod tls;
pub mod topic;

pub use relay::{Relay, RelayError, DEFAULT_RELAY_TTL};
pub use server::Broker;
pub use topic::TopicRegistry;
