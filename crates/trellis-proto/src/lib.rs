//! Wire schema and codecs for the Trellis signaling plane.
//!
//! This crate provides:
//! - The protobuf message set exchanged between peers and the broker
//!   (field numbers are wire-compatible with existing deployments)
//! - The end-to-end envelope encryption between two static Curve25519 keys
//! - The length-delimited frame codec used on broker connections
//!
//! The broker only ever sees [`Envelope`] values: opaque sealed bytes plus
//! the sender and recipient public keys it routes by. Plaintext
//! [`Message`] values exist only at the two endpoints.

#![forbid(unsafe_code)]

pub mod envelope;
pub mod frame;
mod wire;

pub use envelope::EnvelopeError;
pub use frame::{ClientCodec, FrameError, ProtoCodec, ServerCodec, MAX_FRAME_LENGTH};
pub use wire::*;
