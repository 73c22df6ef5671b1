//! Cryptographic primitives for Trellis.
//!
//! This crate provides:
//! - Curve25519 keys with a base64 text form and X25519 key agreement
//! - XEdDSA signatures (Ed25519-compatible, keyed by a Curve25519 scalar)
//! - Detached JWS signatures over canonical JSON (JWS-CT)
//! - Deterministic link-local addresses derived from public keys
//!
//! Peers are identified by their 32-byte Curve25519 public key. All
//! signaling payloads are sealed between two static keys; see the
//! `trellis-proto` crate for the envelope codec built on top of these
//! primitives.

#![forbid(unsafe_code)]

pub mod addr;
pub mod jws;
mod key;
pub mod xeddsa;

pub use jws::{jws_ct_sign, jws_ct_verify, JwsError};
pub use key::{
    generate_key, generate_key_from_password, generate_private_key, parse_key, parse_key_bytes,
    Key, KeyError, KeyPair, PublicKeyPair, KEY_LENGTH,
};
