//! Detached JWS signatures over canonical JSON (JWS-CT).
//!
//! Peer descriptions travel as JSON and may be re-serialized by
//! intermediaries, so signatures are computed over the RFC 8785 canonical
//! form of the payload rather than its wire bytes. The resulting JWS is
//! detached: the payload segment is always empty and the receiver
//! re-canonicalizes the object it already holds.

use base64::engine::general_purpose::URL_SAFE as BASE64_URL;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::key::Key;
use crate::xeddsa::{NONCE_LENGTH, SIGNATURE_LENGTH};

const JWS_ALGORITHM: &str = "XEdDSA-25519";

#[derive(Debug, Error)]
pub enum JwsError {
    #[error("invalid JWS format")]
    InvalidFormat,

    #[error("payload segment in JWS is not empty")]
    NonEmptyPayload,

    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("unsupported curve: {0}")]
    UnsupportedCurve(String),

    #[error("invalid encoding: {0}")]
    InvalidEncoding(#[from] base64::DecodeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct Jwk {
    #[serde(rename = "kty")]
    key_type: String,
    #[serde(rename = "crv")]
    curve: String,
    x: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct JwsHeader {
    #[serde(rename = "alg")]
    algorithm: String,
    jwk: Jwk,
}

fn canonicalize<T: Serialize>(obj: &T) -> Result<String, JwsError> {
    Ok(serde_jcs::to_string(obj)?)
}

/// Sign `obj` with the private key `sk`, returning a detached JWS of the
/// form `base64url(header)..base64url(signature)`.
pub fn jws_ct_sign<T: Serialize>(obj: &T, sk: &Key) -> Result<String, JwsError> {
    let header = JwsHeader {
        algorithm: JWS_ALGORITHM.to_string(),
        jwk: Jwk {
            key_type: "OKP".to_string(),
            curve: "X25519".to_string(),
            x: sk.public_key().to_string(),
        },
    };

    let msg = canonicalize(obj)?;

    let mut nonce = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);

    let sig = sk.sign(msg.as_bytes(), &nonce);
    let header_bytes = serde_json::to_vec(&header)?;

    Ok(format!(
        "{}..{}",
        BASE64_URL.encode(header_bytes),
        BASE64_URL.encode(sig)
    ))
}

/// Verify a detached JWS over `obj` against the public key `pk`.
pub fn jws_ct_verify<T: Serialize>(obj: &T, jws: &str, pk: &Key) -> Result<bool, JwsError> {
    let parts: Vec<&str> = jws.split('.').collect();
    if parts.len() != 3 {
        return Err(JwsError::InvalidFormat);
    }

    if !parts[1].is_empty() {
        return Err(JwsError::NonEmptyPayload);
    }

    let header_bytes = BASE64_URL.decode(parts[0])?;
    let sig_bytes = BASE64_URL.decode(parts[2])?;

    let sig: [u8; SIGNATURE_LENGTH] = sig_bytes
        .as_slice()
        .try_into()
        .map_err(|_| JwsError::InvalidFormat)?;

    let header: JwsHeader = serde_json::from_slice(&header_bytes)?;

    if header.jwk.key_type != "OKP" {
        return Err(JwsError::UnsupportedKeyType(header.jwk.key_type));
    }

    if header.jwk.curve != "X25519" {
        return Err(JwsError::UnsupportedCurve(header.jwk.curve));
    }

    let msg = canonicalize(obj)?;

    Ok(pk.verify(msg.as_bytes(), &sig))
}
