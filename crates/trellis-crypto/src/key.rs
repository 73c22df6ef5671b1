//! Curve25519 keys and key pairs.
//!
//! A [`Key`] is a raw 32-byte Curve25519 scalar or point. The text form is
//! standard base64 with padding (44 characters ending in `=`), matching the
//! WireGuard convention, so keys can be copied verbatim between tools.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha512;
use thiserror::Error;

/// Length of a Curve25519 key in bytes.
pub const KEY_LENGTH: usize = 32;

/// Salt for [`generate_key_from_password`]. Fixed so that the same
/// passphrase always yields the same key on every host.
const PASSWORD_SALT: [u8; 21] = [
    0x77, 0x31, 0x63, 0x33, 0x63, 0x30, 0x6e, 0x6e, 0x33, 0x63, 0x74, 0x73, 0x33, 0x76, 0x65,
    0x72, 0x79, 0x62, 0x30, 0x64, 0x79,
];

const PASSWORD_ITERATIONS: u32 = 4096;

/// Errors raised by key parsing and signature verification.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid encoding: {0}")]
    InvalidEncoding(#[from] base64::DecodeError),

    #[error("invalid length: expected {KEY_LENGTH} bytes, got {0}")]
    InvalidLength(usize),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("crypto backend failure: {0}")]
    Backend(String),
}

/// A raw Curve25519 key, either a private scalar or a public point.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Key(pub(crate) [u8; KEY_LENGTH]);

/// Parse a key from its standard-base64 text form.
pub fn parse_key(s: &str) -> Result<Key, KeyError> {
    let bytes = BASE64.decode(s)?;
    parse_key_bytes(&bytes)
}

/// Parse a key from raw bytes. Fails unless exactly 32 bytes are given.
pub fn parse_key_bytes(buf: &[u8]) -> Result<Key, KeyError> {
    let bytes: [u8; KEY_LENGTH] = buf
        .try_into()
        .map_err(|_| KeyError::InvalidLength(buf.len()))?;

    Ok(Key(bytes))
}

/// Clamp a scalar for use as a Curve25519 private key.
///
/// See <https://cr.yp.to/ecdh.html>.
fn clamp(bytes: &mut [u8; KEY_LENGTH]) {
    bytes[0] &= 248;
    bytes[31] &= 127;
    bytes[31] |= 64;
}

/// Generate a random unclamped key, e.g. for use as a pre-shared key.
pub fn generate_key() -> Key {
    let mut bytes = [0u8; KEY_LENGTH];
    OsRng.fill_bytes(&mut bytes);

    Key(bytes)
}

/// Generate a random Curve25519 private key.
pub fn generate_private_key() -> Key {
    let mut key = generate_key();
    clamp(&mut key.0);

    key
}

/// Derive a Curve25519 private key from a passphrase.
///
/// PBKDF2-HMAC-SHA512 with a fixed salt and 4096 iterations, clamped.
pub fn generate_key_from_password(password: &str) -> Key {
    let mut bytes = [0u8; KEY_LENGTH];
    pbkdf2::pbkdf2_hmac::<Sha512>(
        password.as_bytes(),
        &PASSWORD_SALT,
        PASSWORD_ITERATIONS,
        &mut bytes,
    );
    clamp(&mut bytes);

    Key(bytes)
}

impl Key {
    /// Derive the Curve25519 public key of a private key.
    pub fn public_key(&self) -> Key {
        let sk = x25519_dalek::StaticSecret::from(self.0);
        let pk = x25519_dalek::PublicKey::from(&sk);

        Key(*pk.as_bytes())
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// True iff any byte of the key is non-zero.
    ///
    /// The all-zero key is reserved as the wildcard in subscription
    /// registries and never appears as a real key.
    pub fn is_set(&self) -> bool {
        *self != Key::default()
    }
}

impl From<[u8; KEY_LENGTH]> for Key {
    fn from(bytes: [u8; KEY_LENGTH]) -> Self {
        Key(bytes)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BASE64.encode(self.0))
    }
}

// Keys appear in log output constantly. Debug printing the 44-char base64
// form keeps `tracing` fields readable.
impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({self})")
    }
}

impl FromStr for Key {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_key(s)
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_key(&s).map_err(serde::de::Error::custom)
    }
}

/// A private/public key pair: our private scalar and their public point.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct KeyPair {
    pub ours: Key,
    pub theirs: Key,
}

/// The public projection of a [`KeyPair`]: both fields are public points.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct PublicKeyPair {
    pub ours: Key,
    pub theirs: Key,
}

impl KeyPair {
    pub fn new(ours: Key, theirs: Key) -> Self {
        Self { ours, theirs }
    }

    /// X25519 shared secret between our private key and their public key.
    pub fn shared(&self) -> Key {
        let sk = x25519_dalek::StaticSecret::from(self.ours.0);
        let pk = x25519_dalek::PublicKey::from(self.theirs.0);

        Key(*sk.diffie_hellman(&pk).as_bytes())
    }

    pub fn public(&self) -> PublicKeyPair {
        PublicKeyPair {
            ours: self.ours.public_key(),
            theirs: self.theirs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrip() {
        let key = generate_private_key();
        let text = key.to_string();

        // 32 bytes of padded base64 is always 44 characters ending in '='.
        assert_eq!(text.len(), 44);
        assert!(text.ends_with('='));

        let parsed = parse_key(&text).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(matches!(
            parse_key("this is not base64!!"),
            Err(KeyError::InvalidEncoding(_))
        ));

        // Valid base64 but only 3 bytes.
        assert!(matches!(
            parse_key("AQEB"),
            Err(KeyError::InvalidLength(3))
        ));
    }

    #[test]
    fn private_keys_are_clamped() {
        for _ in 0..16 {
            let key = generate_private_key();
            assert_eq!(key.0[0] & 0b111, 0);
            assert_eq!(key.0[31] & 0x80, 0);
            assert_eq!(key.0[31] & 0x40, 0x40);
        }
    }

    #[test]
    fn password_key_is_deterministic_and_clamped() {
        let a = generate_key_from_password("trellis");
        let b = generate_key_from_password("trellis");
        let c = generate_key_from_password("other");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.0[0] & 0b111, 0);
        assert_eq!(a.0[31] & 0xC0, 0x40);
    }

    #[test]
    fn shared_secret_is_symmetric() {
        let sk1 = generate_private_key();
        let sk2 = generate_private_key();

        let kp1 = KeyPair::new(sk1, sk2.public_key());
        let kp2 = KeyPair::new(sk2, sk1.public_key());

        assert_eq!(kp1.shared(), kp2.shared());
    }

    #[test]
    fn public_pair_projection() {
        let sk = generate_private_key();
        let theirs = generate_private_key().public_key();
        let kp = KeyPair::new(sk, theirs);

        let pkp = kp.public();
        assert_eq!(pkp.ours, sk.public_key());
        assert_eq!(pkp.theirs, theirs);
    }

    #[test]
    fn is_set() {
        assert!(!Key::default().is_set());
        assert!(generate_private_key().is_set());
    }

    #[test]
    fn serde_text_form() {
        let key = generate_private_key();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{key}\""));

        let back: Key = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
