//! XEdDSA: Ed25519-compatible signatures keyed by a Curve25519 scalar.
//!
//! Peers own exactly one static Curve25519 key, so signatures have to be
//! made with that key rather than a separate Ed25519 identity. The scheme
//! follows the Signal specification: the Ed25519 public key is derived from
//! the Curve25519 private scalar on the signing side, and recovered from
//! the Montgomery point plus a sign bit carried in the signature on the
//! verifying side.
//!
//! See <https://signal.org/docs/specifications/xeddsa/>.

use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha512};

use crate::key::Key;

/// Length of an XEdDSA signature in bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// Length of the random nonce consumed per signature.
pub const NONCE_LENGTH: usize = 32;

impl Key {
    /// Sign `msg` with this private key.
    ///
    /// `nonce` must be fresh randomness for every signature; reusing a
    /// nonce across two different messages leaks the private key, as with
    /// any Schnorr-style scheme.
    pub fn sign(&self, msg: &[u8], nonce: &[u8; NONCE_LENGTH]) -> [u8; SIGNATURE_LENGTH] {
        let a = Scalar::from_bytes_mod_order(*self.as_bytes());
        let pk = EdwardsPoint::mul_base(&a).compress();

        // Domain separator keeping the r derivation disjoint from any
        // plain Ed25519 use of the same hash.
        let mut diversifier = [0xFFu8; 32];
        diversifier[0] = 0xFE;

        let r_hash: [u8; 64] = Sha512::new()
            .chain_update(diversifier)
            .chain_update(self.as_bytes())
            .chain_update(msg)
            .chain_update(nonce)
            .finalize()
            .into();
        let r = Scalar::from_bytes_mod_order_wide(&r_hash);
        let big_r = EdwardsPoint::mul_base(&r).compress();

        let h_hash: [u8; 64] = Sha512::new()
            .chain_update(big_r.as_bytes())
            .chain_update(pk.as_bytes())
            .chain_update(msg)
            .finalize()
            .into();
        let h = Scalar::from_bytes_mod_order_wide(&h_hash);

        let s = r + h * a;

        let mut sig = [0u8; SIGNATURE_LENGTH];
        sig[..32].copy_from_slice(big_r.as_bytes());
        sig[32..].copy_from_slice(&s.to_bytes());

        // Carry the sign bit of the Ed25519 public key in the otherwise
        // unused high bit of s, so verifiers can reconstruct A exactly.
        sig[63] |= pk.as_bytes()[31] & 0x80;

        sig
    }

    /// Verify an XEdDSA signature against this public key.
    pub fn verify(&self, msg: &[u8], sig: &[u8; SIGNATURE_LENGTH]) -> bool {
        // Convert the Montgomery u-coordinate into the Edwards point with
        // the sign bit recovered from the signature.
        let mut u = *self.as_bytes();
        u[31] &= 0x7F;

        let sign = (sig[63] & 0x80) >> 7;
        let Some(point) = MontgomeryPoint(u).to_edwards(sign) else {
            return false;
        };

        let Ok(vk) = VerifyingKey::from_bytes(&point.compress().to_bytes()) else {
            return false;
        };

        let mut sig = *sig;
        sig[63] &= 0x7F;

        vk.verify(msg, &Signature::from_bytes(&sig)).is_ok()
    }
}
