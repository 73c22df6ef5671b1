//! End-to-end envelope encryption.
//!
//! A [`Message`] is sealed into an [`Envelope`] with a NaCl box (X25519 +
//! XSalsa20-Poly1305) between the sender's private key and the recipient's
//! public key. The broker routes envelopes by their plaintext sender and
//! recipient keys but can never read or forge the contents.

use crypto_box::aead::{Aead, AeadCore, OsRng};
use crypto_box::SalsaBox;
use prost::Message as _;
use thiserror::Error;
use trellis_crypto::{parse_key_bytes, KeyError, KeyPair, PublicKeyPair};

use crate::wire::{EncryptedMessage, Envelope, Message};

/// Length of a NaCl box nonce in bytes.
pub const NONCE_LENGTH: usize = 24;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The envelope is addressed to a different key pair than the one
    /// trying to open it.
    #[error("envelope is not for this key pair")]
    KeyPairMismatch,

    #[error("invalid nonce: expected {NONCE_LENGTH} bytes, got {0}")]
    InvalidNonce(usize),

    /// Decryption failed: the ciphertext was tampered with or sealed for
    /// a different key pair.
    #[error("failed to authenticate message")]
    AuthenticationFailure,

    #[error("envelope has no contents")]
    MissingContents,

    #[error("invalid message: {0}")]
    Schema(#[from] prost::DecodeError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("crypto backend failure: {0}")]
    Backend(String),
}

impl Message {
    /// Seal this message into an envelope from `kp.ours` (private) to
    /// `kp.theirs` (public).
    pub fn seal(&self, kp: &KeyPair) -> Result<Envelope, EnvelopeError> {
        let sk = crypto_box::SecretKey::from(*kp.ours.as_bytes());
        let pk = crypto_box::PublicKey::from(*kp.theirs.as_bytes());

        let nonce = SalsaBox::generate_nonce(&mut OsRng);
        let body = SalsaBox::new(&pk, &sk)
            .encrypt(&nonce, self.encode_to_vec().as_ref())
            .map_err(|e| EnvelopeError::Backend(e.to_string()))?;

        Ok(Envelope {
            sender: kp.ours.public_key().to_vec(),
            recipient: kp.theirs.to_vec(),
            contents: Some(EncryptedMessage {
                body,
                nonce: nonce.to_vec(),
            }),
        })
    }
}

impl Envelope {
    /// The envelope's address, seen from the recipient's side: `ours` is
    /// the recipient key, `theirs` the sender key.
    pub fn public_key_pair(&self) -> Result<PublicKeyPair, KeyError> {
        Ok(PublicKeyPair {
            ours: parse_key_bytes(&self.recipient)?,
            theirs: parse_key_bytes(&self.sender)?,
        })
    }

    /// Open the envelope with `kp.ours` (private) if it is addressed to
    /// this pair, and decode the contained message.
    pub fn open(&self, kp: &KeyPair) -> Result<Message, EnvelopeError> {
        if self.public_key_pair()? != kp.public() {
            return Err(EnvelopeError::KeyPairMismatch);
        }

        let contents = self
            .contents
            .as_ref()
            .ok_or(EnvelopeError::MissingContents)?;

        if contents.nonce.len() != NONCE_LENGTH {
            return Err(EnvelopeError::InvalidNonce(contents.nonce.len()));
        }

        let sk = crypto_box::SecretKey::from(*kp.ours.as_bytes());
        let pk = crypto_box::PublicKey::from(*kp.theirs.as_bytes());

        let plaintext = SalsaBox::new(&pk, &sk)
            .decrypt(
                crypto_box::Nonce::from_slice(&contents.nonce),
                contents.body.as_ref(),
            )
            .map_err(|_| EnvelopeError::AuthenticationFailure)?;

        Ok(Message::decode(&plaintext[..])?)
    }
}
