//! Signaling backends for Trellis peers.
//!
//! A [`Backend`] moves sealed envelopes between peers. Backends are
//! selected by URL scheme:
//! - `grpc://host:port` — the broker-backed backend ([`GrpcBackend`])
//! - `inprocess:` — a process-local loopback, mostly for tests
//!
//! All backends share the [`SubscriptionsRegistry`] dispatch model: a
//! handler subscribes for messages from one sender (or all senders, with
//! the zero key) addressed to one of our key pairs.

#![forbid(unsafe_code)]

mod endpoint;

pub mod grpc;
pub mod inprocess;
pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use trellis_crypto::{KeyError, KeyPair};
use trellis_proto::{EnvelopeError, FrameError, Message};
use url::Url;

pub use grpc::GrpcBackend;
pub use inprocess::InprocessBackend;
pub use registry::{MessageHandler, SubscriptionsRegistry};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unknown backend type {0:?}")]
    UnknownScheme(String),

    #[error("invalid backend configuration: {0}")]
    Config(String),

    #[error("missing subscription")]
    NotSubscribed,

    #[error("not connected to broker")]
    NotConnected,

    #[error("backend is closed")]
    Closed,

    #[error("broker rejected request: {0}")]
    Rejected(String),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Notified once the backend is ready to publish and receive.
pub trait ReadyHandler: Send + Sync {
    fn on_ready(&self);
}

/// How to construct a backend: the endpoint URL and the handlers to
/// notify once it is ready.
pub struct BackendConfig {
    pub uri: Url,
    pub on_ready: Vec<Box<dyn ReadyHandler>>,
}

/// A transport for sealed signaling envelopes.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Seal `msg` with `kp` and deliver it to the subscribers of
    /// `kp.theirs`.
    async fn publish(&self, kp: &KeyPair, msg: &Message) -> Result<(), BackendError>;

    /// Register `handler` for messages from `kp.theirs` to `kp.ours`.
    /// Returns true if this opened the subscription for `kp.ours`.
    async fn subscribe(
        &self,
        kp: &KeyPair,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<bool, BackendError>;

    /// Remove `handler`. Returns true if this closed the subscription for
    /// `kp.ours`; the server-side stream is cancelled in that case.
    async fn unsubscribe(
        &self,
        kp: &KeyPair,
        handler: &Arc<dyn MessageHandler>,
    ) -> Result<bool, BackendError>;

    /// Tear the backend down. Pending requests fail with
    /// [`BackendError::Closed`].
    async fn close(&self) -> Result<(), BackendError>;
}

/// Construct a backend from its configuration, selected by URL scheme.
pub fn new_backend(config: BackendConfig) -> Result<Arc<dyn Backend>, BackendError> {
    match config.uri.scheme() {
        "grpc" => Ok(Arc::new(GrpcBackend::new(config)?)),
        "inprocess" => Ok(Arc::new(InprocessBackend::new(config))),
        other => Err(BackendError::UnknownScheme(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_scheme_is_rejected() {
        let result = new_backend(BackendConfig {
            uri: Url::parse("carrier-pigeon://loft").unwrap(),
            on_ready: Vec::new(),
        });

        assert!(matches!(result, Err(BackendError::UnknownScheme(s)) if s == "carrier-pigeon"));
    }
}
