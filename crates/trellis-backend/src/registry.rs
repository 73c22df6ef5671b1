//! Local subscription registry.
//!
//! The registry maps each of our own key pairs to the message handlers
//! interested in messages addressed to it, keyed by the sender's public
//! key. The all-zero key subscribes a handler to every sender (wildcard).
//!
//! [`new_message`](SubscriptionsRegistry::new_message) is the inbound
//! path shared by all backends: it looks up the subscription for the
//! envelope's recipient, decrypts, and dispatches to the wildcard and
//! exact-sender handlers.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use tracing::{debug, error};
use trellis_crypto::{Key, KeyPair, PublicKeyPair};
use trellis_proto::{Envelope, Message};

use crate::BackendError;

/// Receives decrypted signaling messages.
///
/// Handlers are called synchronously on the backend's receive path and
/// must not block. A panicking handler is caught and logged; it does not
/// take down the backend or starve other handlers.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, pkp: &PublicKeyPair, msg: &Message);
}

struct Subscription {
    /// Our private key, used to open envelopes addressed to us.
    sk: Key,

    /// Handlers by sender public key. `Key::default()` is the wildcard.
    handlers: HashMap<Key, Vec<Arc<dyn MessageHandler>>>,
}

impl Subscription {
    fn dispatch(&self, pkp: &PublicKeyPair, msg: &Message, sender: &Key) -> usize {
        let mut dispatched = 0;

        for key in [&Key::default(), sender] {
            for handler in self.handlers.get(key).into_iter().flatten() {
                dispatched += 1;

                if catch_unwind(AssertUnwindSafe(|| handler.on_message(pkp, msg))).is_err() {
                    error!(sender = %pkp.theirs, "message handler panicked");
                }
            }
        }

        dispatched
    }
}

/// All active subscriptions, keyed by our public key.
#[derive(Default)]
pub struct SubscriptionsRegistry {
    subs: RwLock<HashMap<Key, Subscription>>,
}

impl SubscriptionsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for messages from `kp.theirs` (or every sender,
    /// if `kp.theirs` is the zero key) addressed to `kp.ours`.
    ///
    /// Returns true if this created the subscription for `kp.ours`, i.e.
    /// the caller should open a server-side stream for it. Registering
    /// the same handler twice is a no-op.
    pub fn subscribe(&self, kp: &KeyPair, handler: Arc<dyn MessageHandler>) -> bool {
        let pk = kp.ours.public_key();
        let mut subs = self.subs.write().unwrap_or_else(|e| e.into_inner());

        let (sub, first) = match subs.get_mut(&pk) {
            Some(sub) => (sub, false),
            None => (
                subs.entry(pk).or_insert_with(|| Subscription {
                    sk: kp.ours,
                    handlers: HashMap::new(),
                }),
                true,
            ),
        };

        let handlers = sub.handlers.entry(kp.theirs).or_default();
        if !handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            handlers.push(handler);
        }

        first
    }

    /// Remove `handler` from the subscription of `kp.ours`.
    ///
    /// Returns true if this removed the last handler of the subscription,
    /// i.e. the caller should close the server-side stream. The
    /// subscription itself is dropped in that case.
    pub fn unsubscribe(
        &self,
        kp: &KeyPair,
        handler: &Arc<dyn MessageHandler>,
    ) -> Result<bool, BackendError> {
        let pk = kp.ours.public_key();
        let mut subs = self.subs.write().unwrap_or_else(|e| e.into_inner());

        let sub = subs.get_mut(&pk).ok_or(BackendError::NotSubscribed)?;

        if let Some(handlers) = sub.handlers.get_mut(&kp.theirs) {
            handlers.retain(|h| !Arc::ptr_eq(h, handler));
            if handlers.is_empty() {
                sub.handlers.remove(&kp.theirs);
            }
        }

        let last = sub.handlers.is_empty();
        if last {
            subs.remove(&pk);
        }

        Ok(last)
    }

    /// Decrypt an inbound envelope and dispatch it. Returns the number of
    /// handlers reached.
    ///
    /// Envelopes for keys we never subscribed fail with
    /// [`BackendError::NotSubscribed`]; a broken or forged envelope fails
    /// with the underlying envelope error.
    pub fn new_message(&self, envelope: &Envelope) -> Result<usize, BackendError> {
        let pkp = envelope.public_key_pair()?;

        let subs = self.subs.read().unwrap_or_else(|e| e.into_inner());
        let sub = subs.get(&pkp.ours).ok_or(BackendError::NotSubscribed)?;

        let kp = KeyPair::new(sub.sk, pkp.theirs);
        let msg = envelope.open(&kp)?;

        debug!(sender = %pkp.theirs, "received signaling message");

        Ok(sub.dispatch(&kp.public(), &msg, &pkp.theirs))
    }

    /// Public keys of all active subscriptions, e.g. to re-subscribe
    /// after a reconnect.
    pub fn public_keys(&self) -> Vec<Key> {
        self.subs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }
}
