//! In-process loopback backend.
//!
//! All backends in the process share one registry, so peers inside a
//! single daemon can signal each other without a broker. Messages still
//! go through the full seal/open path.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use trellis_crypto::KeyPair;
use trellis_proto::Message;

use crate::registry::{MessageHandler, SubscriptionsRegistry};
use crate::{Backend, BackendConfig, BackendError};

fn shared() -> &'static SubscriptionsRegistry {
    static SHARED: OnceLock<SubscriptionsRegistry> = OnceLock::new();
    SHARED.get_or_init(SubscriptionsRegistry::new)
}

pub struct InprocessBackend;

impl InprocessBackend {
    pub fn new(config: BackendConfig) -> Self {
        for handler in &config.on_ready {
            handler.on_ready();
        }

        Self
    }
}

#[async_trait]
impl Backend for InprocessBackend {
    async fn publish(&self, kp: &KeyPair, msg: &Message) -> Result<(), BackendError> {
        let envelope = msg.seal(kp)?;
        shared().new_message(&envelope)?;

        Ok(())
    }

    async fn subscribe(
        &self,
        kp: &KeyPair,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<bool, BackendError> {
        Ok(shared().subscribe(kp, handler))
    }

    async fn unsubscribe(
        &self,
        kp: &KeyPair,
        handler: &Arc<dyn MessageHandler>,
    ) -> Result<bool, BackendError> {
        shared().unsubscribe(kp, handler)
    }

    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use trellis_crypto::{generate_private_key, PublicKeyPair};
    use trellis_proto::Credentials;
    use url::Url;

    use super::*;
    use crate::new_backend;

    #[derive(Default)]
    struct Recorder {
        ufrags: Mutex<Vec<String>>,
    }

    impl MessageHandler for Recorder {
        fn on_message(&self, _pkp: &PublicKeyPair, msg: &Message) {
            if let Some(creds) = &msg.credentials {
                self.ufrags.lock().unwrap().push(creds.ufrag.clone());
            }
        }
    }

    #[tokio::test]
    async fn loopback_roundtrip() {
        let backend = new_backend(BackendConfig {
            uri: Url::parse("inprocess:").unwrap(),
            on_ready: Vec::new(),
        })
        .unwrap();

        let alice = generate_private_key();
        let bob = generate_private_key();

        let handler = Arc::new(Recorder::default());
        let bob_kp = KeyPair::new(bob, alice.public_key());
        backend
            .subscribe(&bob_kp, Arc::clone(&handler) as Arc<dyn MessageHandler>)
            .await
            .unwrap();

        let msg = Message {
            credentials: Some(Credentials {
                ufrag: "loopback".into(),
                pwd: "p".into(),
                need_creds: false,
            }),
            ..Default::default()
        };
        backend
            .publish(&KeyPair::new(alice, bob.public_key()), &msg)
            .await
            .unwrap();

        assert_eq!(*handler.ufrags.lock().unwrap(), vec!["loopback"]);

        let h = Arc::clone(&handler) as Arc<dyn MessageHandler>;
        assert!(backend.unsubscribe(&bob_kp, &h).await.unwrap());
    }

    #[tokio::test]
    async fn publish_without_subscriber_fails() {
        let backend = InprocessBackend::new(BackendConfig {
            uri: Url::parse("inprocess:").unwrap(),
            on_ready: Vec::new(),
        });

        let alice = generate_private_key();
        let nobody = generate_private_key();

        let result = backend
            .publish(
                &KeyPair::new(alice, nobody.public_key()),
                &Message::default(),
            )
            .await;

        assert!(matches!(result, Err(BackendError::NotSubscribed)));
    }
}
