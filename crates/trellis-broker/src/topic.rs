//! Per-key publish/subscribe topics.
//!
//! Each recipient public key maps to one [`Topic`], a broadcast channel of
//! sealed envelopes. Topics are created lazily on first subscribe and
//! removed again once the last subscriber is gone.
//!
//! Subscriber channels are bounded: a subscriber that stops draining its
//! stream loses its oldest pending envelopes instead of blocking the
//! publisher or growing the queue without limit.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;
use trellis_crypto::Key;
use trellis_proto::Envelope;

/// Pending envelopes per subscriber before the oldest are dropped.
pub const SUBSCRIBER_QUEUE_LENGTH: usize = 128;

/// All topics known to the broker, keyed by recipient public key.
#[derive(Default)]
pub struct TopicRegistry {
    topics: Mutex<HashMap<Key, Topic>>,
}

struct Topic {
    tx: broadcast::Sender<Envelope>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a subscription stream on the topic of `key`, creating the
    /// topic if needed.
    pub fn subscribe(&self, key: &Key) -> broadcast::Receiver<Envelope> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());

        topics
            .entry(*key)
            .or_insert_with(|| Topic {
                tx: broadcast::channel(SUBSCRIBER_QUEUE_LENGTH).0,
            })
            .tx
            .subscribe()
    }

    /// Fan an envelope out to all current subscribers of `key`. Returns
    /// the number of subscribers it reached.
    ///
    /// Publishing to a key nobody subscribes to is not an error; the
    /// envelope is simply dropped.
    pub fn publish(&self, key: &Key, envelope: Envelope) -> usize {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());

        match topics.get(key) {
            Some(topic) => topic.tx.send(envelope).unwrap_or(0),
            None => 0,
        }
    }

    /// Drop the topic of `key` if its last subscriber is gone. Called
    /// after a subscriber's receiver has been dropped.
    pub fn prune(&self, key: &Key) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(topic) = topics.get(key) {
            if topic.tx.receiver_count() == 0 {
                topics.remove(key);
            }
        }
    }

    /// Number of live topics.
    pub fn len(&self) -> usize {
        self.topics.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
