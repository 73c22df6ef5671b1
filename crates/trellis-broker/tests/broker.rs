//! End-to-end tests: broker plus broker-backed backends on a loopback
//! socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use trellis_backend::{new_backend, Backend, BackendConfig, MessageHandler};
use trellis_broker::{Broker, Relay};
use trellis_crypto::{generate_private_key, Key, KeyPair, PublicKeyPair};
use trellis_proto::{
    client_frame, server_frame, ClientCodec, ClientFrame, Credentials, Message,
};
use url::Url;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_broker(relays: Vec<Relay>) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = CancellationToken::new();
    let broker = Broker::new(relays);
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move { broker.serve(listener, None, shutdown).await }
    });

    (addr, shutdown)
}

async fn connect_backend(addr: SocketAddr) -> Arc<dyn Backend> {
    new_backend(BackendConfig {
        uri: Url::parse(&format!("grpc://{addr}?insecure=true")).unwrap(),
        on_ready: Vec::new(),
    })
    .unwrap()
}

struct Recorder {
    tx: mpsc::UnboundedSender<(PublicKeyPair, Message)>,
}

impl Recorder {
    fn new() -> (Arc<dyn MessageHandler>, mpsc::UnboundedReceiver<(PublicKeyPair, Message)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder { tx }), rx)
    }
}

impl MessageHandler for Recorder {
    fn on_message(&self, pkp: &PublicKeyPair, msg: &Message) {
        let _ = self.tx.send((*pkp, msg.clone()));
    }
}

fn credentials(ufrag: &str) -> Message {
    Message {
        credentials: Some(Credentials {
            ufrag: ufrag.to_string(),
            pwd: "pwd".to_string(),
            need_creds: false,
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn round_trip_between_two_peers() {
    let (addr, _shutdown) = start_broker(Vec::new()).await;

    let alice = generate_private_key();
    let bob = generate_private_key();

    let alice_backend = connect_backend(addr).await;
    let bob_backend = connect_backend(addr).await;

    let (handler, mut inbox) = Recorder::new();
    bob_backend
        .subscribe(&KeyPair::new(bob, alice.public_key()), handler)
        .await
        .unwrap();

    // Subscribe resolved with the broker's ack, so this publish cannot
    // overtake the subscription.
    alice_backend
        .publish(&KeyPair::new(alice, bob.public_key()), &credentials("a1"))
        .await
        .unwrap();

    let (pkp, msg) = timeout(RECV_TIMEOUT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(pkp.theirs, alice.public_key());
    assert_eq!(pkp.ours, bob.public_key());
    assert_eq!(msg.credentials.unwrap().ufrag, "a1");
}

#[tokio::test]
async fn wildcard_handler_receives_from_all_senders() {
    let (addr, _shutdown) = start_broker(Vec::new()).await;

    let bob = generate_private_key();
    let alice = generate_private_key();
    let carol = generate_private_key();

    let bob_backend = connect_backend(addr).await;
    let (handler, mut inbox) = Recorder::new();
    bob_backend
        .subscribe(&KeyPair::new(bob, Key::default()), handler)
        .await
        .unwrap();

    let sender_backend = connect_backend(addr).await;
    sender_backend
        .publish(&KeyPair::new(alice, bob.public_key()), &credentials("from-alice"))
        .await
        .unwrap();
    sender_backend
        .publish(&KeyPair::new(carol, bob.public_key()), &credentials("from-carol"))
        .await
        .unwrap();

    let mut senders = Vec::new();
    for _ in 0..2 {
        let (pkp, _) = timeout(RECV_TIMEOUT, inbox.recv()).await.unwrap().unwrap();
        senders.push(pkp.theirs);
    }
    assert!(senders.contains(&alice.public_key()));
    assert!(senders.contains(&carol.public_key()));
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let (addr, _shutdown) = start_broker(Vec::new()).await;

    let alice = generate_private_key();
    let bob = generate_private_key();
    let kp = KeyPair::new(bob, alice.public_key());

    let bob_backend = connect_backend(addr).await;
    let (handler, mut inbox) = Recorder::new();
    bob_backend.subscribe(&kp, Arc::clone(&handler)).await.unwrap();

    // Removing the last handler cancels the server-side stream.
    assert!(bob_backend.unsubscribe(&kp, &handler).await.unwrap());

    let alice_backend = connect_backend(addr).await;
    alice_backend
        .publish(&KeyPair::new(alice, bob.public_key()), &credentials("late"))
        .await
        .unwrap();

    assert!(
        timeout(Duration::from_millis(500), inbox.recv()).await.is_err(),
        "no message must be delivered after unsubscribe"
    );
}

// A hostile client can publish arbitrary envelopes; the broker routes
// them blindly and the receiving backend must reject them.
#[tokio::test]
async fn forged_envelopes_are_dropped_by_the_receiver() {
    let (addr, _shutdown) = start_broker(Vec::new()).await;

    let alice = generate_private_key();
    let bob = generate_private_key();
    let carol = generate_private_key();

    let bob_backend = connect_backend(addr).await;
    let (handler, mut inbox) = Recorder::new();
    bob_backend
        .subscribe(&KeyPair::new(bob, Key::default()), handler)
        .await
        .unwrap();

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut raw = Framed::new(stream, ClientCodec::new());

    // Tampered ciphertext under a valid address.
    let mut tampered = credentials("evil")
        .seal(&KeyPair::new(alice, bob.public_key()))
        .unwrap();
    tampered.contents.as_mut().unwrap().body[0] ^= 0xFF;

    // Sealed for carol but addressed to bob.
    let mut misdirected = credentials("evil")
        .seal(&KeyPair::new(alice, carol.public_key()))
        .unwrap();
    misdirected.recipient = bob.public_key().to_vec();

    for (seq, envelope) in [(1, tampered), (2, misdirected)] {
        raw.send(ClientFrame {
            seq,
            body: Some(client_frame::Body::Publish(envelope)),
        })
        .await
        .unwrap();

        // The broker cannot tell and acks both.
        let reply = raw.next().await.unwrap().unwrap();
        assert_eq!(reply.seq, seq);
        assert!(matches!(reply.body, Some(server_frame::Body::Ack(_))));
    }

    assert!(
        timeout(Duration::from_millis(500), inbox.recv()).await.is_err(),
        "forged envelopes must not reach handlers"
    );
}

#[tokio::test]
async fn publish_with_malformed_key_is_rejected() {
    let (addr, _shutdown) = start_broker(Vec::new()).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut raw = Framed::new(stream, ClientCodec::new());

    let mut envelope = credentials("x").seal(&KeyPair::new(
        generate_private_key(),
        generate_private_key().public_key(),
    ))
    .unwrap();
    envelope.recipient.truncate(5);

    raw.send(ClientFrame {
        seq: 9,
        body: Some(client_frame::Body::Publish(envelope)),
    })
    .await
    .unwrap();

    let reply = raw.next().await.unwrap().unwrap();
    assert_eq!(reply.seq, 9);
    assert!(matches!(reply.body, Some(server_frame::Body::Error(_))));
}

#[tokio::test]
async fn relay_credentials_are_minted_per_peer() {
    let relays = vec![
        Relay::parse("stun:stun.example.org").unwrap(),
        Relay::parse("turn:turn.example.org?secret=tops3cret&ttl=30m").unwrap(),
    ];
    let (addr, _shutdown) = start_broker(relays).await;

    let pk = generate_private_key().public_key();

    let backend = trellis_backend::GrpcBackend::new(BackendConfig {
        uri: Url::parse(&format!("grpc://{addr}?insecure=true")).unwrap(),
        on_ready: Vec::new(),
    })
    .unwrap();

    let relays = backend.get_relays(&pk).await.unwrap();
    assert_eq!(relays.len(), 2);

    let stun = &relays[0];
    assert_eq!(stun.url, "stun:stun.example.org:3478");
    assert!(stun.username.is_empty());
    assert!(stun.expires.is_none());

    let turn = &relays[1];
    assert_eq!(turn.url, "turn:turn.example.org:3478");
    assert!(turn.username.ends_with(&format!(":{pk}")));
    assert!(!turn.password.is_empty());
    assert!(turn.expires.is_some());
}

// While the broker is unreachable, subscribe and publish neither fail
// nor resolve early: they stay queued, the backend keeps redialing, and
// both complete against the broker once it comes up.
#[tokio::test]
async fn commands_issued_while_disconnected_complete_after_redial() {
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = reserved.local_addr().unwrap();
    drop(reserved);

    let alice = generate_private_key();
    let bob = generate_private_key();

    let backend = connect_backend(addr).await;
    let (handler, mut inbox) = Recorder::new();

    let subscribed = tokio::spawn({
        let backend = Arc::clone(&backend);
        let kp = KeyPair::new(bob, alice.public_key());
        async move { backend.subscribe(&kp, handler).await }
    });
    let published = tokio::spawn({
        let backend = Arc::clone(&backend);
        let kp = KeyPair::new(alice, bob.public_key());
        async move { backend.publish(&kp, &credentials("queued")).await }
    });

    // Let several dial attempts fail while both commands are pending.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        !subscribed.is_finished(),
        "subscribe must not resolve without a broker ack"
    );
    assert!(
        !published.is_finished(),
        "publish must not resolve without a broker ack"
    );

    let listener = TcpListener::bind(addr).await.unwrap();
    let shutdown = CancellationToken::new();
    let broker = Broker::new(Vec::new());
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move { broker.serve(listener, None, shutdown).await }
    });

    let first = timeout(Duration::from_secs(10), subscribed)
        .await
        .expect("backend must redial while commands are pending")
        .unwrap()
        .unwrap();
    assert!(first);
    timeout(Duration::from_secs(10), published)
        .await
        .expect("queued publish must go through after the redial")
        .unwrap()
        .unwrap();

    let (_, msg) = timeout(RECV_TIMEOUT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(msg.credentials.unwrap().ufrag, "queued");
}

#[tokio::test]
async fn backend_reconnects_and_restores_subscriptions() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let first = CancellationToken::new();
    let broker = Broker::new(Vec::new());
    let serving = tokio::spawn({
        let first = first.clone();
        async move { broker.serve(listener, None, first).await }
    });

    let alice = generate_private_key();
    let bob = generate_private_key();

    let bob_backend = connect_backend(addr).await;
    let (handler, mut inbox) = Recorder::new();
    bob_backend
        .subscribe(&KeyPair::new(bob, alice.public_key()), handler)
        .await
        .unwrap();

    // Kill the broker and bring a fresh one up on the same port.
    first.cancel();
    serving.await.unwrap().unwrap();

    let listener = TcpListener::bind(addr).await.unwrap();
    let second = CancellationToken::new();
    let broker = Broker::new(Vec::new());
    tokio::spawn({
        let second = second.clone();
        async move { broker.serve(listener, None, second).await }
    });

    // The publisher also reconnects; retry until its publish goes
    // through, then the restored subscription must deliver.
    let alice_backend = connect_backend(addr).await;
    let kp = KeyPair::new(alice, bob.public_key());
    let published = timeout(Duration::from_secs(30), async {
        loop {
            if alice_backend.publish(&kp, &credentials("again")).await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    })
    .await;
    assert!(published.is_ok(), "publish must succeed after reconnect");

    // Bob's backend may still be mid-reconnect when the first publish
    // lands; keep publishing until the message arrives.
    let delivered = timeout(Duration::from_secs(30), async {
        loop {
            match timeout(Duration::from_millis(500), inbox.recv()).await {
                Ok(Some((_, msg))) => return msg,
                _ => {
                    let _ = alice_backend.publish(&kp, &credentials("again")).await;
                }
            }
        }
    })
    .await
    .expect("subscription must be restored after reconnect");

    assert_eq!(delivered.credentials.unwrap().ufrag, "again");
}
