//! Broker connection handling.
//!
//! Each client connection is a length-delimited protobuf frame stream. The
//! reader task owns the connection's subscription set; every subscribed
//! key gets a forwarding task that copies envelopes from the topic into
//! the connection's outbound queue.
//!
//! Ordering guarantee: the topic receiver is opened before the Ack of a
//! Subscribe request is enqueued, so a publisher that observes the Ack
//! cannot race past the subscription.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trellis_crypto::{parse_key_bytes, Key};
use trellis_proto::{
    client_frame, server_frame, Ack, ClientFrame, ErrorCode, ErrorInfo, GetRelaysResp,
    ServerCodec, ServerFrame, SubscribeParams,
};

use crate::relay::Relay;
use crate::topic::TopicRegistry;

/// Outbound frames queued per connection before the reader stalls.
const OUT_QUEUE_LENGTH: usize = 128;

/// Shared broker state: the topic registry and the configured relays.
pub struct Broker {
    topics: TopicRegistry,
    relays: Vec<Relay>,
}

impl Broker {
    pub fn new(relays: Vec<Relay>) -> Arc<Self> {
        Arc::new(Self {
            topics: TopicRegistry::new(),
            relays,
        })
    }

    /// Accept connections until `shutdown` is cancelled.
    pub async fn serve(
        self: &Arc<Self>,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        loop {
            let (stream, addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                () = shutdown.cancelled() => {
                    info!("shutting down");
                    return Ok(());
                }
            };

            debug!(%addr, "accepted connection");

            let broker = Arc::clone(self);
            let tls = tls.clone();
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                let result = match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => broker.handle_connection(stream, shutdown).await,
                        Err(e) => {
                            warn!(%addr, "TLS handshake failed: {e}");
                            return;
                        }
                    },
                    None => broker.handle_connection(stream, shutdown).await,
                };

                match result {
                    Ok(()) => debug!(%addr, "connection closed"),
                    Err(e) => debug!(%addr, "connection failed: {e}"),
                }
            });
        }
    }

    async fn handle_connection<S>(
        self: Arc<Self>,
        stream: S,
        shutdown: CancellationToken,
    ) -> Result<(), trellis_proto::FrameError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut frames) = Framed::new(stream, ServerCodec::new()).split();
        let (out, mut out_rx) = mpsc::channel::<ServerFrame>(OUT_QUEUE_LENGTH);

        let writer: JoinHandle<Result<(), trellis_proto::FrameError>> =
            tokio::spawn(async move {
                while let Some(frame) = out_rx.recv().await {
                    sink.send(frame).await?;
                }
                sink.close().await?;

                Ok(())
            });

        let mut subscriptions: HashMap<Key, JoinHandle<()>> = HashMap::new();

        let result = loop {
            let frame = tokio::select! {
                frame = frames.next() => frame,
                () = shutdown.cancelled() => None,
            };

            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            };

            if self
                .handle_frame(frame, &out, &mut subscriptions)
                .await
                .is_err()
            {
                // The writer is gone; the connection is dead.
                break Ok(());
            }
        };

        for (key, task) in subscriptions.drain() {
            task.abort();
            self.topics.prune(&key);
        }
        drop(out);

        // Writer errors after reader errors add no information.
        if let Ok(Err(e)) = writer.await {
            debug!("writer failed: {e}");
        }

        result
    }

    async fn handle_frame(
        &self,
        frame: ClientFrame,
        out: &mpsc::Sender<ServerFrame>,
        subscriptions: &mut HashMap<Key, JoinHandle<()>>,
    ) -> Result<(), mpsc::error::SendError<ServerFrame>> {
        let seq = frame.seq;

        let reply = match frame.body {
            Some(client_frame::Body::Subscribe(params)) => {
                self.subscribe(seq, params, out, subscriptions)
            }
            Some(client_frame::Body::Unsubscribe(params)) => {
                self.unsubscribe(seq, params, subscriptions)
            }
            Some(client_frame::Body::Publish(envelope)) => {
                match parse_key_bytes(&envelope.recipient)
                    .and_then(|key| parse_key_bytes(&envelope.sender).map(|_| key))
                {
                    Ok(recipient) => {
                        let reached = self.topics.publish(&recipient, envelope);
                        debug!(%recipient, reached, "published envelope");
                        ack(seq)
                    }
                    Err(e) => invalid_argument(seq, format!("invalid key: {e}")),
                }
            }
            Some(client_frame::Body::GetRelays(params)) => {
                match parse_key_bytes(&params.public_key) {
                    Ok(pk) => {
                        let peer = pk.to_string();
                        let now = SystemTime::now();
                        let relays = self
                            .relays
                            .iter()
                            .map(|relay| relay.info(&peer, now))
                            .collect();

                        ServerFrame {
                            seq,
                            body: Some(server_frame::Body::Relays(GetRelaysResp { relays })),
                        }
                    }
                    Err(e) => invalid_argument(seq, format!("invalid public key: {e}")),
                }
            }
            None => invalid_argument(seq, "empty frame".to_string()),
        };

        out.send(reply).await
    }

    fn subscribe(
        &self,
        seq: u64,
        params: SubscribeParams,
        out: &mpsc::Sender<ServerFrame>,
        subscriptions: &mut HashMap<Key, JoinHandle<()>>,
    ) -> ServerFrame {
        let key = match parse_key_bytes(&params.key) {
            Ok(key) => key,
            Err(e) => return invalid_argument(seq, format!("invalid key: {e}")),
        };

        // Subscribing twice to the same key is idempotent.
        if !subscriptions.contains_key(&key) {
            let rx = self.topics.subscribe(&key);
            subscriptions.insert(key, tokio::spawn(forward(key, rx, out.clone())));
            debug!(%key, "subscription opened");
        }

        ack(seq)
    }

    fn unsubscribe(
        &self,
        seq: u64,
        params: SubscribeParams,
        subscriptions: &mut HashMap<Key, JoinHandle<()>>,
    ) -> ServerFrame {
        let key = match parse_key_bytes(&params.key) {
            Ok(key) => key,
            Err(e) => return invalid_argument(seq, format!("invalid key: {e}")),
        };

        match subscriptions.remove(&key) {
            Some(task) => {
                task.abort();
                self.topics.prune(&key);
                debug!(%key, "subscription closed");

                ack(seq)
            }
            None => invalid_argument(seq, format!("not subscribed to {key}")),
        }
    }
}

/// Copy envelopes from a topic into the connection's outbound queue.
async fn forward(
    key: Key,
    mut rx: broadcast::Receiver<trellis_proto::Envelope>,
    out: mpsc::Sender<ServerFrame>,
) {
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                let frame = ServerFrame {
                    seq: 0,
                    body: Some(server_frame::Body::Envelope(envelope)),
                };

                if out.send(frame).await.is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(dropped)) => {
                warn!(%key, dropped, "subscriber too slow, dropped oldest envelopes");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn ack(seq: u64) -> ServerFrame {
    ServerFrame {
        seq,
        body: Some(server_frame::Body::Ack(Ack {})),
    }
}

fn invalid_argument(seq: u64, message: String) -> ServerFrame {
    ServerFrame {
        seq,
        body: Some(server_frame::Body::Error(ErrorInfo {
            code: ErrorCode::InvalidArgument as i32,
            message,
        })),
    }
}
