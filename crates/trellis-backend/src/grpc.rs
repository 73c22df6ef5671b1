//! Broker-backed signaling backend.
//!
//! One supervisor task owns the framed connection to the broker. It
//! reconnects under exponential backoff, re-subscribes every key in the
//! local registry after each reconnect, and fires the ready handlers once
//! after the first successful connect.
//!
//! Requests from [`GrpcBackend`] travel to the supervisor over a command
//! channel; each command carries a oneshot for its reply, matched to the
//! broker's response frame by sequence number. Subscribing waits for the
//! broker's Ack so that a Publish issued afterwards cannot overtake the
//! subscription. While the supervisor is dialing, commands stay queued in
//! the channel and resolve only once a session is up, so that guarantee
//! also holds across reconnects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trellis_common::{retry, ExponentialBackOff};
use trellis_crypto::{Key, KeyPair};
use trellis_proto::{
    client_frame, server_frame, ClientCodec, ClientFrame, Envelope, GetRelaysParams, Message,
    RelayInfo, ServerFrame, SubscribeParams,
};

use crate::endpoint::{Endpoint, Stream};
use crate::registry::{MessageHandler, SubscriptionsRegistry};
use crate::{Backend, BackendConfig, BackendError, ReadyHandler};

const COMMAND_QUEUE_LENGTH: usize = 64;

/// Signaling backend speaking the broker's framed protocol.
pub struct GrpcBackend {
    registry: Arc<SubscriptionsRegistry>,
    cmds: mpsc::Sender<Command>,
    cancel: CancellationToken,
}

enum Command {
    Subscribe { key: Key, done: Done },
    Unsubscribe { key: Key, done: Done },
    Publish { envelope: Envelope, done: Done },
    GetRelays { key: Key, done: Done },
}

enum Response {
    Ack,
    Relays(Vec<RelayInfo>),
}

type Done = oneshot::Sender<Result<Response, BackendError>>;

impl GrpcBackend {
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let endpoint = Endpoint::parse(&config.uri)?;
        let registry = Arc::new(SubscriptionsRegistry::new());
        let cancel = CancellationToken::new();
        let (cmds, cmd_rx) = mpsc::channel(COMMAND_QUEUE_LENGTH);

        tokio::spawn(supervise(
            endpoint,
            Arc::clone(&registry),
            cmd_rx,
            config.on_ready,
            cancel.clone(),
        ));

        Ok(Self {
            registry,
            cmds,
            cancel,
        })
    }

    /// STUN/TURN servers the broker advertises for `pk`, with minted
    /// credentials where applicable.
    pub async fn get_relays(&self, pk: &Key) -> Result<Vec<RelayInfo>, BackendError> {
        match self
            .request(|done| Command::GetRelays { key: *pk, done })
            .await?
        {
            Response::Relays(relays) => Ok(relays),
            Response::Ack => Err(BackendError::Rejected("unexpected ack".to_string())),
        }
    }

    async fn request(
        &self,
        command: impl FnOnce(Done) -> Command,
    ) -> Result<Response, BackendError> {
        let (done, reply) = oneshot::channel();

        self.cmds
            .send(command(done))
            .await
            .map_err(|_| BackendError::Closed)?;

        reply.await.map_err(|_| BackendError::Closed)?
    }
}

#[async_trait]
impl Backend for GrpcBackend {
    async fn publish(&self, kp: &KeyPair, msg: &Message) -> Result<(), BackendError> {
        let envelope = msg.seal(kp)?;

        self.request(|done| Command::Publish { envelope, done })
            .await?;

        Ok(())
    }

    async fn subscribe(
        &self,
        kp: &KeyPair,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<bool, BackendError> {
        let first = self.registry.subscribe(kp, handler);

        if first {
            let key = kp.ours.public_key();
            self.request(|done| Command::Subscribe { key, done }).await?;
        }

        Ok(first)
    }

    async fn unsubscribe(
        &self,
        kp: &KeyPair,
        handler: &Arc<dyn MessageHandler>,
    ) -> Result<bool, BackendError> {
        let last = self.registry.unsubscribe(kp, handler)?;

        if last {
            let key = kp.ours.public_key();
            self.request(|done| Command::Unsubscribe { key, done })
                .await?;
        }

        Ok(last)
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.cancel.cancel();

        Ok(())
    }
}

impl Drop for GrpcBackend {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Exit {
    Closed,
    Lost(BackendError),
}

async fn supervise(
    endpoint: Endpoint,
    registry: Arc<SubscriptionsRegistry>,
    mut cmds: mpsc::Receiver<Command>,
    on_ready: Vec<Box<dyn ReadyHandler>>,
    cancel: CancellationToken,
) {
    let mut on_ready = Some(on_ready);
    let mut backoff = ExponentialBackOff {
        // Keep trying for as long as the backend lives.
        max_elapsed_time: Duration::ZERO,
        ..Default::default()
    };

    loop {
        let framed = match connect(&endpoint, &mut backoff, &cancel).await {
            Some(framed) => framed,
            None => return,
        };
        backoff.reset();

        let mut session = Session::new(framed);
        if let Err(e) = session.resubscribe(&registry).await {
            warn!(address = %endpoint.address(), "failed to restore subscriptions: {e}");
            continue;
        }

        info!(address = %endpoint.address(), "connected to broker");
        if let Some(handlers) = on_ready.take() {
            for handler in &handlers {
                handler.on_ready();
            }
        }

        match session.run(&registry, &mut cmds, &cancel).await {
            Exit::Closed => return,
            Exit::Lost(e) => {
                warn!(address = %endpoint.address(), "connection to broker lost: {e}");
            }
        }
    }
}

/// Dial until a connection is established. Commands are not drained here;
/// they wait in the bounded channel until the session is up, so the
/// backoff sleep runs undisturbed and a caller awaiting Subscribe only
/// resolves against a real broker Ack. Returns `None` once the backend is
/// closed.
async fn connect(
    endpoint: &Endpoint,
    backoff: &mut ExponentialBackOff,
    cancel: &CancellationToken,
) -> Option<Framed<Box<dyn Stream>, ClientCodec>> {
    let mut attempts = retry(backoff);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return None,

            next = attempts.next() => {
                // The retry budget is unlimited; `next` is always Some.
                let (attempt, _) = next?;

                match endpoint.connect().await {
                    Ok(stream) => return Some(Framed::new(stream, ClientCodec::new())),
                    Err(e) if attempt == 0 => {
                        info!(address = %endpoint.address(), "failed to connect to broker: {e}");
                    }
                    Err(e) => {
                        debug!(address = %endpoint.address(), attempt, "failed to connect to broker: {e}");
                    }
                }
            }
        }
    }
}

struct Session {
    sink: SplitSink<Framed<Box<dyn Stream>, ClientCodec>, ClientFrame>,
    frames: SplitStream<Framed<Box<dyn Stream>, ClientCodec>>,
    seq: u64,
    pending: HashMap<u64, Done>,
}

impl Session {
    fn new(framed: Framed<Box<dyn Stream>, ClientCodec>) -> Self {
        let (sink, frames) = framed.split();

        Self {
            sink,
            frames,
            seq: 0,
            pending: HashMap::new(),
        }
    }

    /// Re-open the server-side stream for every local subscription,
    /// waiting for each Ack.
    async fn resubscribe(&mut self, registry: &SubscriptionsRegistry) -> Result<(), BackendError> {
        for key in registry.public_keys() {
            let seq = self
                .send(client_frame::Body::Subscribe(SubscribeParams {
                    key: key.to_vec(),
                }))
                .await?;

            self.wait_for_ack(seq, registry).await?;
            debug!(%key, "subscription restored");
        }

        Ok(())
    }

    async fn wait_for_ack(
        &mut self,
        seq: u64,
        registry: &SubscriptionsRegistry,
    ) -> Result<(), BackendError> {
        loop {
            let frame = match self.frames.next().await {
                Some(frame) => frame?,
                None => return Err(BackendError::NotConnected),
            };

            if frame.seq != seq {
                handle_frame(frame, registry, &mut self.pending);
                continue;
            }

            return match frame.body {
                Some(server_frame::Body::Ack(_)) => Ok(()),
                Some(server_frame::Body::Error(e)) => Err(BackendError::Rejected(e.message)),
                _ => Err(BackendError::Rejected("unexpected response".to_string())),
            };
        }
    }

    async fn run(
        &mut self,
        registry: &SubscriptionsRegistry,
        cmds: &mut mpsc::Receiver<Command>,
        cancel: &CancellationToken,
    ) -> Exit {
        let exit = loop {
            tokio::select! {
                () = cancel.cancelled() => break Exit::Closed,

                cmd = cmds.recv() => match cmd {
                    Some(cmd) => {
                        if let Err(e) = self.handle_command(cmd).await {
                            break Exit::Lost(e);
                        }
                    }
                    None => break Exit::Closed,
                },

                frame = self.frames.next() => match frame {
                    Some(Ok(frame)) => handle_frame(frame, registry, &mut self.pending),
                    Some(Err(e)) => break Exit::Lost(e.into()),
                    None => break Exit::Lost(BackendError::NotConnected),
                },
            }
        };

        let error = match &exit {
            Exit::Closed => BackendError::Closed,
            Exit::Lost(_) => BackendError::NotConnected,
        };
        for (_, done) in self.pending.drain() {
            let _ = done.send(Err(clone_error(&error)));
        }

        exit
    }

    async fn handle_command(&mut self, cmd: Command) -> Result<(), BackendError> {
        let (body, done) = match cmd {
            Command::Subscribe { key, done } => (
                client_frame::Body::Subscribe(SubscribeParams { key: key.to_vec() }),
                done,
            ),
            Command::Unsubscribe { key, done } => (
                client_frame::Body::Unsubscribe(SubscribeParams { key: key.to_vec() }),
                done,
            ),
            Command::Publish { envelope, done } => (client_frame::Body::Publish(envelope), done),
            Command::GetRelays { key, done } => (
                client_frame::Body::GetRelays(GetRelaysParams {
                    public_key: key.to_vec(),
                }),
                done,
            ),
        };

        let seq = self.send(body).await?;
        self.pending.insert(seq, done);

        Ok(())
    }

    async fn send(&mut self, body: client_frame::Body) -> Result<u64, BackendError> {
        self.seq += 1;
        let seq = self.seq;

        self.sink.send(ClientFrame {
            seq,
            body: Some(body),
        })
        .await?;

        Ok(seq)
    }
}

/// Dispatch one inbound frame: envelope deliveries go to the registry,
/// everything else resolves a pending request.
fn handle_frame(
    frame: ServerFrame,
    registry: &SubscriptionsRegistry,
    pending: &mut HashMap<u64, Done>,
) {
    if frame.seq == 0 {
        match frame.body {
            Some(server_frame::Body::Envelope(envelope)) => match registry.new_message(&envelope) {
                Ok(_) => {}
                Err(BackendError::NotSubscribed) => {
                    debug!("dropped envelope for unknown recipient");
                }
                Err(e) => warn!("failed to process envelope: {e}"),
            },
            _ => debug!("ignoring unsolicited non-envelope frame"),
        }
        return;
    }

    let Some(done) = pending.remove(&frame.seq) else {
        debug!(seq = frame.seq, "response for unknown request");
        return;
    };

    let response = match frame.body {
        Some(server_frame::Body::Ack(_)) => Ok(Response::Ack),
        Some(server_frame::Body::Relays(resp)) => Ok(Response::Relays(resp.relays)),
        Some(server_frame::Body::Error(e)) => Err(BackendError::Rejected(e.message)),
        _ => Err(BackendError::Rejected("unexpected response".to_string())),
    };

    let _ = done.send(response);
}

// BackendError holds sources that are not Clone; pending requests get a
// fresh error of the same kind instead.
fn clone_error(error: &BackendError) -> BackendError {
    match error {
        BackendError::Closed => BackendError::Closed,
        _ => BackendError::NotConnected,
    }
}
