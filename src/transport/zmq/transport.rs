//! ZMQ transport implementation using `zeromq`.
//!
//! ## Concurrency model
//!
//! - A single background **actor task** owns both sockets.
//! - The actor is responsible for:
//!   - sending outbound requests on the DEALER socket,
//!   - receiving responses (DEALER) and async messages (SUB),
//!   - decompressing inbound frames,
//!   - clean shutdown of the connection.
//! - All interaction with the sockets is serialized through this actor;
//!   no other task ever touches them directly.
//!
//! ## Wire framing
//!
//! The server runs a REP socket. A DEALER peer must prefix every request
//! with an empty delimiter frame, and replies come back as
//! `[delimiter, payload]`. The payload is always the last frame.
//!
//! ## Message delivery semantics
//!
//! Incoming messages are **fanned out** to every local subscriber covering
//! their channel, in the order the actor received them. There is no replay
//! or persistence.
//!
//! ## Connection loss
//!
//! A receive error on either socket ends the actor. Every inbox is closed,
//! which consumers observe as `None`. No reconnect is attempted here.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use zeromq::{
    //
    DealerSocket,
    Socket,
    SocketRecv,
    SocketSend,
    SubSocket,
    ZmqMessage,
    ZmqResult,
};

use crate::protocol::zipped;
use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_trace,
    log_warn,
    Channel,
    Envelope,
    Result,
    RpcError,
    Subscription,
    SubscriptionHandle,
    Transport,
    TransportBase,
    TransportConfig,
    TransportMode,
    TransportPtr,
};

const CMD_QUEUE_DEPTH: usize = 64;
const INBOX_CAPACITY: usize = 64;

type SubscriberMap = Arc<RwLock<Vec<(Subscription, mpsc::Sender<Envelope>)>>>;

//
// Actor commands
//

enum Cmd {
    //
    Publish {
        env: Envelope,
        resp: oneshot::Sender<Result<()>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

enum ActorStep {
    //
    Continue,
    Stop,
}

impl Cmd {
    // ---

    /// Dispatches an actor command to the correct handler on the actor
    async fn handle(self, actor: &mut ZmqActor) -> ActorStep {
        // ---

        match self {
            Cmd::Publish { env, resp } => {
                let result = actor.handle_publish(env).await;
                let _ = resp.send(result);
                ActorStep::Continue
            }
            Cmd::Close { resp } => {
                log_debug!("{}: closing zmq sockets", actor.transport_id);
                let _ = resp.send(Ok(()));
                ActorStep::Stop
            }
        }
    }
}

/// ZMQ-based implementation of the `Transport` trait.
///
/// Represents one connection to a TRex server: the sync socket and,
/// optionally, the async publisher.
pub struct ZmqTransport {
    // ---
    base: TransportBase,
    cmd_tx: mpsc::Sender<Cmd>,
    subscribers: SubscriberMap,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

struct ZmqActor {
    // ---
    transport_id: String, // for logging only
    dealer: DealerSocket,
    sub: Option<SubSocket>,
    cmd_rx: mpsc::Receiver<Cmd>,
    subscribers: SubscriberMap,
    compression_threshold: Option<usize>,
}

impl ZmqActor {
    // ---

    async fn run(mut self) {
        // ---

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if matches!(cmd.handle(&mut self).await, ActorStep::Stop) {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                msg = self.dealer.recv() => {
                    match msg {
                        Ok(msg) => self.handle_incoming(Channel::Response, msg).await,
                        Err(err) => {
                            log_error!("{}: sync socket failed: {err}", self.transport_id);
                            break;
                        }
                    }
                }

                msg = recv_optional(&mut self.sub) => {
                    match msg {
                        Ok(msg) => self.handle_incoming(Channel::Event, msg).await,
                        Err(err) => {
                            log_error!("{}: async socket failed: {err}", self.transport_id);
                            break;
                        }
                    }
                }
            }
        }

        // close first: subscribe() checks it under the map lock
        self.cmd_rx.close();
        self.subscribers.write().await.clear();

        log_info!("{}: zmq actor stopped", self.transport_id);
    }

    /// Sends a request on the DEALER socket.
    async fn handle_publish(&mut self, env: Envelope) -> Result<()> {
        // ---

        log_trace!(
            "{}: send {}",
            self.transport_id,
            String::from_utf8_lossy(&env.payload)
        );

        let payload = match self.compression_threshold {
            Some(threshold) if env.payload.len() >= threshold => zipped::compress(&env.payload)?,
            _ => env.payload,
        };

        let mut msg = ZmqMessage::from(Bytes::new());
        msg.push_back(payload);

        self.dealer.send(msg).await.map_err(|err| {
            log_error!("{}: send failed: {err}", self.transport_id);
            RpcError::Transport(format!("send failed: {err}"))
        })
    }

    /// Decompresses an inbound message and fans it out to local subscribers.
    ///
    /// Dropped subscribers are evicted during delivery.
    async fn handle_incoming(&mut self, channel: Channel, msg: ZmqMessage) {
        // ---

        let Some(frame) = msg.into_vec().pop() else {
            log_warn!("{}: empty zmq message on {channel:?}", self.transport_id);
            return;
        };

        let payload = match zipped::decompress(&frame) {
            Ok(Some(plain)) => plain,
            Ok(None) => frame,
            // a reply still answers a request; the client fails that call
            Err(err) if channel == Channel::Response => {
                log_warn!("{}: undecodable reply: {err}", self.transport_id);
                frame
            }
            Err(err) => {
                log_warn!("{}: dropping {channel:?} message: {err}", self.transport_id);
                return;
            }
        };

        log_trace!(
            "{}: recv {channel:?} {}",
            self.transport_id,
            String::from_utf8_lossy(&payload)
        );

        let senders: Vec<_> = {
            let map = self.subscribers.read().await;
            map.iter()
                .filter(|(sub, _)| sub.covers(channel))
                .map(|(_, tx)| tx.clone())
                .collect()
        };

        let env = Envelope { channel, payload };
        let mut evict = false;
        for tx in senders {
            if tx.send(env.clone()).await.is_err() {
                evict = true;
            }
        }

        if evict {
            self.subscribers
                .write()
                .await
                .retain(|(_, tx)| !tx.is_closed());
        }
    }
} // ZmqActor

/// Receive from an optional socket; pending forever when absent.
fn recv_optional(sub: &mut Option<SubSocket>) -> impl Future<Output = ZmqResult<ZmqMessage>> + '_ {
    // ---
    async move {
        match sub {
            Some(socket) => socket.recv().await,
            None => std::future::pending().await,
        }
    }
}

impl ZmqTransport {
    fn connection_closed(&self) -> RpcError {
        // ---
        RpcError::Transport(format!("{}: connection closed", self.transport_id()))
    }
}

#[async_trait::async_trait]
impl Transport for ZmqTransport {
    // ---

    fn base(&self) -> &TransportBase {
        &self.base
    }

    async fn publish(&self, env: Envelope) -> Result<()> {
        // ---

        self.mode().check_publish(env.channel)?;

        let (tx, rx) = oneshot::channel();

        self.cmd_tx
            .send(Cmd::Publish { env, resp: tx })
            .await
            .map_err(|_| self.connection_closed())?;

        rx.await.map_err(|_| self.connection_closed())?
    }

    async fn subscribe(&self, sub: Subscription) -> Result<SubscriptionHandle> {
        // ---

        if let Some(channel) = sub.0.iter().find(|ch| !self.mode().can_receive(**ch)) {
            return Err(RpcError::InvalidMode(format!(
                "client transport cannot receive on {channel:?}"
            )));
        }
        if sub.covers(Channel::Event) && self.base.async_endpoint.is_none() {
            log_warn!(
                "{}: event subscription without async channel",
                self.transport_id()
            );
        }

        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        {
            let mut map = self.subscribers.write().await;
            if self.cmd_tx.is_closed() {
                return Err(self.connection_closed());
            }
            map.push((sub, tx));
        }

        Ok(SubscriptionHandle { inbox: rx })
    }

    async fn close(&self) -> Result<()> {
        // ---

        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Close { resp: tx }).await.is_ok() {
            let _ = rx.await;
        }

        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }

        Ok(())
    }
}

/// Creates a ZMQ transport connected to the TRex server in `config`.
///
/// # Errors
///
/// - [`RpcError::InvalidMode`] for a server-mode config; this transport only
///   implements the client side.
/// - [`RpcError::TransportRetryable`] when a socket cannot connect.
pub async fn create_transport(config: TransportConfig) -> Result<TransportPtr> {
    // ---

    if config.mode != TransportMode::Client {
        return Err(RpcError::InvalidMode(
            "zmq transport supports client mode only".into(),
        ));
    }

    let base = TransportBase::from(&config);
    let transport_id = base.transport_id.clone();

    let mut dealer = DealerSocket::new();
    dealer
        .connect(&base.sync_endpoint)
        .await
        .map_err(|err| connect_failed(&transport_id, &base.sync_endpoint, err))?;
    log_info!("{transport_id}: connected to {}", base.sync_endpoint);

    let sub = match &base.async_endpoint {
        Some(endpoint) => {
            let mut socket = SubSocket::new();
            socket
                .connect(endpoint)
                .await
                .map_err(|err| connect_failed(&transport_id, endpoint, err))?;
            socket.subscribe("").await.map_err(|err| {
                RpcError::Transport(format!("{transport_id}: subscribe failed: {err}"))
            })?;
            log_info!("{transport_id}: subscribed to {endpoint}");
            Some(socket)
        }
        None => None,
    };

    let (cmd_tx, cmd_rx) = mpsc::channel(CMD_QUEUE_DEPTH);
    let subscribers: SubscriberMap = Arc::new(RwLock::new(Vec::new()));

    let actor = ZmqActor {
        transport_id,
        dealer,
        sub,
        cmd_rx,
        subscribers: Arc::clone(&subscribers),
        compression_threshold: config.compression_threshold,
    };

    let handle = tokio::spawn(actor.run());

    Ok(Arc::new(ZmqTransport {
        base,
        cmd_tx,
        subscribers,
        task: Mutex::new(Some(handle)),
        closed: AtomicBool::new(false),
    }))
}

fn connect_failed(transport_id: &str, endpoint: &str, err: zeromq::ZmqError) -> RpcError {
    // ---
    log_warn!("{transport_id}: connect to {endpoint} failed: {err}");
    RpcError::TransportRetryable(format!("connect to {endpoint} failed: {err}"))
}
