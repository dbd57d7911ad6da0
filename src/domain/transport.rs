// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! Defines the transport interface used by the client to exchange raw
//! messages with a TRex server. It intentionally avoids any reference to
//! sockets, ZMQ patterns or client libraries.
//!
//! A TRex server exposes two logical pipes: a synchronous request/response
//! pipe and an asynchronous publisher. Both are modelled as [`Channel`]s that
//! carry opaque [`Envelope`]s. Higher-level semantics such as JSON-RPC
//! correlation, timeouts and event dispatch are handled by the client.
//!
//! Concrete implementations of this interface live under `src/transport/`.
use crate::{Result, RpcError};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

/// Logical message pipe between client and server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    // ---
    /// Client → server, synchronous RPC socket.
    Request,

    /// Server → client, synchronous RPC socket.
    Response,

    /// Server → client, asynchronous publisher socket.
    Event,
}

/// Operational mode of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    // ---
    /// Publishes requests; receives responses and events.
    Client,

    /// Receives requests; publishes responses and events. Used to emulate a
    /// server in-process.
    Server,
}

impl TransportMode {
    /// Returns true if a transport in this mode may publish on `channel`.
    pub fn can_publish(self, channel: Channel) -> bool {
        // ---
        match self {
            TransportMode::Client => channel == Channel::Request,
            TransportMode::Server => channel != Channel::Request,
        }
    }

    /// Returns true if a transport in this mode may receive on `channel`.
    pub fn can_receive(self, channel: Channel) -> bool {
        // ---
        !self.can_publish(channel)
    }

    /// Reject a publish the mode does not allow.
    pub fn check_publish(self, channel: Channel) -> Result<()> {
        // ---
        if self.can_publish(channel) {
            Ok(())
        } else {
            Err(RpcError::InvalidMode(format!(
                "{self:?} transport cannot publish on {channel:?}"
            )))
        }
    }
}

/// Shared base state for all transport implementations.
///
/// Each concrete transport embeds this as a field named `base`:
///
/// ```ignore
/// struct ZmqTransport {
///     base: TransportBase,
///     // ... socket specific fields
/// }
///
/// impl Transport for ZmqTransport {
///     fn base(&self) -> &TransportBase { &self.base }
/// }
/// ```
pub struct TransportBase {
    /// Unique identifier for this transport instance (the node_id).
    pub transport_id: String,
    /// Operational mode of this transport.
    pub mode: TransportMode,
    /// `tcp://host:port` of the synchronous RPC socket.
    pub sync_endpoint: String,
    /// `tcp://host:port` of the async publisher, if enabled.
    pub async_endpoint: Option<String>,
}

impl From<&TransportConfig> for TransportBase {
    /// Clones only the fields needed by `TransportBase`, leaving `config`
    /// available for transport-specific use.
    fn from(config: &TransportConfig) -> Self {
        // ---
        Self {
            transport_id: config.node_id.clone(),
            mode: config.mode,
            sync_endpoint: config.sync_endpoint(),
            async_endpoint: config.async_endpoint(),
        }
    }
}

/// Configuration for creating a transport instance.
///
/// Passed to transport factory functions (`create_*_transport()`).
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// TRex server host name or address.
    pub server: String,
    /// Synchronous RPC port.
    pub sync_port: u16,
    /// Async publisher port; `None` disables the event channel.
    pub async_port: Option<u16>,
    /// Node ID for this transport instance.
    pub node_id: String,
    /// Operational mode.
    pub mode: TransportMode,
    /// Optional transport type override (`"zmq"`, `"memory"`).
    pub transport_type: Option<String>,
    /// Compress outbound payloads of at least this many bytes.
    pub compression_threshold: Option<usize>,
}

impl TransportConfig {
    /// `tcp://` endpoint of the synchronous RPC socket.
    pub fn sync_endpoint(&self) -> String {
        // ---
        format!("tcp://{}:{}", self.server, self.sync_port)
    }

    /// `tcp://` endpoint of the async publisher, if enabled.
    pub fn async_endpoint(&self) -> Option<String> {
        // ---
        self.async_port
            .map(|port| format!("tcp://{}:{}", self.server, port))
    }
}

/// Set of channels a consumer wants to receive.
///
/// A single subscription may cover several channels; their envelopes are
/// delivered on one inbox in the order the transport received them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription(pub Vec<Channel>);

impl Subscription {
    /// Returns true if this subscription covers `channel`.
    pub fn covers(&self, channel: Channel) -> bool {
        // ---
        self.0.contains(&channel)
    }
}

impl From<Channel> for Subscription {
    fn from(channel: Channel) -> Self {
        // ---
        Subscription(vec![channel])
    }
}

impl<const N: usize> From<[Channel; N]> for Subscription {
    fn from(channels: [Channel; N]) -> Self {
        // ---
        Subscription(channels.to_vec())
    }
}

/// An opaque message envelope.
///
/// An `Envelope` is the unit of transport between client and server. The
/// transport layer does not interpret the payload; it is responsible only
/// for delivery on the envelope's channel.
///
/// # Examples
///
/// ```
/// # use trex_rpc::{Channel, Envelope};
/// # use bytes::Bytes;
/// let envelope = Envelope::request(Bytes::from_static(br#"{"jsonrpc":"2.0"}"#));
/// assert_eq!(envelope.channel, Channel::Request);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    // ---
    /// Pipe this envelope travels on.
    pub channel: Channel,

    /// Opaque payload bytes (uncompressed JSON text).
    pub payload: Bytes,
}

impl Envelope {
    // ---
    /// Create a request envelope (client → server).
    pub fn request(payload: impl Into<Bytes>) -> Self {
        Self {
            channel: Channel::Request,
            payload: payload.into(),
        }
    }

    /// Create a response envelope (server → client, sync socket).
    pub fn response(payload: impl Into<Bytes>) -> Self {
        Self {
            channel: Channel::Response,
            payload: payload.into(),
        }
    }

    /// Create an event envelope (server → client, async socket).
    pub fn event(payload: impl Into<Bytes>) -> Self {
        Self {
            channel: Channel::Event,
            payload: payload.into(),
        }
    }
}

/// Handle returned from a successful subscription.
///
/// The subscription remains active until either:
/// - The handle is dropped (receiver channel closes)
/// - The transport is closed (`inbox.recv()` returns `None`)
pub struct SubscriptionHandle {
    // ---
    /// Receiver channel for delivered envelopes matching this subscription.
    pub inbox: mpsc::Receiver<Envelope>,
}

/// Transport abstraction.
///
/// A `Transport` moves envelopes between a TRex client and server. It defines
/// the minimal contract required by the client without committing to any
/// specific socket library.
///
/// Implementations must ensure that:
/// - Once `subscribe()` returns successfully, envelopes received *after* that
///   point on a covered channel are delivered to the inbox.
/// - Envelopes are delivered in the order the transport received them.
/// - When the underlying connection is lost, every inbox is closed so that
///   consumers observe `None`.
///
/// The in-memory transport serves as the reference implementation of these
/// semantics.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Returns a reference to the shared base state.
    fn base(&self) -> &TransportBase;

    /// Returns the transport_id of the transport.
    fn transport_id(&self) -> &str {
        &self.base().transport_id
    }

    /// Returns the operational mode of the transport.
    fn mode(&self) -> TransportMode {
        self.base().mode
    }

    /// Send an envelope on its channel.
    async fn publish(&self, env: Envelope) -> Result<()>;

    /// Register a subscription and return a handle for receiving messages.
    async fn subscribe(&self, sub: Subscription) -> Result<SubscriptionHandle>;

    /// Close the transport and release any associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// `.clone()` is cheap and every clone shares the same underlying connection.
pub type TransportPtr = Arc<dyn Transport>;
