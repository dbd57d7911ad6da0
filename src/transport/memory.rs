//! In-memory transport implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Transport` trait. It is intended primarily for testing, local execution,
//! and as a reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory transport defines the **reference behavior** for the transport
//! layer. The ZMQ transport approximates this behavior as closely as the
//! sockets allow and documents the deviations.
//!
//! In particular, the in-memory transport establishes the following expectations:
//!
//! - Once `subscribe()` returns successfully, envelopes published *after* that
//!   point on a covered channel are deliverable.
//! - Envelopes are delivered in publish order.
//! - No envelopes are dropped due to timing, scheduling, or background IO.
//!
//! A TRex server is emulated by a second transport in
//! [`TransportMode::Server`](crate::TransportMode::Server) on the same hub:
//! it receives `Request` envelopes and publishes `Response` and `Event`
//! envelopes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::{mpsc, RwLock};

use crate::{
    // ---
    log_debug,
    Envelope,
    Result,
    RpcError,
    Subscription,
    SubscriptionHandle,
    Transport,
    TransportBase,
    TransportConfig,
    TransportPtr,
};

const INBOX_CAPACITY: usize = 64;

struct HubEntry {
    owner: u64,
    sub: Subscription,
    sender: mpsc::Sender<Envelope>,
}

/// Shared message bus for the in-memory transport.
///
/// Simulates the two TRex sockets within a single process. All
/// `MemoryTransport` instances that share a `MemoryHub` can publish and
/// receive each other's envelopes.
///
/// # ⚠️  Testing Only - Subject to Change
///
/// **This type is exposed only for `trex-rpc`'s own integration tests.**
/// It may change or be removed in future versions without a deprecation cycle.
/// **Production code should use [`TransportBuilder`](crate::TransportBuilder)** instead.
///
/// # Usage in Integration Tests
///
/// For integration tests that need isolation between parallel test cases,
/// construct a hub explicitly and pass it to [`create_memory_transport_with_hub`]:
///
/// ```
/// # use trex_rpc::{MemoryHub, TransportConfig, TransportMode};
/// # async fn example() -> trex_rpc::Result<()> {
/// let hub = MemoryHub::new();
///
/// let config = |node_id: &str, mode| TransportConfig {
///     server: "memory".into(), sync_port: 4501, async_port: Some(4500),
///     node_id: node_id.into(), mode, transport_type: Some("memory".into()),
///     compression_threshold: None,
/// };
///
/// let server = trex_rpc::create_memory_transport_with_hub(config("trex", TransportMode::Server), hub.clone()).await?;
/// let client = trex_rpc::create_memory_transport_with_hub(config("client", TransportMode::Client), hub.clone()).await?;
/// # Ok(())
/// # }
/// ```
pub struct MemoryHub {
    // ---
    subscriptions: RwLock<Vec<HubEntry>>,
    next_owner: AtomicU64,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self::default())
    }

    async fn publish(&self, _transport_id: &str, env: Envelope) -> Result<()> {
        // ---
        let senders: Vec<_> = {
            let subs = self.subscriptions.read().await;
            subs.iter()
                .filter(|entry| entry.sub.covers(env.channel))
                .map(|entry| entry.sender.clone())
                .collect()
        };

        log_debug!(
            "{_transport_id}: publish {:?} ({} bytes) to {} inbox(es)",
            env.channel,
            env.payload.len(),
            senders.len()
        );

        let mut evict = false;
        for sender in senders {
            // A closed channel indicates a dropped SubscriptionHandle.
            if sender.send(env.clone()).await.is_err() {
                evict = true;
            }
        }

        if evict {
            self.subscriptions
                .write()
                .await
                .retain(|entry| !entry.sender.is_closed());
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        owner: u64,
        _transport_id: &str,
        sub: Subscription,
    ) -> Result<SubscriptionHandle> {
        // ---
        log_debug!("{_transport_id}: subscribe to {sub:?}");

        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);

        let mut subs = self.subscriptions.write().await;
        subs.push(HubEntry {
            owner,
            sub,
            sender: tx,
        });

        Ok(SubscriptionHandle { inbox: rx })
    }

    /// Drop every subscription registered by `owner`.
    async fn close(&self, owner: u64, _transport_id: &str) {
        // ---
        log_debug!("{_transport_id}: closing transport...");

        let mut subs = self.subscriptions.write().await;
        subs.retain(|entry| entry.owner != owner);
    }

    fn next_owner(&self) -> u64 {
        self.next_owner.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        // ---
        Self {
            subscriptions: RwLock::new(Vec::new()),
            next_owner: AtomicU64::new(1),
        }
    }
}

/// Process-global hub used by [`create_memory_transport`].
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// In-memory transport.
///
/// Routes envelopes through a shared [`MemoryHub`]. Closing the transport
/// removes only its own subscriptions; other transports on the hub keep
/// running.
struct MemoryTransport {
    // ---
    base: TransportBase,
    hub: Arc<MemoryHub>,
    owner: u64,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<()> {
        // ---
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::Transport(format!(
                "{}: memory transport closed",
                self.transport_id()
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn base(&self) -> &TransportBase {
        &self.base
    }

    /// Publish an envelope to every subscription covering its channel.
    async fn publish(&self, env: Envelope) -> Result<()> {
        // ---
        self.ensure_open()?;
        self.mode().check_publish(env.channel)?;
        self.hub.publish(self.transport_id(), env).await
    }

    /// Register a subscription on the shared hub.
    ///
    /// Once this function returns successfully, any subsequent publish on a
    /// covered channel is deliverable to the returned inbox.
    async fn subscribe(&self, sub: Subscription) -> Result<SubscriptionHandle> {
        // ---
        self.ensure_open()?;
        if let Some(channel) = sub.0.iter().find(|ch| !self.mode().can_receive(**ch)) {
            return Err(RpcError::InvalidMode(format!(
                "{:?} transport cannot receive on {channel:?}",
                self.mode()
            )));
        }
        self.hub.subscribe(self.owner, self.transport_id(), sub).await
    }

    /// Close the transport.
    ///
    /// Inboxes handed out by this transport observe `None` afterwards.
    async fn close(&self) -> Result<()> {
        // ---
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.hub.close(self.owner, self.transport_id()).await;
        }
        Ok(())
    }
}

/// Create a new in-memory transport using the process-global hub.
///
/// All transports created with this function share a single message bus.
/// For isolated parallel testing, use [`create_memory_transport_with_hub`].
///
/// # Errors
///
/// Currently infallible; always returns `Ok`.
pub async fn create_memory_transport(config: TransportConfig) -> Result<TransportPtr> {
    // ---
    create_memory_transport_with_hub(config, global_hub()).await
}

/// Create a new in-memory transport using the provided hub.
///
/// # ⚠️  Testing Only - Subject to Change
///
/// **This function is exposed only for `trex-rpc`'s own integration tests.**
/// It may change or be removed in future versions without a deprecation cycle.
/// **Production code should use [`TransportBuilder`](crate::TransportBuilder)** instead.
///
/// # Errors
///
/// Currently infallible; always returns `Ok`.
pub async fn create_memory_transport_with_hub(
    config: TransportConfig,
    hub: Arc<MemoryHub>,
) -> Result<TransportPtr> {
    // ---
    log_debug!("{}: create memory transport", config.node_id);

    let transport = MemoryTransport {
        base: TransportBase::from(&config),
        owner: hub.next_owner(),
        hub,
        closed: AtomicBool::new(false),
    };

    Ok(Arc::new(transport))
}
