// src/client/rpc_client.rs
//! RPC client implementation.
//!
//! This module contains the core [`RpcClient`] type which sends JSON-RPC
//! requests to a TRex server and receives responses and async events over a
//! transport.
//!
//! # Architecture
//!
//! On `connect()` the client subscribes to the `Response` and `Event`
//! channels of its transport and spawns a background read loop. Each call
//! takes a fresh correlation ID and registers a oneshot channel in the
//! pending map; the read loop completes it when the matching response
//! arrives. Async events go to every [`EventSubscription`].
//!
//! # Concurrency
//!
//! Multiple calls can be in flight simultaneously. A call waits only for its
//! own response; the pending map lock is held just for insert/remove.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use super::batch::Batch;
use super::events::{BarrierWaiters, EventBus, EventSubscription};
use super::lock_ignore_poison;
use super::pending::{PendingGuard, PendingRequests};
use crate::commands::{self, Dispatch};
use crate::protocol::{
    // ---
    zipped,
    AsyncEvent,
    CorrelationIdGen,
    Inbound,
    Params,
    Request,
    ServerEvent,
};
use crate::retry::{random_u64, retry_with_backoff};
use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    ApiVersion,
    Channel,
    ConnectionState,
    Envelope,
    Result,
    RpcConfig,
    RpcError,
    Subscription,
    TransportBuilder,
    TransportPtr,
};

/// Interval between barrier re-injections.
const BARRIER_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Result of `get_version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    #[serde(default)]
    pub build_date: String,
    #[serde(default)]
    pub build_time: String,
    #[serde(default)]
    pub built_by: String,
    #[serde(default)]
    pub mode: Option<String>,
}

/// Running RPC client instance.
///
/// Cheap to clone (internally `Arc`-backed).
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

enum TransportSource {
    /// Build a fresh transport from `RpcConfig` on every `connect()`.
    Config,
    /// Caller-supplied transport.
    Supplied(TransportPtr),
}

struct Inner {
    // ---
    config: RpcConfig,
    source: TransportSource,
    ids: CorrelationIdGen,
    state: watch::Sender<ConnectionState>,
    connection: Mutex<Option<Arc<Connection>>>,
    api_h: Mutex<Option<String>>,
    events: EventBus,
    barriers: BarrierWaiters,

    /// Serializes `connect()` and `close()`.
    lifecycle: tokio::sync::Mutex<()>,
}

/// One established transport and the state scoped to it.
pub(super) struct Connection {
    // ---
    pub(super) transport: TransportPtr,
    pub(super) pending: PendingRequests,
    rx_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    fn take_task(&self) -> Option<JoinHandle<()>> {
        lock_ignore_poison(&self.rx_task).take()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // ---
        let conn = lock_ignore_poison(&self.connection).take();
        if let Some(task) = conn.as_ref().and_then(|conn| conn.take_task()) {
            task.abort();
        }
    }
}

impl RpcClient {
    // ---

    /// Create a disconnected client.
    ///
    /// The transport is built from `config` by [`connect`](Self::connect).
    pub fn new(config: RpcConfig) -> Self {
        // ---
        Self::build(config, TransportSource::Config)
    }

    /// Create a client with an explicitly provided transport and connect it.
    ///
    /// This is the constructor you want for tests and for advanced users.
    /// The transport is closed together with the client, so such a client
    /// cannot reconnect after `close()` or a connection loss.
    ///
    /// # Errors
    ///
    /// Returns the error of [`connect`](Self::connect).
    pub async fn with_transport(transport: TransportPtr, config: RpcConfig) -> Result<Self> {
        // ---
        let client = Self::build(config, TransportSource::Supplied(transport));
        client.connect().await?;
        Ok(client)
    }

    fn build(config: RpcConfig, source: TransportSource) -> Self {
        // ---
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            inner: Arc::new(Inner {
                config,
                source,
                ids: CorrelationIdGen::new(),
                state,
                connection: Mutex::new(None),
                api_h: Mutex::new(None),
                events: EventBus::new(),
                barriers: BarrierWaiters::new(),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Establish the transport, start the read loop and run the optional
    /// `api_sync_v2` handshake.
    ///
    /// Does nothing when already connected.
    ///
    /// # Errors
    ///
    /// - `RpcError::TransportRetryable` / `RpcError::Transport` when the
    ///   transport cannot be established (retried first when a
    ///   [`RetryConfig`](crate::RetryConfig) is configured)
    /// - any call error of the handshake; the connection is torn down again
    pub async fn connect(&self) -> Result<()> {
        // ---
        let _lifecycle = self.inner.lifecycle.lock().await;

        if self.state().is_connected() && lock_ignore_poison(&self.inner.connection).is_some() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);

        match self.establish().await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                log_info!("{}: connected", self.inner.config.transport_id);
                Ok(())
            }
            Err(err) => {
                log_warn!("{}: connect failed: {err}", self.inner.config.transport_id);
                self.set_state(ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    async fn establish(&self) -> Result<()> {
        // ---
        let transport = match &self.inner.source {
            TransportSource::Supplied(transport) => transport.clone(),
            TransportSource::Config => {
                let config = &self.inner.config;
                retry_with_backoff(config.retry_config.as_ref(), || {
                    transport_builder(config).build()
                })
                .await?
            }
        };

        let sub = match transport.base().async_endpoint {
            Some(_) => Subscription::from([Channel::Response, Channel::Event]),
            None => Subscription::from(Channel::Response),
        };
        let handle = transport.subscribe(sub).await?;

        let conn = Arc::new(Connection {
            transport,
            pending: PendingRequests::new(),
            rx_task: Mutex::new(None),
        });

        let rx_task = tokio::spawn(read_loop(
            Arc::downgrade(&self.inner),
            Arc::clone(&conn),
            handle.inbox,
            self.inner.config.async_silence_timeout,
        ));
        *lock_ignore_poison(&conn.rx_task) = Some(rx_task);
        *lock_ignore_poison(&self.inner.connection) = Some(Arc::clone(&conn));

        if let Some(version) = &self.inner.config.api_sync {
            match self.api_sync(&conn, version).await {
                Ok(api_h) => *lock_ignore_poison(&self.inner.api_h) = Some(api_h),
                Err(err) => {
                    lock_ignore_poison(&self.inner.connection).take();
                    self.teardown(&conn, || RpcError::Cancelled).await;
                    return Err(err);
                }
            }
        }

        // the read loop clears the slot when the connection dropped meanwhile
        if lock_ignore_poison(&self.inner.connection).is_none() {
            return Err(RpcError::Transport("connection lost while connecting".into()));
        }

        Ok(())
    }

    async fn api_sync(&self, conn: &Connection, version: &ApiVersion) -> Result<String> {
        // ---
        let params = json!({
            "name": version.name,
            "major": version.major,
            "minor": version.minor,
        });
        let result = self
            .call_on(conn, "api_sync_v2", params, self.inner.config.request_timeout)
            .await?;

        result
            .get("api_h")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RpcError::Protocol(format!("api_sync_v2 returned no api_h: {result}")))
    }

    /// Invoke `method` and wait up to `timeout` for its result.
    ///
    /// `params` must be a JSON object or `null`. The method name is not
    /// validated beyond being non-empty, so commands added to the server
    /// later remain callable.
    ///
    /// # Errors
    ///
    /// - `RpcError::InvalidArgument` - empty method, zero timeout or non-object params
    /// - `RpcError::NotConnected` - client not connected
    /// - `RpcError::Timeout` - no response within `timeout`; the pending entry is removed
    /// - `RpcError::Protocol` - malformed response
    /// - `RpcError::Remote` - server-reported failure
    /// - `RpcError::Cancelled` - client closed while the call was pending
    /// - `RpcError::Transport` - connection lost
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use trex_rpc::{RpcClient, RpcConfig};
    /// # use serde_json::json;
    /// # use std::time::Duration;
    /// # async fn example() -> trex_rpc::Result<()> {
    /// let client = RpcClient::new(RpcConfig::new("10.0.0.5", "client"));
    /// client.connect().await?;
    ///
    /// let status = client
    ///     .call("get_port_status", json!({"port_id": 0}), Duration::from_secs(5))
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        // ---
        let conn = self.connection()?;
        self.call_on(&conn, method, params, timeout).await
    }

    async fn call_on(
        &self,
        conn: &Connection,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        // ---
        validate_call(method, timeout)?;
        let desc = commands::lookup(method);
        let params = self.prepare_params(method, params, desc.needs_api_handler())?;
        let deadline = Instant::now() + timeout;

        match desc.dispatch {
            Dispatch::Sync => self.send_and_wait(conn, method, params, deadline).await,
            Dispatch::Barrier => self.send_with_barrier(conn, method, params, deadline).await,
        }
    }

    /// Typed variant of [`call`](Self::call).
    ///
    /// # Errors
    ///
    /// As [`call`](Self::call); a result that does not deserialize into
    /// `TResp` is a `RpcError::Protocol`.
    pub async fn call_as<TReq, TResp>(&self, method: &str, req: TReq, timeout: Duration) -> Result<TResp>
    where
        TReq: Serialize,
        TResp: DeserializeOwned,
    {
        // ---
        let params = serde_json::to_value(req)?;
        let result = self.call(method, params, timeout).await?;

        serde_json::from_value(result)
            .map_err(|err| RpcError::Protocol(format!("unexpected result for {method}: {err}")))
    }

    /// Server version information.
    pub async fn get_version(&self, timeout: Duration) -> Result<VersionInfo> {
        // ---
        self.call_as("get_version", Value::Null, timeout).await
    }

    /// Round-trip check.
    pub async fn ping(&self) -> Result<()> {
        // ---
        self.call("ping", Value::Null, self.inner.config.request_timeout)
            .await
            .map(|_| ())
    }

    /// Commands the server supports.
    pub async fn get_supported_cmds(&self) -> Result<Vec<String>> {
        // ---
        let result = self
            .call("get_supported_cmds", Value::Null, self.inner.config.request_timeout)
            .await?;

        match result {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()),
            Value::Object(map) => Ok(map.into_iter().map(|(name, _)| name).collect()),
            other => Err(RpcError::Protocol(format!(
                "unexpected get_supported_cmds result: {other}"
            ))),
        }
    }

    /// Wait until the async channel has caught up with the sync channel.
    ///
    /// Requires the async channel.
    pub async fn barrier(&self, timeout: Duration) -> Result<()> {
        // ---
        self.call("publish_now", json!({"baseline": false}), timeout)
            .await
            .map(|_| ())
    }

    /// Start a batch of requests sent as one message.
    pub fn batch(&self) -> Batch<'_> {
        Batch::new(self)
    }

    /// Receive every async event from now on.
    pub fn subscribe(&self) -> EventSubscription {
        self.inner.events.subscribe()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Observe connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// API handler negotiated by `api_sync_v2`, if any.
    pub fn api_handler(&self) -> Option<String> {
        lock_ignore_poison(&self.inner.api_h).clone()
    }

    /// Number of calls awaiting a response.
    pub fn pending_requests(&self) -> usize {
        // ---
        lock_ignore_poison(&self.inner.connection)
            .as_ref()
            .map_or(0, |conn| conn.pending.len())
    }

    /// Configuration the client was created with.
    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    /// Close the client.
    ///
    /// Pending calls fail with `RpcError::Cancelled`, event subscriptions
    /// end, the read loop stops and the transport is closed. Calling
    /// `close()` again is a no-op.
    pub async fn close(&self) -> Result<()> {
        // ---
        let _lifecycle = self.inner.lifecycle.lock().await;

        let conn = lock_ignore_poison(&self.inner.connection).take();
        if let Some(conn) = conn {
            self.teardown(&conn, || RpcError::Cancelled).await;
            log_info!("{}: closed", self.inner.config.transport_id);
        }

        self.inner.events.close();
        lock_ignore_poison(&self.inner.api_h).take();
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    // --- internals

    pub(super) fn connection(&self) -> Result<Arc<Connection>> {
        // ---
        if !self.state().is_connected() {
            return Err(RpcError::NotConnected);
        }
        lock_ignore_poison(&self.inner.connection)
            .clone()
            .ok_or(RpcError::NotConnected)
    }

    pub(super) fn next_id(&self) -> crate::CorrelationId {
        self.inner.ids.generate()
    }

    /// Normalize params and inject `api_h` when the command needs it.
    pub(super) fn prepare_params(
        &self,
        method: &str,
        params: Value,
        needs_api_handler: bool,
    ) -> Result<Params> {
        // ---
        let mut params = match params {
            Value::Null => Params::new(),
            Value::Object(map) => map,
            other => {
                return Err(RpcError::InvalidArgument(format!(
                    "params of {method} must be an object, got {other}"
                )))
            }
        };

        if needs_api_handler && !params.contains_key("api_h") {
            if let Some(api_h) = self.api_handler() {
                params.insert("api_h".into(), Value::String(api_h));
            }
        }

        Ok(params)
    }

    async fn send_and_wait(
        &self,
        conn: &Connection,
        method: &str,
        params: Params,
        deadline: Instant,
    ) -> Result<Value> {
        // ---
        let id = self.next_id();
        let mut guard = PendingGuard::new(&conn.pending);
        let rx = guard.register(id)?;

        let request = Request::new(id, method, params);
        log_debug!("{}: call {method} id={id}", self.inner.config.transport_id);
        let payload = request.encode()?;
        conn.pending.mark_sent(vec![id]);
        if let Err(err) = conn.transport.publish(Envelope::request(payload)).await {
            conn.pending.withdraw(&[id]);
            return Err(err);
        }

        match time::timeout_at(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::Transport("response channel closed".into())),
            Err(_) => {
                log_debug!("{}: {method} id={id} timed out", self.inner.config.transport_id);
                Err(RpcError::Timeout)
            }
        }
    }

    /// Send a barrier command and wait for its `trex-barrier` acknowledgement,
    /// re-injecting the request until it arrives.
    async fn send_with_barrier(
        &self,
        conn: &Connection,
        method: &str,
        mut params: Params,
        deadline: Instant,
    ) -> Result<Value> {
        // ---
        let explicit = match params.get("key") {
            Some(value) => Some(value.as_u64().ok_or_else(|| {
                RpcError::InvalidArgument(format!("barrier key must be an unsigned integer, got {value}"))
            })?),
            None => None,
        };

        let (key, mut ack) = match explicit {
            Some(key) => (key, self.inner.barriers.register(key)?),
            None => loop {
                let key = random_u64() & 0xFFFF_FFFF;
                if let Ok(ack) = self.inner.barriers.register(key) {
                    params.insert("key".into(), Value::from(key));
                    break (key, ack);
                }
            },
        };
        params.entry("baseline").or_insert(Value::Bool(false));

        let _waiter = BarrierGuard {
            waiters: &self.inner.barriers,
            key,
        };

        loop {
            let result = self.send_and_wait(conn, method, params.clone(), deadline).await?;

            let wait_until = deadline.min(Instant::now() + BARRIER_RETRY_INTERVAL);
            match time::timeout_at(wait_until, &mut ack).await {
                Ok(Ok(acked)) => return acked.map(|_| result),
                Ok(Err(_)) => return Err(RpcError::Cancelled),
                Err(_) if Instant::now() >= deadline => return Err(RpcError::Timeout),
                Err(_) => log_debug!("barrier {key} not acknowledged yet, re-injecting"),
            }
        }
    }

    /// Fail pending work, stop the read loop and close the transport.
    async fn teardown(&self, conn: &Connection, err: impl Fn() -> RpcError) {
        // ---
        let failed = conn.pending.fail_all(&err);
        if failed > 0 {
            log_debug!("{}: failed {failed} pending call(s)", self.inner.config.transport_id);
        }
        self.inner.barriers.fail_all(&err);

        if let Some(task) = conn.take_task() {
            task.abort();
            let _ = task.await;
        }

        if let Err(_err) = conn.transport.close().await {
            log_warn!("{}: transport close failed: {_err}", self.inner.config.transport_id);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        // ---
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            log_debug!(
                "{}: state {previous} -> {state}",
                self.inner.config.transport_id
            );
        }
    }
}

struct BarrierGuard<'a> {
    waiters: &'a BarrierWaiters,
    key: u64,
}

impl Drop for BarrierGuard<'_> {
    fn drop(&mut self) {
        self.waiters.remove(self.key);
    }
}

fn transport_builder(config: &RpcConfig) -> TransportBuilder {
    // ---
    let mut builder = TransportBuilder::new()
        .server(config.server.as_str())
        .node_id(config.transport_id.as_str())
        .sync_port(config.sync_port)
        .client_mode();

    builder = match config.async_port {
        Some(port) => builder.async_port(port),
        None => builder.no_async_channel(),
    };
    if let Some(transport_type) = &config.transport_type {
        builder = builder.transport_type(transport_type.as_str());
    }
    if let Some(threshold) = config.compression_threshold {
        builder = builder.compression_threshold(threshold);
    }
    builder
}

pub(super) fn validate_call(method: &str, timeout: Duration) -> Result<()> {
    // ---
    if method.trim().is_empty() {
        return Err(RpcError::InvalidArgument("method name must not be empty".into()));
    }
    if timeout.is_zero() {
        return Err(RpcError::InvalidArgument("timeout must be greater than zero".into()));
    }
    Ok(())
}

// --- read loop

/// Drains the transport inbox until the connection ends.
///
/// Holds only a weak reference to the client so that dropping the last
/// `RpcClient` stops the loop.
async fn read_loop(
    weak: Weak<Inner>,
    conn: Arc<Connection>,
    mut inbox: tokio::sync::mpsc::Receiver<Envelope>,
    silence_timeout: Option<Duration>,
) {
    // ---
    let mut last_event: Option<Instant> = None;

    let cause = loop {
        let silence_deadline = silence_timeout.zip(last_event).map(|(limit, at)| at + limit);

        let env = tokio::select! {
            env = inbox.recv() => env,
            _ = sleep_until_opt(silence_deadline) => break "async channel silent".to_string(),
        };

        let Some(env) = env else {
            break "transport closed".to_string();
        };

        let Some(inner) = weak.upgrade() else {
            // Inner was dropped, exit loop
            return;
        };
        let client = RpcClient { inner };

        match env.channel {
            Channel::Response => client.handle_response(&conn, &env.payload),
            Channel::Event => {
                last_event = Some(Instant::now());
                if let Some(cause) = client.handle_event(&env.payload) {
                    break cause;
                }
            }
            Channel::Request => log_debug!("ignoring request envelope on client"),
        }
    };

    // the transport may be blocked delivering into this inbox
    drop(inbox);

    if let Some(inner) = weak.upgrade() {
        let client = RpcClient { inner };
        client.connection_lost(&conn, &cause).await;
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    // ---
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl RpcClient {
    // ---

    fn handle_response(&self, conn: &Connection, payload: &[u8]) {
        // ---
        if zipped::is_compressed(payload) {
            // the transport hands over frames it failed to decompress
            self.fail_unattributed(conn, RpcError::Protocol("undecodable compressed reply".into()));
            return;
        }

        let items = match Inbound::decode_all(payload) {
            Ok(items) => items,
            Err(err) => {
                self.fail_unattributed(conn, err);
                return;
            }
        };

        let mut attributed = false;
        let mut orphan = None;

        for item in items {
            match item {
                Inbound::Response(response) => {
                    attributed = true;
                    let id = response.id;
                    if !conn.pending.complete(id, response.into_result()) {
                        log_debug!("response for unknown or abandoned id={id}, dropped");
                    }
                }
                Inbound::Malformed { id, reason } => {
                    attributed = true;
                    if !conn.pending.complete(id, Err(RpcError::Protocol(reason))) {
                        log_debug!("malformed response for unknown id={id}, dropped");
                    }
                }
                Inbound::Notification(event) => self.inner.events.dispatch(&event),
                Inbound::Rejected(error) => {
                    orphan.get_or_insert(RpcError::Remote(error.into()));
                }
                Inbound::Unattributable(raw) => {
                    orphan.get_or_insert_with(|| RpcError::Protocol(format!("reply without request id: {raw}")));
                }
            }
        }

        match orphan {
            Some(err) if !attributed => self.fail_unattributed(conn, err),
            Some(_err) => log_warn!("{}: dropping part of a batch reply: {_err}", self.inner.config.transport_id),
            None => {}
        }
    }

    /// Fail the oldest unanswered message with `err`.
    ///
    /// The server answers requests in order, so a reply without a usable id
    /// belongs to the oldest message still on the wire.
    fn fail_unattributed(&self, conn: &Connection, err: RpcError) {
        // ---
        log_warn!("{}: unattributable reply: {err}", self.inner.config.transport_id);

        let failed = match err {
            RpcError::Remote(remote) => conn.pending.fail_oldest(|| RpcError::Remote(remote.clone())),
            RpcError::Protocol(reason) => conn.pending.fail_oldest(|| RpcError::Protocol(reason.clone())),
            other => {
                let reason = other.to_string();
                conn.pending.fail_oldest(|| RpcError::Protocol(reason.clone()))
            }
        };
        if failed == 0 {
            log_debug!("no caller waiting for the unattributable reply");
        }
    }

    /// Dispatch an async message. Returns the cause when the server stopped.
    fn handle_event(&self, payload: &[u8]) -> Option<String> {
        // ---
        let event = match AsyncEvent::decode(payload) {
            Ok(event) => event,
            Err(_err) => {
                log_warn!("{}: dropping async message: {_err}", self.inner.config.transport_id);
                return None;
            }
        };

        if let Some(key) = event.barrier_key() {
            self.inner.barriers.acknowledge(key);
        }

        self.inner.events.dispatch(&event);

        match event.server_event() {
            Some(ServerEvent::ServerStopped { cause }) => Some(format!("server stopped: {cause}")),
            _ => None,
        }
    }

    /// Fail work bound to `conn` and drop to `Disconnected`.
    ///
    /// Ignored when `conn` is no longer the current connection.
    async fn connection_lost(&self, conn: &Arc<Connection>, reason: &str) {
        // ---
        let current = {
            let mut slot = lock_ignore_poison(&self.inner.connection);
            match slot.as_ref() {
                Some(active) if Arc::ptr_eq(active, conn) => slot.take(),
                _ => None,
            }
        };
        let Some(conn) = current else {
            return;
        };

        log_warn!("{}: connection lost: {reason}", self.inner.config.transport_id);

        // an empty slot must never be seen as Connected
        lock_ignore_poison(&self.inner.api_h).take();
        self.set_state(ConnectionState::Disconnected);

        let reason = reason.to_string();
        conn.pending
            .fail_all(|| RpcError::Transport(format!("connection lost: {reason}")));
        self.inner
            .barriers
            .fail_all(|| RpcError::Transport(format!("connection lost: {reason}")));

        // called from the read loop itself: drop the handle, do not abort
        conn.take_task();
        if let Err(_err) = conn.transport.close().await {
            log_debug!("transport close after loss failed: {_err}");
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{
        // ---
        create_memory_transport_with_hub,
        MemoryHub,
        SubscriptionHandle,
        Transport,
        TransportBase,
        TransportConfig,
        TransportMode,
    };
    use tokio::sync::Notify;

    /// Memory transport whose `close()` waits for a release.
    struct HeldClose {
        inner: TransportPtr,
        release: Arc<Notify>,
    }

    #[async_trait::async_trait]
    impl Transport for HeldClose {
        fn base(&self) -> &TransportBase {
            self.inner.base()
        }

        async fn publish(&self, env: Envelope) -> Result<()> {
            self.inner.publish(env).await
        }

        async fn subscribe(&self, sub: Subscription) -> Result<SubscriptionHandle> {
            self.inner.subscribe(sub).await
        }

        async fn close(&self) -> Result<()> {
            self.release.notified().await;
            self.inner.close().await
        }
    }

    fn transport_config(node_id: &str, mode: TransportMode) -> TransportConfig {
        TransportConfig {
            server: "memory".into(),
            sync_port: crate::DEFAULT_SYNC_PORT,
            async_port: Some(crate::DEFAULT_ASYNC_PORT),
            node_id: node_id.into(),
            mode,
            transport_type: Some("memory".into()),
            compression_threshold: None,
        }
    }

    #[tokio::test]
    async fn test_state_drops_before_transport_close_finishes() {
        // ---
        let hub = MemoryHub::new();
        let server = create_memory_transport_with_hub(transport_config("trex", TransportMode::Server), hub.clone())
            .await
            .unwrap();
        let inner = create_memory_transport_with_hub(transport_config("held", TransportMode::Client), hub)
            .await
            .unwrap();

        let release = Arc::new(Notify::new());
        let transport: TransportPtr = Arc::new(HeldClose {
            inner,
            release: release.clone(),
        });
        let client = RpcClient::with_transport(transport, RpcConfig::memory("held"))
            .await
            .unwrap();

        let stopped = AsyncEvent::new(
            "trex-event",
            json!(ServerEvent::SERVER_STOPPED),
            json!({"cause": "shutdown"}),
        );
        server
            .publish(Envelope::event(stopped.encode().unwrap()))
            .await
            .unwrap();

        // the transport close is still parked here
        let mut state = client.watch_state();
        time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == ConnectionState::Disconnected))
            .await
            .expect("state still Connected while the connection slot is empty")
            .unwrap();
        assert!(matches!(client.connection(), Err(RpcError::NotConnected)));

        release.notify_one();
        client.close().await.unwrap();
    }
}
