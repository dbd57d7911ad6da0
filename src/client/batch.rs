//! Batched requests.
//!
//! A batch is sent as JSON arrays of requests. Requests are split into
//! several arrays when their serialized size exceeds the chunk size, and all
//! of them share one deadline.

use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::time::{self, Instant};

use super::pending::PendingGuard;
use super::rpc_client::validate_call;
use super::RpcClient;
use crate::commands;
use crate::protocol::{CorrelationId, Request};
use crate::{log_debug, Envelope, Result, RpcError};

/// Largest serialized size of one batch message, in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 500_000;

/// Requests collected for one round trip.
///
/// Created by [`RpcClient::batch`].
///
/// # Example
///
/// ```no_run
/// # use trex_rpc::{RpcClient, RpcConfig};
/// # use serde_json::json;
/// # use std::time::Duration;
/// # async fn example(client: RpcClient) -> trex_rpc::Result<()> {
/// let mut batch = client.batch();
/// batch
///     .add("get_port_status", json!({"port_id": 0}))
///     .add("get_port_status", json!({"port_id": 1}));
///
/// for status in batch.invoke(Duration::from_secs(5)).await? {
///     println!("{:?}", status?);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Batch<'a> {
    client: &'a RpcClient,
    requests: Vec<(String, Value)>,
    chunk_size: usize,
}

impl<'a> Batch<'a> {
    // ---

    pub(super) fn new(client: &'a RpcClient) -> Self {
        Self {
            client,
            requests: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Append a request.
    pub fn add(&mut self, method: impl Into<String>, params: Value) -> &mut Self {
        self.requests.push((method.into(), params));
        self
    }

    /// Override the chunk size. Each chunk carries at least one request.
    pub fn chunk_size(&mut self, bytes: usize) -> &mut Self {
        self.chunk_size = bytes.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Send every request and collect the results in insertion order.
    ///
    /// Barrier commands inside a batch are sent like any other command and
    /// do not wait for their acknowledgement.
    ///
    /// # Errors
    ///
    /// The outer result fails as a whole for invalid arguments, a
    /// disconnected client or a failed send. Per-request failures, including
    /// `RpcError::Timeout` for requests unanswered at the shared deadline,
    /// are reported in the returned vector.
    pub async fn invoke(&mut self, timeout: Duration) -> Result<Vec<Result<Value>>> {
        // ---
        for (method, _) in &self.requests {
            validate_call(method, timeout)?;
        }
        if self.requests.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.client.connection()?;
        let deadline = Instant::now() + timeout;

        let mut requests = Vec::with_capacity(self.requests.len());
        for (method, params) in self.requests.drain(..) {
            let desc = commands::lookup(&method);
            let params = self
                .client
                .prepare_params(&method, params, desc.needs_api_handler())?;
            requests.push(Request::new(self.client.next_id(), method, params));
        }

        let mut guard = PendingGuard::new(&conn.pending);
        let mut receivers = Vec::with_capacity(requests.len());
        for request in &requests {
            receivers.push(guard.register(request.id)?);
        }

        let chunks = split_chunks(&requests, self.chunk_size)?;
        log_debug!(
            "batch of {} request(s) in {} message(s)",
            requests.len(),
            chunks.len()
        );
        for chunk in chunks {
            conn.pending.mark_sent(chunk.ids.clone());
            if let Err(err) = conn.transport.publish(Envelope::request(chunk.payload)).await {
                conn.pending.withdraw(&chunk.ids);
                return Err(err);
            }
        }

        let mut results = Vec::with_capacity(receivers.len());
        for rx in receivers {
            let result = match time::timeout_at(deadline, rx).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(RpcError::Transport("response channel closed".into())),
                Err(_) => Err(RpcError::Timeout),
            };
            results.push(result);
        }
        Ok(results)
    }
}

/// One batch message and the ids it carries.
struct Chunk {
    ids: Vec<CorrelationId>,
    payload: Bytes,
}

impl Chunk {
    fn seal(ids: Vec<CorrelationId>, mut buf: Vec<u8>) -> Self {
        buf.push(b']');
        Self {
            ids,
            payload: Bytes::from(buf),
        }
    }
}

/// Serialize `requests` into JSON arrays no larger than `chunk_size` bytes,
/// unless a single request alone exceeds it.
fn split_chunks(requests: &[Request], chunk_size: usize) -> Result<Vec<Chunk>> {
    // ---
    let mut chunks = Vec::new();
    let mut current: Vec<u8> = Vec::new();
    let mut ids = Vec::new();

    for request in requests {
        let encoded = serde_json::to_vec(request)?;

        // separator and closing bracket count towards the size
        if !current.is_empty() && current.len() + encoded.len() + 2 > chunk_size {
            chunks.push(Chunk::seal(std::mem::take(&mut ids), std::mem::take(&mut current)));
        }

        current.push(if current.is_empty() { b'[' } else { b',' });
        current.extend_from_slice(&encoded);
        ids.push(request.id);
    }

    if !current.is_empty() {
        chunks.push(Chunk::seal(ids, current));
    }
    Ok(chunks)
}
