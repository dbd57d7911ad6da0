//! Typed port operations.
//!
//! [`TrexPort`] wraps the per-port commands of the stateless API: ownership
//! (`acquire` / `release`), stream upload, traffic control and counters
//! relative to a baseline taken by [`TrexPort::clear_stats`].
//!
//! ```no_run
//! # use trex_rpc::{RpcClient, RpcConfig, TrafficOptions};
//! # use serde_json::json;
//! # async fn example(client: RpcClient) -> trex_rpc::Result<()> {
//! let mut ports = client.reserve_ports(&[0, 1], false).await?;
//! let port = &mut ports[0];
//!
//! port.write_streams(&[json!({"enabled": true, "isg": 0.0})]).await?;
//! port.clear_stats().await?;
//! port.start_traffic(&TrafficOptions::rate("10kpps")?).await?;
//! port.wait_idle(std::time::Duration::from_secs(1), std::time::Duration::from_secs(60))
//!     .await?;
//!
//! println!("{:?}", port.stats().await?);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::{self, Instant};

use crate::retry::random_u64;
use crate::{log_debug, log_info, Result, RpcClient, RpcError};

/// Interval between status polls in [`TrexPort::stop_traffic`].
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Port state reported by `get_port_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum PortState {
    Down,
    Idle,
    Streams,
    Tx,
    Pause,
    PcapTx,
}

impl PortState {
    /// True while the port sends traffic.
    pub fn is_transmitting(&self) -> bool {
        matches!(self, PortState::Tx | PortState::PcapTx)
    }
}

impl FromStr for PortState {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        // ---
        match s.to_ascii_lowercase().as_str() {
            "down" => Ok(PortState::Down),
            "idle" => Ok(PortState::Idle),
            "streams" => Ok(PortState::Streams),
            "tx" => Ok(PortState::Tx),
            "pause" => Ok(PortState::Pause),
            "pcap_tx" => Ok(PortState::PcapTx),
            other => Err(RpcError::Protocol(format!("unknown port state {other:?}"))),
        }
    }
}

impl TryFrom<String> for PortState {
    type Error = RpcError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// Result of `get_port_status`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PortStatus {
    pub state: PortState,
    #[serde(default)]
    pub owner: String,
    /// Remaining members (`attr`, `max_stream_id`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Unit of a traffic [`Multiplier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MultiplierKind {
    /// Factor applied to the stream rates.
    Raw,
    /// Percentage of the line rate.
    Percentage,
    Bps,
    Pps,
    /// Bits per second including layer 1 overhead.
    BpsL1,
}

/// How a multiplier combines with a running rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MultiplierOp {
    Abs,
    Add,
    Sub,
}

/// Traffic rate as sent in the `mul` member of `start_traffic`.
///
/// Parses the TRex rate notation: a number followed by an optional unit,
/// `%`, `[k|m|g]bps`, `[k|m|g]pps` or `[k|m|g]bpsl1`, and an optional `+`
/// or `-` for relative updates.
///
/// ```
/// # use trex_rpc::{Multiplier, MultiplierKind};
/// let mul: Multiplier = "10kpps".parse().unwrap();
/// assert_eq!(mul.kind, MultiplierKind::Pps);
/// assert_eq!(mul.value, 10_000.0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Multiplier {
    #[serde(rename = "type")]
    pub kind: MultiplierKind,
    pub value: f64,
    pub op: MultiplierOp,
}

impl Default for Multiplier {
    fn default() -> Self {
        Self {
            kind: MultiplierKind::Raw,
            value: 1.0,
            op: MultiplierOp::Abs,
        }
    }
}

impl FromStr for Multiplier {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        // ---
        let invalid = || RpcError::InvalidArgument(format!("invalid rate {s:?}"));

        let (body, op) = match s.strip_suffix('+') {
            Some(body) => (body, MultiplierOp::Add),
            None => match s.strip_suffix('-') {
                Some(body) => (body, MultiplierOp::Sub),
                None => (s, MultiplierOp::Abs),
            },
        };

        let split = body
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(body.len());
        let (number, unit) = body.split_at(split);
        if number.is_empty() || number.starts_with('.') || number.ends_with('.') {
            return Err(invalid());
        }
        let value: f64 = number.parse().map_err(|_| invalid())?;

        let (kind, value) = match unit {
            "" => (MultiplierKind::Raw, value),
            "%" => (MultiplierKind::Percentage, value),
            _ => {
                let (factor, rest) = match unit.as_bytes()[0] {
                    b'k' => (1e3, &unit[1..]),
                    b'm' => (1e6, &unit[1..]),
                    b'g' => (1e9, &unit[1..]),
                    _ => (1.0, unit),
                };
                let kind = match rest {
                    "bps" => MultiplierKind::Bps,
                    "pps" => MultiplierKind::Pps,
                    "bpsl1" => MultiplierKind::BpsL1,
                    _ => return Err(invalid()),
                };
                (kind, value * factor)
            }
        };

        Ok(Self { kind, value, op })
    }
}

impl fmt::Display for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?} ({:?})", self.value, self.kind, self.op)
    }
}

/// Parameters of `start_traffic` besides the port.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrafficOptions {
    #[serde(rename = "mul")]
    pub multiplier: Multiplier,
    /// Seconds to transmit; negative means until stopped.
    pub duration: f64,
    /// Start even when the port is already transmitting.
    pub force: bool,
    pub core_mask: u64,
    /// Server timestamp to start at; zero starts immediately.
    pub start_at_ts: f64,
}

impl Default for TrafficOptions {
    fn default() -> Self {
        Self {
            multiplier: Multiplier::default(),
            duration: -1.0,
            force: false,
            core_mask: u64::MAX,
            start_at_ts: 0.0,
        }
    }
}

impl TrafficOptions {
    /// Default options at the given rate.
    pub fn rate(rate: &str) -> Result<Self> {
        // ---
        Ok(Self {
            multiplier: rate.parse()?,
            ..Self::default()
        })
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration.as_secs_f64();
        self
    }
}

// --- request params

#[derive(Serialize)]
struct PortRequest<'a> {
    port_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    handler: Option<&'a str>,
}

#[derive(Serialize)]
struct AcquireRequest<'a> {
    port_id: u32,
    user: &'a str,
    session_id: u64,
    force: bool,
}

#[derive(Serialize)]
struct ServiceRequest<'a> {
    #[serde(flatten)]
    port: PortRequest<'a>,
    enabled: bool,
}

#[derive(Serialize)]
struct AddStreamRequest<'a> {
    #[serde(flatten)]
    port: PortRequest<'a>,
    stream_id: u32,
    stream: &'a Value,
}

#[derive(Serialize)]
struct StartTrafficRequest<'a> {
    #[serde(flatten)]
    port: PortRequest<'a>,
    #[serde(flatten)]
    options: &'a TrafficOptions,
}

#[derive(Deserialize)]
struct XstatsNames {
    xstats_names: Vec<String>,
}

#[derive(Deserialize)]
struct XstatsValues {
    xstats_values: Vec<u64>,
}

/// Counters captured by [`TrexPort::clear_stats`].
#[derive(Debug, Clone)]
struct Baseline {
    stats: Map<String, Value>,
    xstats: BTreeMap<String, u64>,
}

/// One port of a TRex server.
///
/// Commands that change the port need ownership, taken with
/// [`acquire`](Self::acquire). The handler returned by the server is sent
/// with every later command.
pub struct TrexPort {
    client: RpcClient,
    port_id: u32,
    user: String,
    session_id: u64,
    handler: Option<String>,
    xstats_names: Option<Vec<String>>,
    baseline: Option<Baseline>,
}

impl TrexPort {
    // ---

    pub fn new(client: RpcClient, port_id: u32) -> Self {
        // ---
        Self {
            client,
            port_id,
            user: "trex-rpc".to_string(),
            session_id: random_u64() & 0xFFFF_FFFF,
            handler: None,
            xstats_names: None,
            baseline: None,
        }
    }

    /// User name reported as the port owner.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_session_id(mut self, session_id: u64) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn port_id(&self) -> u32 {
        self.port_id
    }

    /// Handler returned by `acquire`, if the port is owned.
    pub fn handler(&self) -> Option<&str> {
        self.handler.as_deref()
    }

    /// Take ownership of the port.
    ///
    /// # Errors
    ///
    /// `RpcError::Remote` when another user owns the port and `force` is
    /// false.
    pub async fn acquire(&mut self, force: bool) -> Result<()> {
        // ---
        let req = AcquireRequest {
            port_id: self.port_id,
            user: &self.user,
            session_id: self.session_id,
            force,
        };
        let result: Value = self.client.call_as("acquire", req, self.timeout()).await?;

        let handler = match &result {
            Value::String(handler) => Some(handler.clone()),
            Value::Object(map) => map.get("handler").and_then(Value::as_str).map(str::to_string),
            _ => None,
        };
        let handler = handler.ok_or_else(|| RpcError::Protocol(format!("acquire returned no handler: {result}")))?;

        log_info!("port {}: acquired by {}", self.port_id, self.user);
        self.handler = Some(handler);
        Ok(())
    }

    /// Give up ownership.
    pub async fn release(&mut self) -> Result<()> {
        // ---
        self.port_call("release").await?;
        self.handler = None;
        log_info!("port {}: released", self.port_id);
        Ok(())
    }

    /// Remove every stream from the port.
    pub async fn reset(&self) -> Result<()> {
        self.port_call("remove_all_streams").await.map(|_| ())
    }

    pub async fn status(&self) -> Result<PortStatus> {
        // ---
        self.client
            .call_as("get_port_status", self.port_request(), self.timeout())
            .await
    }

    /// Switch service mode, required for captures.
    pub async fn set_service_mode(&self, enabled: bool) -> Result<()> {
        // ---
        let req = ServiceRequest {
            port: self.port_request(),
            enabled,
        };
        self.client
            .call_as::<_, Value>("service", req, self.timeout())
            .await
            .map(|_| ())
    }

    /// Replace the port's streams with `streams`, numbered from 1.
    ///
    /// The streams are uploaded in one batch. The first failed stream is
    /// reported.
    pub async fn write_streams(&self, streams: &[Value]) -> Result<()> {
        // ---
        self.reset().await?;
        if streams.is_empty() {
            return Ok(());
        }

        let mut batch = self.client.batch();
        for (stream_id, stream) in (1u32..).zip(streams) {
            let req = AddStreamRequest {
                port: self.port_request(),
                stream_id,
                stream,
            };
            batch.add("add_stream", serde_json::to_value(req)?);
        }

        for result in batch.invoke(self.timeout()).await? {
            result?;
        }
        log_debug!("port {}: wrote {} stream(s)", self.port_id, streams.len());
        Ok(())
    }

    /// Start transmitting the port's streams.
    ///
    /// # Errors
    ///
    /// `RpcError::InvalidArgument` when the port has no streams.
    pub async fn start_traffic(&self, options: &TrafficOptions) -> Result<()> {
        // ---
        if self.status().await?.state == PortState::Idle {
            return Err(RpcError::InvalidArgument(format!(
                "port {} has no streams to transmit",
                self.port_id
            )));
        }

        let req = StartTrafficRequest {
            port: self.port_request(),
            options,
        };
        self.client
            .call_as::<_, Value>("start_traffic", req, self.timeout())
            .await?;
        log_info!("port {}: traffic started at {}", self.port_id, options.multiplier);
        Ok(())
    }

    /// Stop transmitting and wait until the port is idle.
    pub async fn stop_traffic(&self) -> Result<()> {
        // ---
        self.port_call("stop_traffic").await?;
        self.wait_idle(IDLE_POLL_INTERVAL, self.timeout()).await
    }

    /// Poll the port every `poll` until it stops transmitting.
    ///
    /// # Errors
    ///
    /// `RpcError::Timeout` when still transmitting after `timeout`.
    pub async fn wait_idle(&self, poll: Duration, timeout: Duration) -> Result<()> {
        // ---
        let deadline = Instant::now() + timeout;
        loop {
            if !self.status().await?.state.is_transmitting() {
                return Ok(());
            }
            if Instant::now() + poll > deadline {
                return Err(RpcError::Timeout);
            }
            time::sleep(poll).await;
        }
    }

    /// Take the current counters as the zero point of
    /// [`stats`](Self::stats) and [`xstats`](Self::xstats).
    pub async fn clear_stats(&mut self) -> Result<()> {
        // ---
        let xstats = self.read_xstats().await?;
        let stats = self.read_stats().await?;
        self.baseline = Some(Baseline { stats, xstats });
        Ok(())
    }

    /// Port counters since the last [`clear_stats`](Self::clear_stats).
    ///
    /// Rates (fields ending in `ps`) are reported as they are.
    pub async fn stats(&self) -> Result<Map<String, Value>> {
        // ---
        let current = self.read_stats().await?;
        Ok(match &self.baseline {
            Some(baseline) => subtract_stats(current, &baseline.stats),
            None => current,
        })
    }

    /// Extended counters since the last [`clear_stats`](Self::clear_stats).
    pub async fn xstats(&mut self) -> Result<BTreeMap<String, u64>> {
        // ---
        let mut current = self.read_xstats().await?;
        if let Some(baseline) = &self.baseline {
            for (name, value) in current.iter_mut() {
                if let Some(base) = baseline.xstats.get(name) {
                    *value = value.saturating_sub(*base);
                }
            }
        }
        Ok(current)
    }

    // --- internals

    fn timeout(&self) -> Duration {
        self.client.config().request_timeout
    }

    fn port_request(&self) -> PortRequest<'_> {
        PortRequest {
            port_id: self.port_id,
            handler: self.handler.as_deref(),
        }
    }

    async fn port_call(&self, method: &str) -> Result<Value> {
        self.client.call_as(method, self.port_request(), self.timeout()).await
    }

    async fn read_stats(&self) -> Result<Map<String, Value>> {
        self.port_call("get_port_stats").await.and_then(|result| match result {
            Value::Object(map) => Ok(map),
            other => Err(RpcError::Protocol(format!("unexpected get_port_stats result: {other}"))),
        })
    }

    async fn read_xstats(&mut self) -> Result<BTreeMap<String, u64>> {
        // ---
        if self.xstats_names.is_none() {
            let names: XstatsNames = self
                .client
                .call_as("get_port_xstats_names", self.port_request(), self.timeout())
                .await?;
            self.xstats_names = Some(names.xstats_names);
        }

        let values: XstatsValues = self
            .client
            .call_as("get_port_xstats_values", self.port_request(), self.timeout())
            .await?;

        let names = self.xstats_names.as_deref().unwrap_or_default();
        if names.len() != values.xstats_values.len() {
            return Err(RpcError::Protocol(format!(
                "{} xstats names but {} values",
                names.len(),
                values.xstats_values.len()
            )));
        }
        Ok(names.iter().cloned().zip(values.xstats_values).collect())
    }
}

impl RpcClient {
    /// Port handle for `port_id`, not yet acquired.
    pub fn port(&self, port_id: u32) -> TrexPort {
        TrexPort::new(self.clone(), port_id)
    }

    /// Acquire every port in `port_ids`, in order.
    ///
    /// Stops at the first port that cannot be acquired; ports acquired
    /// before it stay owned.
    pub async fn reserve_ports(&self, port_ids: &[u32], force: bool) -> Result<Vec<TrexPort>> {
        // ---
        let mut ports = Vec::with_capacity(port_ids.len());
        for &port_id in port_ids {
            let mut port = self.port(port_id);
            port.acquire(force).await?;
            ports.push(port);
        }
        Ok(ports)
    }
}

/// Counter deltas against `base`; rates and non-counters pass through.
fn subtract_stats(current: Map<String, Value>, base: &Map<String, Value>) -> Map<String, Value> {
    // ---
    current
        .into_iter()
        .map(|(name, value)| {
            let delta = match (value.as_u64(), base.get(&name).and_then(Value::as_u64)) {
                (Some(now), Some(then)) if !name.ends_with("ps") => Value::from(now.saturating_sub(then)),
                _ => value,
            };
            (name, delta)
        })
        .collect()
}
