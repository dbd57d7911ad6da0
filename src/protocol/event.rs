//! Messages pushed by the TRex async publisher.
//!
//! Every async message is a JSON object `{"name", "type", "data", "baseline"}`.
//! `name` selects the kind of message; the remaining members depend on it.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Result, RpcError};

/// Unsolicited notification received from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncEvent {
    pub name: String,

    /// Event code for `trex-event`, barrier key for `trex-barrier`.
    #[serde(rename = "type", default)]
    pub event_type: Value,

    #[serde(default)]
    pub data: Value,

    /// True when the server sends a full snapshot rather than a delta.
    #[serde(default)]
    pub baseline: bool,
}

/// Kind of async message, taken from its `name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncTopic {
    /// `trex-global`: periodic global and per-port counters.
    Global,
    /// `trex-event`: port and server state changes.
    Event,
    /// `trex-barrier`: acknowledgement of a `publish_now` request.
    Barrier,
    /// `flow_stats`
    FlowStats,
    /// `latency_stats`
    LatencyStats,
    Other,
}

impl AsyncEvent {
    // ---

    pub fn new(name: impl Into<String>, event_type: Value, data: Value) -> Self {
        Self {
            name: name.into(),
            event_type,
            data,
            baseline: false,
        }
    }

    /// Parse one async message (already decompressed).
    pub fn decode(payload: &[u8]) -> Result<Self> {
        // ---
        serde_json::from_slice(payload)
            .map_err(|err| RpcError::Protocol(format!("invalid async message: {err}")))
    }

    pub fn encode(&self) -> Result<Bytes> {
        // ---
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn topic(&self) -> AsyncTopic {
        // ---
        match self.name.as_str() {
            "trex-global" => AsyncTopic::Global,
            "trex-event" => AsyncTopic::Event,
            "trex-barrier" => AsyncTopic::Barrier,
            "flow_stats" => AsyncTopic::FlowStats,
            "latency_stats" => AsyncTopic::LatencyStats,
            _ => AsyncTopic::Other,
        }
    }

    /// Decoded server event, for `trex-event` messages.
    pub fn server_event(&self) -> Option<ServerEvent> {
        // ---
        match self.topic() {
            AsyncTopic::Event => ServerEvent::try_from(self).ok(),
            _ => None,
        }
    }

    /// Key acknowledged by a `trex-barrier` message.
    pub fn barrier_key(&self) -> Option<u64> {
        // ---
        match self.topic() {
            AsyncTopic::Barrier => self.event_type.as_u64(),
            _ => None,
        }
    }

    /// Counter snapshot, for `trex-global` messages.
    pub fn stats(&self) -> Option<StatsSnapshot> {
        // ---
        match (self.topic(), self.data.as_object()) {
            (AsyncTopic::Global, Some(data)) => Some(StatsSnapshot::from_data(data)),
            _ => None,
        }
    }
}

/// Port or server state change reported on `trex-event`.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    PortStarted {
        port_id: u32,
    },
    PortStopped {
        port_id: u32,
    },
    PortPaused {
        port_id: u32,
    },
    PortResumed {
        port_id: u32,
    },
    PortJobDone {
        port_id: u32,
    },
    PortAcquired {
        port_id: u32,
        who: String,
        session_id: Option<u64>,
        force: bool,
    },
    PortReleased {
        port_id: u32,
        who: String,
        session_id: Option<u64>,
    },
    PortError {
        port_id: u32,
    },
    PortAttrChanged {
        port_id: u32,
        attr: Value,
    },
    ServerStopped {
        cause: String,
    },
    Unknown {
        code: i64,
        data: Value,
    },
}

impl ServerEvent {
    pub const PORT_STARTED: i64 = 0;
    pub const PORT_STOPPED: i64 = 1;
    pub const PORT_PAUSED: i64 = 2;
    pub const PORT_RESUMED: i64 = 3;
    pub const PORT_JOB_DONE: i64 = 4;
    pub const PORT_ACQUIRED: i64 = 5;
    pub const PORT_RELEASED: i64 = 6;
    pub const PORT_ERROR: i64 = 7;
    pub const PORT_ATTR_CHANGED: i64 = 8;
    pub const SERVER_STOPPED: i64 = 100;

    /// Port the event refers to, if any.
    pub fn port_id(&self) -> Option<u32> {
        // ---
        match self {
            ServerEvent::PortStarted { port_id }
            | ServerEvent::PortStopped { port_id }
            | ServerEvent::PortPaused { port_id }
            | ServerEvent::PortResumed { port_id }
            | ServerEvent::PortJobDone { port_id }
            | ServerEvent::PortAcquired { port_id, .. }
            | ServerEvent::PortReleased { port_id, .. }
            | ServerEvent::PortError { port_id }
            | ServerEvent::PortAttrChanged { port_id, .. } => Some(*port_id),
            ServerEvent::ServerStopped { .. } | ServerEvent::Unknown { .. } => None,
        }
    }
}

impl TryFrom<&AsyncEvent> for ServerEvent {
    type Error = RpcError;

    fn try_from(event: &AsyncEvent) -> Result<Self> {
        // ---
        let code = event
            .event_type
            .as_i64()
            .ok_or_else(|| RpcError::Protocol(format!("event without code: {}", event.event_type)))?;
        let data = &event.data;

        let port_id = || -> Result<u32> {
            data.get("port_id")
                .and_then(Value::as_u64)
                .and_then(|port| u32::try_from(port).ok())
                .ok_or_else(|| RpcError::Protocol(format!("event {code} without port_id")))
        };
        let text = |key: &str| {
            data.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let session_id = || data.get("session_id").and_then(Value::as_u64);

        Ok(match code {
            Self::PORT_STARTED => ServerEvent::PortStarted { port_id: port_id()? },
            Self::PORT_STOPPED => ServerEvent::PortStopped { port_id: port_id()? },
            Self::PORT_PAUSED => ServerEvent::PortPaused { port_id: port_id()? },
            Self::PORT_RESUMED => ServerEvent::PortResumed { port_id: port_id()? },
            Self::PORT_JOB_DONE => ServerEvent::PortJobDone { port_id: port_id()? },
            Self::PORT_ACQUIRED => ServerEvent::PortAcquired {
                port_id: port_id()?,
                who: text("who"),
                session_id: session_id(),
                force: data.get("force").and_then(Value::as_bool).unwrap_or(false),
            },
            Self::PORT_RELEASED => ServerEvent::PortReleased {
                port_id: port_id()?,
                who: text("who"),
                session_id: session_id(),
            },
            Self::PORT_ERROR => ServerEvent::PortError { port_id: port_id()? },
            Self::PORT_ATTR_CHANGED => ServerEvent::PortAttrChanged {
                port_id: port_id()?,
                attr: data.get("attr").cloned().unwrap_or(Value::Null),
            },
            Self::SERVER_STOPPED => ServerEvent::ServerStopped {
                cause: text("cause"),
            },
            code => ServerEvent::Unknown {
                code,
                data: data.clone(),
            },
        })
    }
}

/// A `trex-global` snapshot split into global and per-port counters.
///
/// Per-port counters arrive as `<field>-<port>` keys, e.g. `opackets-0`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub global: Map<String, Value>,
    pub ports: BTreeMap<u32, Map<String, Value>>,
}

impl StatsSnapshot {
    pub fn from_data(data: &Map<String, Value>) -> Self {
        // ---
        let mut snapshot = StatsSnapshot::default();

        for (key, value) in data {
            let port_field = key.rsplit_once('-').and_then(|(field, port)| {
                let port = port.parse::<u32>().ok()?;
                (!field.is_empty()).then_some((field, port))
            });

            match port_field {
                Some((field, port)) => {
                    snapshot
                        .ports
                        .entry(port)
                        .or_default()
                        .insert(field.to_string(), value.clone());
                }
                None => {
                    snapshot.global.insert(key.clone(), value.clone());
                }
            }
        }

        snapshot
    }

    /// Counters of one port.
    pub fn port(&self, port_id: u32) -> Option<&Map<String, Value>> {
        self.ports.get(&port_id)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    fn trex_event(code: i64, data: Value) -> AsyncEvent {
        AsyncEvent::new("trex-event", json!(code), data)
    }

    #[test]
    fn test_decode_async_message() {
        // ---
        let raw = br#"{"name":"trex-global","type":0,"data":{"m_cpu_util":1.5},"baseline":true}"#;
        let event = AsyncEvent::decode(raw).unwrap();
        assert_eq!(event.topic(), AsyncTopic::Global);
        assert!(event.baseline);

        // baseline is optional on the wire
        let raw = br#"{"name":"flow_stats","type":0,"data":{}}"#;
        let event = AsyncEvent::decode(raw).unwrap();
        assert_eq!(event.topic(), AsyncTopic::FlowStats);
        assert!(!event.baseline);
    }

    #[test]
    fn test_server_events() {
        // ---
        let started = trex_event(0, json!({"port_id": 1}));
        assert_eq!(
            started.server_event(),
            Some(ServerEvent::PortStarted { port_id: 1 })
        );

        let acquired = trex_event(
            5,
            json!({"port_id": 0, "who": "alice", "session_id": 77, "force": true}),
        );
        assert_eq!(
            acquired.server_event(),
            Some(ServerEvent::PortAcquired {
                port_id: 0,
                who: "alice".into(),
                session_id: Some(77),
                force: true,
            })
        );

        let stopped = trex_event(100, json!({"cause": "shutdown requested"}));
        assert_eq!(
            stopped.server_event(),
            Some(ServerEvent::ServerStopped {
                cause: "shutdown requested".into()
            })
        );
        assert_eq!(stopped.server_event().and_then(|e| e.port_id()), None);
    }

    #[test]
    fn test_unknown_and_invalid_events() {
        // ---
        let unknown = trex_event(42, json!({"x": 1}));
        assert!(matches!(
            unknown.server_event(),
            Some(ServerEvent::Unknown { code: 42, .. })
        ));

        let no_port = trex_event(1, json!({}));
        assert!(matches!(
            ServerEvent::try_from(&no_port),
            Err(RpcError::Protocol(_))
        ));

        // not a trex-event at all
        let global = AsyncEvent::new("trex-global", json!(0), json!({}));
        assert_eq!(global.server_event(), None);
    }

    #[test]
    fn test_barrier_key() {
        // ---
        let barrier = AsyncEvent::new("trex-barrier", json!(123456), Value::Null);
        assert_eq!(barrier.barrier_key(), Some(123456));

        let other = AsyncEvent::new("trex-event", json!(123456), Value::Null);
        assert_eq!(other.barrier_key(), None);
    }

    #[test]
    fn test_stats_split_per_port() {
        // ---
        let event = AsyncEvent::new(
            "trex-global",
            json!(0),
            json!({
                "m_cpu_util": 3.5,
                "opackets-0": 100,
                "opackets-1": 200,
                "ipackets-1": 190,
                "m_tx_bps-": 1
            }),
        );
        let stats = event.stats().unwrap();

        assert_eq!(stats.global.get("m_cpu_util"), Some(&json!(3.5)));
        assert_eq!(stats.global.get("m_tx_bps-"), Some(&json!(1)));
        assert_eq!(stats.port(0).unwrap().get("opackets"), Some(&json!(100)));
        assert_eq!(stats.port(1).unwrap().len(), 2);
        assert!(stats.port(2).is_none());
    }
}
