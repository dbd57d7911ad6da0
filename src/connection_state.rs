//! Connection state enumeration.
//!
//! Defines the lifecycle of an [`RpcClient`](crate::RpcClient) connection.

use std::fmt;

/// Lifecycle state of a client connection.
///
/// ```text
/// Disconnected ──connect()──▶ Connecting ──ok──▶ Connected
///      ▲                          │                  │
///      └────────── failure ───────┘                  │
///      └──────── close() / connection lost ──────────┘
/// ```
///
/// There is no automatic reconnect: after returning to `Disconnected` the
/// caller may invoke `connect()` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport; calls fail with `NotConnected`.
    Disconnected,

    /// `connect()` is establishing the transport or running the API handshake.
    ///
    /// Calls are rejected with `NotConnected` until the state is `Connected`.
    Connecting,

    /// Transport up and read loop running.
    Connected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}
