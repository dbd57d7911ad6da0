use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Error payload reported by the TRex server in a JSON-RPC `error` object.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    /// JSON-RPC error code (e.g. `-32601` method not found).
    pub code: i64,

    /// Human readable message.
    ///
    /// When the server attached a `specific_err` string, that detailed text
    /// is used here instead of the generic JSON-RPC message.
    pub message: String,

    /// Optional structured data attached by the server.
    pub data: Option<Value>,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Errors that can occur during RPC operations
#[derive(Error, Debug)]
pub enum RpcError {
    /// No response arrived within the requested timeout.
    #[error("request timed out")]
    Timeout,

    /// The peer sent a payload that does not follow the JSON-RPC envelope.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server processed the request and reported a failure.
    #[error("remote error: {0}")]
    Remote(RemoteError),

    /// The client was closed while the call was pending.
    #[error("call cancelled: client closed")]
    Cancelled,

    /// Non-retryable transport failure (connection lost, socket error).
    #[error("transport error: {0}")]
    Transport(String),

    /// Transient transport failure; `connect()` retries these when a
    /// retry policy is configured.
    #[error("transport error (retryable): {0}")]
    TransportRetryable(String),

    /// The client is not connected.
    #[error("not connected")]
    NotConnected,

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A call argument violates the client contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not valid for the transport's mode.
    #[error("invalid mode: {0}")]
    InvalidMode(String),

    /// A required builder field was not set.
    #[error("missing configuration: {0}")]
    MissingConfig(String),

    /// Builder settings conflict with each other.
    #[error("configuration conflict: {0}")]
    ConfigConflict(String),
}

impl RpcError {
    /// Returns the remote error payload when the server reported a failure.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            RpcError::Remote(err) => Some(err),
            _ => None,
        }
    }
}

/// Result type alias for RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_remote_display() {
        // ---
        let err = RpcError::Remote(RemoteError {
            code: -32601,
            message: "Method not found".into(),
            data: None,
        });
        assert_eq!(err.to_string(), "remote error: [-32601] Method not found");
        assert_eq!(err.remote().map(|r| r.code), Some(-32601));
    }

    #[test]
    fn test_remote_accessor_on_other_variants() {
        // ---
        assert!(RpcError::Timeout.remote().is_none());
        assert!(RpcError::Cancelled.remote().is_none());
    }
}
