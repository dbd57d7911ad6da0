//! Public client configuration.
//!
//! `RpcConfig` describes where the TRex server lives and how the client
//! behaves once connected. Transport layers receive only the subset they
//! need through [`TransportConfig`](crate::TransportConfig).

use std::time::Duration;

use crate::RetryConfig;

/// Default TRex synchronous RPC port (REQ/REP).
pub const DEFAULT_SYNC_PORT: u16 = 4501;

/// Default TRex asynchronous publisher port (PUB/SUB).
pub const DEFAULT_ASYNC_PORT: u16 = 4500;

/// API version announced in the `api_sync_v2` handshake.
///
/// The server answers with an API handler (`api_h`) that the client then
/// injects into every core command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiVersion {
    /// API class name, `"STL"` for stateless.
    pub name: String,
    pub major: u32,
    pub minor: u32,
}

impl ApiVersion {
    /// Stateless API version understood by current TRex releases.
    pub fn stateless() -> Self {
        Self {
            name: "STL".into(),
            major: 5,
            minor: 1,
        }
    }
}

/// Client configuration and connection parameters.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    // ---
    /// Host name or IP address of the TRex server.
    pub server: String,

    /// Synchronous RPC port.
    pub sync_port: u16,

    /// Asynchronous event port; `None` disables the async channel.
    pub async_port: Option<u16>,

    /// Identifier for this client instance, used for logging.
    pub transport_id: String,

    /// Explicit transport selection (`"zmq"` or `"memory"`).
    ///
    /// `None` selects ZMQ when the `transport_zmq` feature is enabled and the
    /// in-memory transport otherwise.
    pub transport_type: Option<String>,

    /// Default timeout used by the convenience helpers (`get_version`, ...).
    ///
    /// Default: 30 seconds
    pub request_timeout: Duration,

    /// Optional retry policy for establishing the transport in `connect()`.
    ///
    /// Calls themselves are never retried.
    pub retry_config: Option<RetryConfig>,

    /// Optional `api_sync_v2` handshake performed right after connecting.
    pub api_sync: Option<ApiVersion>,

    /// Compress outbound requests of at least this many bytes.
    pub compression_threshold: Option<usize>,

    /// Treat the connection as lost when the async channel stays silent
    /// this long after data started flowing.
    pub async_silence_timeout: Option<Duration>,
}

impl RpcConfig {
    /// Create a config for a TRex server on the default ports.
    pub fn new(server: impl Into<String>, transport_id: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            sync_port: DEFAULT_SYNC_PORT,
            async_port: Some(DEFAULT_ASYNC_PORT),
            transport_id: transport_id.into(),
            transport_type: None,
            request_timeout: Duration::from_secs(30),
            retry_config: None,
            api_sync: None,
            compression_threshold: None,
            async_silence_timeout: None,
        }
    }

    /// Create an in-memory transport config (no server process).
    pub fn memory(transport_id: impl Into<String>) -> Self {
        Self {
            transport_type: Some("memory".into()),
            ..Self::new("memory", transport_id)
        }
    }

    /// Set the synchronous RPC port.
    pub fn with_sync_port(mut self, port: u16) -> Self {
        self.sync_port = port;
        self
    }

    /// Set the asynchronous event port.
    pub fn with_async_port(mut self, port: u16) -> Self {
        self.async_port = Some(port);
        self
    }

    /// Disable the asynchronous event channel.
    pub fn without_async_channel(mut self) -> Self {
        self.async_port = None;
        self
    }

    /// Select the transport implementation explicitly.
    pub fn with_transport_type(mut self, transport_type: impl Into<String>) -> Self {
        self.transport_type = Some(transport_type.into());
        self
    }

    /// Configure retry behavior with exponential backoff for `connect()`.
    ///
    /// # Example
    ///
    /// ```
    /// use trex_rpc::{RetryConfig, RpcConfig};
    ///
    /// let config = RpcConfig::new("10.0.0.5", "client")
    ///     .with_retry(RetryConfig::default());
    /// ```
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry_config = Some(config);
        self
    }

    /// Set the timeout used by the convenience helpers.
    ///
    /// # Example
    ///
    /// ```
    /// use trex_rpc::RpcConfig;
    /// use std::time::Duration;
    ///
    /// let config = RpcConfig::new("10.0.0.5", "client")
    ///     .with_request_timeout(Duration::from_secs(5));
    /// assert_eq!(config.request_timeout, Duration::from_secs(5));
    /// ```
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Perform the `api_sync_v2` handshake after connecting.
    pub fn with_api_sync(mut self, version: ApiVersion) -> Self {
        self.api_sync = Some(version);
        self
    }

    /// Compress outbound requests at or above `bytes`.
    pub fn with_compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = Some(bytes);
        self
    }

    /// Enable async-channel silence detection.
    pub fn with_async_silence_timeout(mut self, timeout: Duration) -> Self {
        self.async_silence_timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_defaults() {
        // ---
        let config = RpcConfig::new("trex-01", "client");
        assert_eq!(config.sync_port, 4501);
        assert_eq!(config.async_port, Some(4500));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.retry_config.is_none());
        assert!(config.api_sync.is_none());
        assert!(config.transport_type.is_none());
    }

    #[test]
    fn test_memory_selects_memory_transport() {
        // ---
        let config = RpcConfig::memory("client");
        assert_eq!(config.transport_type.as_deref(), Some("memory"));
        assert_eq!(config.transport_id, "client");
    }

    #[test]
    fn test_builder_methods() {
        // ---
        let config = RpcConfig::new("trex-01", "client")
            .with_sync_port(5501)
            .without_async_channel()
            .with_api_sync(ApiVersion::stateless())
            .with_compression_threshold(256);

        assert_eq!(config.sync_port, 5501);
        assert_eq!(config.async_port, None);
        assert_eq!(config.api_sync, Some(ApiVersion::stateless()));
        assert_eq!(config.compression_threshold, Some(256));
    }
}
