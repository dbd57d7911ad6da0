//! Transport builder for creating transport instances.
//!
//! Provides a fluent builder API for constructing transports with clear separation
//! between required and optional configuration.

use crate::{
    // ---
    Result,
    RpcError,
    TransportConfig,
    TransportMode,
    TransportPtr,
    DEFAULT_ASYNC_PORT,
    DEFAULT_SYNC_PORT,
};

/// Builder for creating transport instances.
///
/// # Examples
///
/// ## Client connected to a TRex server
/// ```no_run
/// use trex_rpc::TransportBuilder;
///
/// # async fn example() -> trex_rpc::Result<()> {
/// let transport = TransportBuilder::new()
///     .server("10.0.0.5")
///     .node_id("trex-client")
///     .client_mode()
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
///
/// ## In-process server emulation
/// ```
/// use trex_rpc::{TransportBuilder, TransportMode};
///
/// # async fn example() -> trex_rpc::Result<()> {
/// let transport = TransportBuilder::new()
///     .server("memory")
///     .node_id("fake-trex")
///     .server_mode()
///     .transport_type("memory")
///     .build()
///     .await?;
/// assert_eq!(transport.mode(), TransportMode::Server);
/// # Ok(())
/// # }
/// ```
pub struct TransportBuilder {
    server: Option<String>,
    node_id: Option<String>,
    sync_port: u16,
    async_port: Option<u16>,
    transport_type: Option<String>,
    compression_threshold: Option<usize>,

    // Track which sugar methods were called (conflicts detected at build())
    called_client_mode: bool,
    called_server_mode: bool,
}

impl TransportBuilder {
    /// Create a new transport builder.
    pub fn new() -> Self {
        Self {
            server: None,
            node_id: None,
            sync_port: DEFAULT_SYNC_PORT,
            async_port: Some(DEFAULT_ASYNC_PORT),
            transport_type: None,
            compression_threshold: None,
            called_client_mode: false,
            called_server_mode: false,
        }
    }

    /// Set the TRex server host (required).
    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    /// Set the node ID (required).
    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.node_id = Some(id.into());
        self
    }

    /// Set the synchronous RPC port. Default: 4501.
    pub fn sync_port(mut self, port: u16) -> Self {
        self.sync_port = port;
        self
    }

    /// Set the async publisher port. Default: 4500.
    pub fn async_port(mut self, port: u16) -> Self {
        self.async_port = Some(port);
        self
    }

    /// Do not open the async publisher channel.
    pub fn no_async_channel(mut self) -> Self {
        self.async_port = None;
        self
    }

    /// Configure for client mode (sugar method, also the default).
    ///
    /// Cannot be used together with `server_mode()`.
    pub fn client_mode(mut self) -> Self {
        self.called_client_mode = true;
        self
    }

    /// Configure for server mode (sugar method).
    ///
    /// Only the memory transport implements the server side.
    ///
    /// Cannot be used together with `client_mode()`.
    pub fn server_mode(mut self) -> Self {
        self.called_server_mode = true;
        self
    }

    /// Set explicit transport type.
    ///
    /// Valid values: `"memory"`, `"zmq"`
    ///
    /// If not specified, ZMQ is used when the `transport_zmq` feature is
    /// enabled and the memory transport otherwise.
    pub fn transport_type(mut self, flag: impl Into<String>) -> Self {
        self.transport_type = Some(flag.into());
        self
    }

    /// Compress outbound payloads of at least `bytes` bytes.
    pub fn compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = Some(bytes);
        self
    }

    /// Validate the settings into a [`TransportConfig`].
    ///
    /// # Errors
    ///
    /// - [`RpcError::MissingConfig`] when `server` or `node_id` is missing
    /// - [`RpcError::ConfigConflict`] when both mode sugar methods were called
    pub fn config(self) -> Result<TransportConfig> {
        // ---
        let server = self
            .server
            .ok_or_else(|| RpcError::MissingConfig("server".into()))?;
        let node_id = self
            .node_id
            .ok_or_else(|| RpcError::MissingConfig("node_id".into()))?;

        if self.called_client_mode && self.called_server_mode {
            return Err(RpcError::ConfigConflict(
                "Cannot call both client_mode and server_mode".into(),
            ));
        }

        let mode = if self.called_server_mode {
            TransportMode::Server
        } else {
            TransportMode::Client
        };

        Ok(TransportConfig {
            server,
            sync_port: self.sync_port,
            async_port: self.async_port,
            node_id,
            mode,
            transport_type: self.transport_type,
            compression_threshold: self.compression_threshold,
        })
    }

    /// Build the transport (consumes self).
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Required fields missing (`server`, `node_id`)
    /// - Both mode sugar methods called
    /// - Unknown transport type
    /// - Transport creation fails
    pub async fn build(self) -> Result<TransportPtr> {
        // ---
        create_transport(self.config()?).await
    }
}

impl Default for TransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatch a config to the matching transport factory.
///
/// When `transport_type` is `None`, ZMQ is chosen if compiled in, else
/// memory. A failing ZMQ connection is reported, never replaced by memory.
pub async fn create_transport(config: TransportConfig) -> Result<TransportPtr> {
    // ---
    match config.transport_type.as_deref() {
        Some("zmq") => crate::create_zmq_transport(config).await,
        Some("memory") => crate::create_memory_transport(config).await,
        Some(other) => Err(RpcError::Transport(format!(
            "unrecognized transport_type: {other}, valid values: memory, zmq"
        ))),
        None if cfg!(feature = "transport_zmq") => crate::create_zmq_transport(config).await,
        None => crate::create_memory_transport(config).await,
    }
}
