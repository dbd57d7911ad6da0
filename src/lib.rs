//! Async JSON-RPC client for the TRex stateless server
//!
//! TRex exposes two sockets: a synchronous JSON-RPC 2.0 socket (port 4501)
//! and an asynchronous publisher (port 4500) that streams statistics, port
//! events and barrier acknowledgements. This library correlates requests
//! with responses, handles timeouts and concurrent calls, injects the API
//! handler into core commands and fans async events out to subscribers.
//! [`TrexPort`] adds typed port ownership, traffic and counter operations on
//! top of the client.
//!
//! ```no_run
//! use std::time::Duration;
//! use trex_rpc::{ApiVersion, RpcClient, RpcConfig};
//!
//! # async fn example() -> trex_rpc::Result<()> {
//! let config = RpcConfig::new("10.0.0.5", "client").with_api_sync(ApiVersion::stateless());
//! let client = RpcClient::new(config);
//! client.connect().await?;
//!
//! let version = client.get_version(Duration::from_secs(5)).await?;
//! println!("TRex {}", version.version);
//!
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

// Import all sub modules once...
mod macros;
pub(crate) use macros::{log_debug, log_error, log_info, log_trace, log_warn};

mod client;
mod commands;
mod connection_state;
mod domain;
mod error;
pub mod protocol;
mod port;
mod retry;
mod rpc_config;
mod transport;
mod transport_builder;

// Re-export main types
pub use client::{Batch, EventSubscription, RpcClient, VersionInfo, DEFAULT_CHUNK_SIZE};

pub use rpc_config::{ApiVersion, RpcConfig, DEFAULT_ASYNC_PORT, DEFAULT_SYNC_PORT};
pub use retry::RetryConfig;

pub use commands::{lookup as lookup_command, ApiClass, CommandDescriptor, Dispatch, COMMANDS};
pub use connection_state::ConnectionState;
pub use error::{RemoteError, Result, RpcError};

pub use port::{
    //
    Multiplier,
    MultiplierKind,
    MultiplierOp,
    PortState,
    PortStatus,
    TrafficOptions,
    TrexPort,
};

pub use protocol::{AsyncEvent, AsyncTopic, CorrelationId, ServerEvent, StatsSnapshot};

pub use transport::{create_memory_transport, create_memory_transport_with_hub, MemoryHub};
pub use transport::create_zmq_transport;
pub use transport_builder::{create_transport, TransportBuilder};

// --- public re-exports
pub use domain::{
    //
    Channel,
    Envelope,
    Subscription,
    SubscriptionHandle,
    Transport,
    TransportBase,
    TransportConfig,
    TransportMode,
    TransportPtr,
};
