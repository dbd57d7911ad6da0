//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Transport` trait. Socket-backed transports are hidden behind feature
//! flags and exposed only through constructor functions.
//!
//! Domain code must not depend on transport-specific types.

mod memory;

#[cfg(feature = "transport_zmq")]
mod zmq;

pub use memory::{create_memory_transport, create_memory_transport_with_hub, MemoryHub};

#[cfg(feature = "transport_zmq")]
pub use zmq::create_transport as create_zmq_transport;

/// Null-object constructor used when the `transport_zmq` feature is off.
#[cfg(not(feature = "transport_zmq"))]
pub async fn create_zmq_transport(
    _config: crate::TransportConfig,
) -> crate::Result<crate::TransportPtr> {
    // ---
    Err(crate::RpcError::Transport(
        "zmq transport not enabled; build with feature `transport_zmq`".into(),
    ))
}
