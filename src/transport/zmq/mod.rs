//! ZeroMQ transport implementation based on the pure-Rust `zeromq` crate.
//!
//! This module adapts the two TRex server sockets to the domain-level
//! `Transport` trait without leaking ZMQ concepts upward.
//!
//! # Features
//!
//! - Actor-based concurrency model with single socket ownership
//! - DEALER socket towards the server's REP socket, so several requests may
//!   be in flight at once
//! - Optional SUB socket on the async publisher, subscribed to everything
//! - Transparent handling of TRex compressed messages
//!
//! # Usage
//!
//! Enabled by default through the `transport_zmq` feature:
//!
//! ```toml
//! [dependencies]
//! trex-rpc = { version = "0.1", features = ["transport_zmq"] }
//! ```

mod transport;
pub use transport::create_transport;
