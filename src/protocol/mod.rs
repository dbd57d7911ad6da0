//! Wire types of the TRex RPC protocol.
//!
//! This module defines the JSON-RPC request/response format used on the
//! sync socket, the async publisher's message format, correlation ID
//! management and the compressed-message framing shared by both sockets.
mod correlation;
mod event;
mod message;
pub mod zipped;

pub use correlation::{CorrelationId, CorrelationIdGen};
pub use event::{AsyncEvent, AsyncTopic, ServerEvent, StatsSnapshot};
pub use message::{ErrorObject, Inbound, Params, Request, Response, JSONRPC_VERSION};
