//! Domain layer public interface.
//!
//! Transport-independent abstractions shared by the client and the concrete
//! transports. All consumers import symbols via this module, not by
//! referencing individual files directly.

mod transport;

pub use transport::{
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
