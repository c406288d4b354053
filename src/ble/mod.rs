//! BLE communication module.
//!
//! Handle map, connection state, the transport seam and the btleplug
//! backend that implements it.

pub mod connection;
pub mod handles;
pub mod platform;
pub mod transport;

#[cfg(test)]
pub(crate) mod fake;

pub use connection::{ConnectionEvent, ConnectionState};
pub use handles::*;
pub use platform::{HandleTable, PlatformConnector, PlatformTransport};
pub use transport::{
    DisconnectCallback, GattTarget, GattTransport, NotificationCallback, TransportConnector,
};
