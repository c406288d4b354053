//! Raw GATT transport abstraction.
//!
//! The session engine drives the heater through these two traits so it can
//! run against [`btleplug`](crate::ble::platform) on real hardware and against
//! an in-memory fake in tests.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;

/// Sink for inbound notifications: `(source_handle, payload)`.
pub type NotificationCallback = Arc<dyn Fn(u16, Vec<u8>) + Send + Sync>;

/// Invoked once when the transport observes the link dropping.
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Address of a GATT attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GattTarget {
    /// Raw attribute handle.
    Handle(u16),
    /// Characteristic UUID.
    Uuid(Uuid),
}

impl fmt::Display for GattTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handle(handle) => write!(f, "handle {:#06x}", handle),
            Self::Uuid(uuid) => write!(f, "uuid {}", uuid),
        }
    }
}

impl From<u16> for GattTarget {
    fn from(handle: u16) -> Self {
        Self::Handle(handle)
    }
}

impl From<Uuid> for GattTarget {
    fn from(uuid: Uuid) -> Self {
        Self::Uuid(uuid)
    }
}

/// One radio link to one endpoint.
///
/// Implementations need not tolerate concurrent operations; the session
/// serializes every call.
#[async_trait]
pub trait GattTransport: Send + Sync {
    /// Close connections to this endpoint left over from earlier clients.
    async fn close_stale_connections(&self) -> Result<()>;

    /// Establish the link. `on_disconnect` fires when the link later drops.
    async fn connect(&self, on_disconnect: DisconnectCallback) -> Result<()>;

    /// Tear the link down.
    async fn disconnect(&self) -> Result<()>;

    /// Whether the link is currently up.
    async fn is_connected(&self) -> bool;

    /// Read a characteristic value.
    async fn read(&self, target: GattTarget) -> Result<Vec<u8>>;

    /// Write a characteristic value, with or without a write response.
    async fn write(&self, target: GattTarget, data: &[u8], with_response: bool) -> Result<()>;

    /// Write a descriptor by handle.
    async fn write_descriptor(&self, handle: u16, data: &[u8]) -> Result<()>;

    /// Route every inbound notification to `callback`.
    ///
    /// This must not arm any CCCD; the handshake arms them explicitly and in
    /// a fixed order.
    async fn subscribe(&self, callback: NotificationCallback) -> Result<()>;
}

/// Resolves an endpoint address to a transport.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Look up a connectable transport for `address`.
    ///
    /// Returns `Ok(None)` if the endpoint is not known or not connectable.
    async fn lookup(&self, address: &str) -> Result<Option<Arc<dyn GattTransport>>>;
}
