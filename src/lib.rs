// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # solamagic-ble
//!
//! Control for Solamagic BLE patio heaters.
//!
//! The heater accepts one BLE central at a time, must be unlocked with a
//! 9-byte token after every connect, and answers commands with a 2-byte echo
//! rather than a dependable status report. This library owns that dance:
//!
//! - **Sessions**: one serialized link per heater, released after 3 minutes
//!   idle so the vendor app can connect
//! - **Handshake**: unlock write, then notification CCCDs with the command
//!   channel armed last
//! - **Levels**: OFF / 33% / 66% / 100%, with the OFF burst the firmware needs
//! - **Status**: decoded notifications, filtered against the last command so
//!   late frames cannot undo it
//! - **Diagnostics**: raw handle/UUID writes, handle scans, init-token reads
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use solamagic_ble::{HandleTable, HeaterRegistry, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Unlock characteristic as reported by your heater's GATT table
//!     let (handle, uuid) =
//!         HandleTable::parse_entry("0x001f=0000f002-0000-1000-8000-00805f9b34fb")?;
//!     let handles = HandleTable::default().with_characteristic(handle, uuid);
//!
//!     let registry = HeaterRegistry::with_platform(handles).await?;
//!     let heater = registry.get_or_insert("C4:4F:33:8B:6C:36");
//!
//!     let _handle = heater.on_status(|status| {
//!         println!("Heater at {}", status.level);
//!     });
//!
//!     heater.set_level(66).await?;
//!     heater.turn_off().await?;
//!
//!     registry.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! btleplug addresses characteristics by UUID only. Handle-addressed
//! operations on real hardware go through a [`HandleTable`]. The default
//! table maps only the command handle; the unlock handle (0x001F) must be
//! added before any heater can be unlocked, and
//! [`HeaterRegistry::with_platform`] refuses a table without it. Status
//! handles are optional.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for levels, tokens,
//!   observations and configuration

// Public modules
pub mod ble;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod token_store;
pub mod utils;

// Re-exports for convenience
pub use client::{CallbackHandle, DeviceClient, HandleReading};
pub use config::{ClientConfig, SessionConfig, WriteMode};
pub use error::{Error, Result};
pub use registry::HeaterRegistry;
pub use session::{Readiness, SessionManager, StatusObservation, StatusSource, WriteOptions};
pub use token_store::{MemoryTokenStore, TokenStore};
pub use utils::{parse_hex, to_hex};

// Re-export commonly used types from submodules
pub use ble::connection::{ConnectionEvent, ConnectionState};
pub use ble::platform::{HandleTable, PlatformConnector};
pub use ble::transport::{GattTarget, GattTransport, TransportConnector};
pub use protocol::{Command, Confirmation, InitToken, Level};
