//! Error types for the solamagic-ble crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The endpoint could not be resolved to a connectable device.
    #[error("[{address}] Bluetooth device lookup failed: {reason}")]
    LookupFailed {
        /// Address of the endpoint.
        address: String,
        /// Why the lookup failed.
        reason: String,
    },

    /// The transport failed to establish a connection.
    #[error("[{address}] Bluetooth connect failed: {reason}")]
    ConnectFailed {
        /// Address of the endpoint.
        address: String,
        /// Description of why the connection failed.
        reason: String,
    },

    /// A mandatory step of the initialization handshake failed.
    #[error("[{address}] Initialization failed during {stage}: {reason}")]
    InitFailed {
        /// Address of the endpoint.
        address: String,
        /// Handshake stage that failed.
        stage: &'static str,
        /// Underlying cause.
        reason: String,
    },

    /// A GATT write failed.
    #[error("[{address}] Write to {target} failed: {reason}")]
    WriteFailed {
        /// Address of the endpoint.
        address: String,
        /// Handle or UUID that was written.
        target: String,
        /// Underlying cause.
        reason: String,
    },

    /// A GATT read failed.
    #[error("[{address}] Read from {target} failed: {reason}")]
    ReadFailed {
        /// Address of the endpoint.
        address: String,
        /// Handle or UUID that was read.
        target: String,
        /// Underlying cause.
        reason: String,
    },

    /// The caller passed a level the heater does not support.
    #[error("Invalid level: {value}% (must be one of 0, 33, 66, 100)")]
    InvalidLevel {
        /// The rejected percentage.
        value: u8,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// An expected response did not arrive in time.
    #[error("Timed out waiting for {operation}")]
    Timeout {
        /// What was being waited for.
        operation: String,
    },

    /// Operation requires a live link but the session is disconnected.
    #[error("Heater not connected")]
    NotConnected,

    /// Characteristic could not be resolved on the device.
    #[error("Characteristic not found: {target}")]
    CharacteristicNotFound {
        /// The handle or UUID that could not be resolved.
        target: String,
    },

    /// A transport backend reported an error that has no richer mapping.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Whether this error leaves the session unusable, so the link must be
    /// torn down back to `Disconnected` before the next attempt.
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(
            self,
            Self::LookupFailed { .. }
                | Self::ConnectFailed { .. }
                | Self::InitFailed { .. }
                | Self::NotConnected
                | Self::BluetoothUnavailable
        )
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
