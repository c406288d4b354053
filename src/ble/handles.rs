//! GATT handle map and UUIDs.
//!
//! The heater's attribute handles were recovered from sniffed vendor-app
//! traffic. They are protocol constants, not configuration.

use uuid::Uuid;

/// Init/unlock characteristic (read + write, 9-byte token).
pub const HANDLE_INIT: u16 = 0x001F;
/// Command characteristic (write commands, notify 2-byte confirmations).
pub const HANDLE_COMMAND: u16 = 0x0028;
/// CCCD for the command characteristic.
pub const CCCD_COMMAND: u16 = 0x0029;
/// Status-byte characteristic (notify, 3-byte diagnostic frames).
pub const HANDLE_STATUS_BYTE: u16 = 0x002F;
/// CCCD for the status-byte characteristic.
pub const CCCD_STATUS_BYTE: u16 = 0x0030;
/// Status-data characteristic (notify, 17+ byte status frames).
pub const HANDLE_STATUS_DATA: u16 = 0x0032;
/// CCCD for the status-data characteristic.
pub const CCCD_STATUS_DATA: u16 = 0x0033;

/// Value written to a CCCD to enable notifications.
pub const CCCD_ENABLE_NOTIFY: [u8; 2] = [0x01, 0x00];

/// Value written to a CCCD to disable notifications.
pub const CCCD_DISABLE: [u8; 2] = [0x00, 0x00];

/// Order in which the handshake arms notifications.
///
/// The command channel must come last: the firmware rejects commands if it
/// is armed before the unlock write has settled.
pub const HANDSHAKE_CCCD_ORDER: [u16; 3] = [CCCD_STATUS_BYTE, CCCD_STATUS_DATA, CCCD_COMMAND];

/// Vendor service UUID.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_f000_0000_1000_8000_00805f9b34fb);
/// Command characteristic UUID (value handle 0x0028).
pub const COMMAND_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_f001_0000_1000_8000_00805f9b34fb);
/// Secondary vendor characteristic UUID.
pub const ALT_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000_f002_0000_1000_8000_00805f9b34fb);
/// Standard Client Characteristic Configuration Descriptor UUID.
pub const CCCD_DESCRIPTOR_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);

/// Semantic role of a known handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleRole {
    /// Unlock token characteristic.
    Init,
    /// Command characteristic.
    Command,
    /// Status-byte characteristic.
    StatusByte,
    /// Status-data characteristic.
    StatusData,
    /// CCCD of the command characteristic.
    CommandCccd,
    /// CCCD of the status-byte characteristic.
    StatusByteCccd,
    /// CCCD of the status-data characteristic.
    StatusDataCccd,
}

impl HandleRole {
    /// Role of `handle`, if it is part of the protocol.
    pub fn of(handle: u16) -> Option<Self> {
        match handle {
            HANDLE_INIT => Some(Self::Init),
            HANDLE_COMMAND => Some(Self::Command),
            HANDLE_STATUS_BYTE => Some(Self::StatusByte),
            HANDLE_STATUS_DATA => Some(Self::StatusData),
            CCCD_COMMAND => Some(Self::CommandCccd),
            CCCD_STATUS_BYTE => Some(Self::StatusByteCccd),
            CCCD_STATUS_DATA => Some(Self::StatusDataCccd),
            _ => None,
        }
    }

    /// Whether this role is a descriptor rather than a characteristic value.
    pub fn is_cccd(self) -> bool {
        matches!(
            self,
            Self::CommandCccd | Self::StatusByteCccd | Self::StatusDataCccd
        )
    }
}

/// Characteristic value handle a CCCD configures.
///
/// On this device each CCCD directly follows its value handle.
pub fn characteristic_for_cccd(cccd: u16) -> Option<u16> {
    match cccd {
        CCCD_COMMAND => Some(HANDLE_COMMAND),
        CCCD_STATUS_BYTE => Some(HANDLE_STATUS_BYTE),
        CCCD_STATUS_DATA => Some(HANDLE_STATUS_DATA),
        _ => None,
    }
}

/// Human-readable name of a handle for logs.
pub fn describe_handle(handle: u16) -> String {
    match HandleRole::of(handle) {
        Some(role) => format!("{:#06x} ({:?})", handle, role),
        None => format!("{:#06x}", handle),
    }
}
