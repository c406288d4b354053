//! Wire codec for the heater's GATT payloads.
//!
//! Three payload shapes exist on the wire:
//! - Command (2 bytes): `[power_flag, level_code]`, written to the command
//!   characteristic and echoed back as a confirmation.
//! - Init token (9 bytes): round-tripped through the unlock characteristic.
//! - Status frame (17+ bytes): power flag at offset 15, level code at offset 16.
//!
//! Everything here is a pure byte transform.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::utils::{parse_hex, to_hex};

/// Length of a command and of its confirmation echo.
pub const COMMAND_LENGTH: usize = 2;

/// Length of the init/unlock token.
pub const INIT_TOKEN_LENGTH: usize = 9;

/// Shortest status frame that carries the power and level bytes.
pub const STATUS_MIN_LENGTH: usize = 17;

/// Offset of the power flag in a status frame.
pub const STATUS_POWER_BYTE: usize = 15;

/// Offset of the level code in a status frame.
pub const STATUS_LEVEL_BYTE: usize = 16;

/// Power flag: heater off.
pub const POWER_OFF: u8 = 0x00;
/// Power flag: heater on.
pub const POWER_ON: u8 = 0x01;

/// Level code for 33%.
pub const LEVEL_CODE_LOW: u8 = 0x21;
/// Level code for 66%.
pub const LEVEL_CODE_MEDIUM: u8 = 0x42;
/// Level code for 100%.
pub const LEVEL_CODE_HIGH: u8 = 0x64;

/// Heater output level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Level {
    /// 0%.
    Off,
    /// 33%.
    Low,
    /// 66%.
    Medium,
    /// 100%.
    High,
}

impl Level {
    /// Every level, lowest first.
    pub const ALL: [Level; 4] = [Level::Off, Level::Low, Level::Medium, Level::High];

    /// Map a percentage to a level.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLevel`] for anything but 0, 33, 66 or 100.
    pub fn from_percentage(percentage: u8) -> Result<Self> {
        match percentage {
            0 => Ok(Self::Off),
            33 => Ok(Self::Low),
            66 => Ok(Self::Medium),
            100 => Ok(Self::High),
            value => Err(Error::InvalidLevel { value }),
        }
    }

    /// The level as a percentage.
    pub fn percentage(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Low => 33,
            Self::Medium => 66,
            Self::High => 100,
        }
    }

    /// Whether the heater is producing heat at this level.
    pub fn is_on(self) -> bool {
        self != Self::Off
    }

    /// The command that drives the heater to this level.
    pub fn command(self) -> Command {
        match self {
            Self::Off => Command::OFF,
            Self::Low => Command::LOW,
            Self::Medium => Command::MEDIUM,
            Self::High => Command::HIGH,
        }
    }

    /// Level for an "on" level code.
    fn from_level_code(code: u8) -> Option<Self> {
        match code {
            LEVEL_CODE_LOW => Some(Self::Low),
            LEVEL_CODE_MEDIUM => Some(Self::Medium),
            LEVEL_CODE_HIGH => Some(Self::High),
            _ => None,
        }
    }
}

impl TryFrom<u8> for Level {
    type Error = Error;

    fn try_from(percentage: u8) -> Result<Self> {
        Self::from_percentage(percentage)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.percentage())
    }
}

/// A 2-byte heater command: `[power_flag, level_code]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command([u8; COMMAND_LENGTH]);

impl Command {
    /// Off. The level code is ignored by the heater but must be present.
    pub const OFF: Command = Command([POWER_OFF, LEVEL_CODE_LOW]);
    /// On at 33%.
    pub const LOW: Command = Command([POWER_ON, LEVEL_CODE_LOW]);
    /// On at 66%.
    pub const MEDIUM: Command = Command([POWER_ON, LEVEL_CODE_MEDIUM]);
    /// On at 100%.
    pub const HIGH: Command = Command([POWER_ON, LEVEL_CODE_HIGH]);

    /// Raw bytes as written to the command characteristic.
    pub fn as_bytes(&self) -> &[u8; COMMAND_LENGTH] {
        &self.0
    }

    /// The power flag byte.
    pub fn power_flag(&self) -> u8 {
        self.0[0]
    }

    /// The level code byte.
    pub fn level_code(&self) -> u8 {
        self.0[1]
    }

    /// The level this command selects, if it is one of the canonical four.
    pub fn level(&self) -> Option<Level> {
        Level::ALL.into_iter().find(|l| l.command() == *self)
    }

    /// Whether `payload` is the confirmation echo of this command.
    pub fn is_confirmed_by(&self, payload: &[u8]) -> bool {
        payload == self.0
    }
}

impl AsRef<[u8]> for Command {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&to_hex(&self.0))
    }
}

/// Encode a percentage as a heater command.
///
/// # Errors
///
/// Returns [`Error::InvalidLevel`] for anything but 0, 33, 66 or 100.
pub fn encode_command(percentage: u8) -> Result<Command> {
    Level::from_percentage(percentage).map(Level::command)
}

/// Decode the heater level from a status frame.
///
/// Returns `None` for frames shorter than [`STATUS_MIN_LENGTH`] and for
/// power-on frames whose level code is not recognised.
pub fn decode_status(payload: &[u8]) -> Option<Level> {
    if payload.len() < STATUS_MIN_LENGTH {
        return None;
    }

    match payload[STATUS_POWER_BYTE] {
        POWER_OFF => Some(Level::Off),
        POWER_ON => Level::from_level_code(payload[STATUS_LEVEL_BYTE]),
        _ => None,
    }
}

/// Whether a notification payload has the shape of a command confirmation.
pub fn is_confirmation(payload: &[u8]) -> bool {
    payload.len() == COMMAND_LENGTH
}

/// The 9-byte unlock token.
///
/// The token belongs to the device rather than to a connection, so it is
/// cached per endpoint and reused across sessions.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InitToken([u8; INIT_TOKEN_LENGTH]);

impl InitToken {
    /// Payload captured from the vendor app, used when nothing better exists.
    pub const STATIC_FALLBACK: InitToken =
        InitToken([0xFF, 0xFF, 0xFF, 0xFD, 0x94, 0x34, 0x00, 0x00, 0x00]);

    /// Create a token from its raw bytes.
    pub const fn new(bytes: [u8; INIT_TOKEN_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Create a token from a slice.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] unless the slice is exactly 9 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        <[u8; INIT_TOKEN_LENGTH]>::try_from(bytes)
            .map(Self)
            .map_err(|_| Error::InvalidParameter {
                name: "init_token".to_string(),
                value: to_hex(bytes),
            })
    }

    /// Raw token bytes.
    pub fn as_bytes(&self) -> &[u8; INIT_TOKEN_LENGTH] {
        &self.0
    }

    /// Whether every byte is zero, which the heater reports when it has no token to offer.
    pub fn is_all_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Hex representation, as persisted by hosts.
    pub fn to_hex(&self) -> String {
        to_hex(&self.0)
    }
}

impl fmt::Debug for InitToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InitToken({})", self.to_hex())
    }
}

impl fmt::Display for InitToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for InitToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_slice(&parse_hex(s)?)
    }
}

/// Where the token written during the handshake came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// The value read from the device, echoed back unchanged.
    Echoed,
    /// The token cached for this endpoint.
    Cached,
    /// [`InitToken::STATIC_FALLBACK`].
    Static,
}

/// Outcome of [`select_init_token`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSelection {
    /// Bytes to write back to the unlock characteristic.
    pub bytes: Vec<u8>,
    /// Where they came from.
    pub source: TokenSource,
}

/// Choose the payload for the unlock write.
///
/// Precedence: an all-zero read with a cached token uses the cache; any other
/// non-empty read is echoed; an empty or failed read uses the cache if there
/// is one and the static payload otherwise.
pub fn select_init_token(read: Option<&[u8]>, cached: Option<&InitToken>) -> TokenSelection {
    let read = read.filter(|value| !value.is_empty());

    match (read, cached) {
        (Some(value), Some(token)) if value.iter().all(|b| *b == 0) => TokenSelection {
            bytes: token.as_bytes().to_vec(),
            source: TokenSource::Cached,
        },
        (Some(value), _) => TokenSelection {
            bytes: value.to_vec(),
            source: TokenSource::Echoed,
        },
        (None, Some(token)) => TokenSelection {
            bytes: token.as_bytes().to_vec(),
            source: TokenSource::Cached,
        },
        (None, None) => TokenSelection {
            bytes: InitToken::STATIC_FALLBACK.as_bytes().to_vec(),
            source: TokenSource::Static,
        },
    }
}

/// Build a 20-byte status frame shaped like the heater's, for tests.
#[cfg(test)]
pub(crate) fn status_frame(power: u8, level_code: u8) -> Vec<u8> {
    let mut frame = vec![
        0x14, 0x20, 0x03, 0x7E, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x21,
        0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    frame[STATUS_POWER_BYTE] = power;
    frame[STATUS_LEVEL_BYTE] = level_code;
    frame
}

/// Status frame reporting `level`, for tests.
#[cfg(test)]
pub(crate) fn status_frame_for(level: Level) -> Vec<u8> {
    let command = level.command();
    status_frame(command.power_flag(), command.level_code())
}
