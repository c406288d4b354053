//! Session and client configuration.
//!
//! The defaults reproduce the timing observed in captured vendor-app traffic.

use std::time::Duration;

use uuid::Uuid;

use crate::ble::handles::COMMAND_CHARACTERISTIC_UUID;
use crate::protocol::classifier::DEFAULT_STALE_WINDOW;
use crate::protocol::codec::Level;

/// Tuning for a [`SessionManager`](crate::SessionManager).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionConfig {
    /// Inactivity before the link is released so the vendor app can connect.
    /// `None` keeps the link open until an explicit disconnect.
    pub idle_timeout: Option<Duration>,
    /// Pause after the link comes up, before anything is sent.
    pub post_connect_delay: Duration,
    /// Pause after the unlock write.
    pub init_settle_delay: Duration,
    /// Pause after each CCCD write.
    pub cccd_settle_delay: Duration,
    /// Window in which a status report contradicting the last command is dropped.
    pub stale_window: Duration,
}

impl SessionConfig {
    /// Default idle timeout (3 minutes).
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(180);

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the post-connect delay.
    pub fn with_post_connect_delay(mut self, delay: Duration) -> Self {
        self.post_connect_delay = delay;
        self
    }

    /// Set the stale-status window.
    pub fn with_stale_window(mut self, window: Duration) -> Self {
        self.stale_window = window;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Self::DEFAULT_IDLE_TIMEOUT),
            post_connect_delay: Duration::from_millis(300),
            init_settle_delay: Duration::from_millis(100),
            cccd_settle_delay: Duration::from_millis(50),
            stale_window: DEFAULT_STALE_WINDOW,
        }
    }
}

/// How level commands reach the heater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WriteMode {
    /// Write to the command handle directly. Works through BLE proxies.
    #[default]
    Handle,
    /// Write to the command characteristic by UUID.
    Uuid,
}

/// Tuning for a [`DeviceClient`](crate::DeviceClient).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClientConfig {
    /// How commands are addressed.
    pub write_mode: WriteMode,
    /// Characteristic used in [`WriteMode::Uuid`].
    pub command_uuid: Uuid,
    /// Level used by `turn_on`.
    pub default_on_level: Level,
    /// Number of OFF writes in a burst.
    pub off_repeat: u32,
    /// Spacing between OFF writes.
    pub off_interval: Duration,
    /// How long to wait for the command echo before assuming success.
    pub confirmation_wait: Duration,
}

impl ClientConfig {
    /// Set the write mode.
    pub fn with_write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    /// Set the command characteristic UUID.
    pub fn with_command_uuid(mut self, uuid: Uuid) -> Self {
        self.command_uuid = uuid;
        self
    }

    /// Set the level used by `turn_on`.
    pub fn with_default_on_level(mut self, level: Level) -> Self {
        self.default_on_level = level;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            write_mode: WriteMode::Handle,
            command_uuid: COMMAND_CHARACTERISTIC_UUID,
            default_on_level: Level::High,
            off_repeat: 21,
            off_interval: Duration::from_millis(16),
            confirmation_wait: Duration::from_millis(200),
        }
    }
}
