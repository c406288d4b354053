//! High-level heater control.
//!
//! [`DeviceClient`] turns percentages into command bursts on top of a
//! [`SessionManager`], and exposes status and confirmation sinks plus a few
//! diagnostic helpers.

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::connection::{ConnectionEvent, ConnectionState};
use crate::ble::handles::{HANDLE_COMMAND, HANDLE_INIT};
use crate::ble::transport::{GattTarget, TransportConnector};
use crate::config::{ClientConfig, SessionConfig, WriteMode};
use crate::error::{Error, Result};
use crate::protocol::classifier::Confirmation;
use crate::protocol::codec::{Command, InitToken, Level, COMMAND_LENGTH, INIT_TOKEN_LENGTH};
use crate::session::{Readiness, SessionManager, StatusObservation, WriteOptions};
use crate::token_store::TokenStore;
use crate::utils::to_hex;

/// Pause before releasing the link after a status poll.
const POLL_RELEASE_DELAY: Duration = Duration::from_millis(500);

/// Handle for managing callback registration.
///
/// When dropped, the callback is automatically unregistered.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// A readable handle found by [`DeviceClient::scan_handles`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HandleReading {
    /// The attribute handle.
    pub handle: u16,
    /// The value read.
    pub value: Vec<u8>,
}

impl HandleReading {
    /// 9 bytes starting with `0xFF`, the shape of an init token.
    pub fn looks_like_init_token(&self) -> bool {
        self.value.len() == INIT_TOKEN_LENGTH && self.value.first() == Some(&0xFF)
    }

    /// The value as lowercase hex.
    pub fn hex(&self) -> String {
        to_hex(&self.value)
    }
}

/// Controls one heater.
pub struct DeviceClient {
    session: SessionManager,
    config: ClientConfig,
    callback_counter: AtomicU64,
}

impl DeviceClient {
    /// Create a client with default configuration.
    pub fn new(
        address: &str,
        connector: Arc<dyn TransportConnector>,
        tokens: Arc<dyn TokenStore>,
    ) -> Self {
        Self::with_config(
            address,
            connector,
            tokens,
            SessionConfig::default(),
            ClientConfig::default(),
        )
    }

    /// Create a client with explicit configuration.
    pub fn with_config(
        address: &str,
        connector: Arc<dyn TransportConnector>,
        tokens: Arc<dyn TokenStore>,
        session_config: SessionConfig,
        config: ClientConfig,
    ) -> Self {
        Self::from_session(
            SessionManager::new(address, connector, tokens, session_config),
            config,
        )
    }

    /// Wrap an existing session.
    pub fn from_session(session: SessionManager, config: ClientConfig) -> Self {
        Self {
            session,
            config,
            callback_counter: AtomicU64::new(0),
        }
    }

    /// The heater's address.
    pub fn address(&self) -> &str {
        self.session.address()
    }

    /// The underlying session.
    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Subscribe to connection state changes.
    pub fn subscribe_connection_state(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.session.subscribe_state()
    }

    /// The last authoritative level, if any.
    pub fn last_status(&self) -> Option<StatusObservation> {
        self.session.last_status()
    }

    // === Level control ===

    /// Set the heater to `percentage` (0, 33, 66 or 100).
    pub async fn set_level(&self, percentage: u8) -> Result<()> {
        let level = Level::from_percentage(percentage)?;
        self.apply_level(level).await
    }

    /// Set the heater to `level`.
    ///
    /// OFF is sent as a burst, other levels as a single write. The heater's
    /// 2-byte echo is awaited briefly; either way the commanded level is then
    /// published as the current status.
    pub async fn apply_level(&self, level: Level) -> Result<()> {
        let command = level.command();
        info!(
            "[{}] Setting heater to {} ({})",
            self.address(),
            level,
            command
        );

        self.session.ensure_ready().await?;

        let mut confirmations = self.session.subscribe_confirmations();
        self.session.expect_level(level);

        let options = if level == Level::Off {
            WriteOptions::repeated(false, self.config.off_repeat, self.config.off_interval)
        } else {
            WriteOptions::once(false)
        };
        self.session
            .write(self.command_target(), command.as_bytes(), options)
            .await?;

        self.await_confirmation(&mut confirmations, command).await;
        self.session.publish_assumed_status(level);
        Ok(())
    }

    /// Turn the heater on at the configured default level.
    pub async fn turn_on(&self) -> Result<()> {
        self.apply_level(self.config.default_on_level).await
    }

    /// Turn the heater off.
    pub async fn turn_off(&self) -> Result<()> {
        self.apply_level(Level::Off).await
    }

    fn command_target(&self) -> GattTarget {
        match self.config.write_mode {
            WriteMode::Handle => GattTarget::Handle(HANDLE_COMMAND),
            WriteMode::Uuid => GattTarget::Uuid(self.config.command_uuid),
        }
    }

    async fn await_confirmation(
        &self,
        confirmations: &mut broadcast::Receiver<Confirmation>,
        command: Command,
    ) {
        let wait = async {
            loop {
                match confirmations.recv().await {
                    Ok(confirmation) if command.is_confirmed_by(&confirmation.bytes) => {
                        return true;
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return false,
                }
            }
        };

        match tokio::time::timeout(self.config.confirmation_wait, wait).await {
            Ok(true) => debug!("[{}] Command {} confirmed", self.address(), command),
            _ => {
                let err = Error::Timeout {
                    operation: format!("confirmation of {}", command),
                };
                warn!("[{}] {}, assuming success", self.address(), err);
            }
        }
    }

    // === Raw writes ===

    /// Write raw bytes to the command handle.
    pub async fn write_command_raw(&self, data: &[u8], options: WriteOptions) -> Result<()> {
        self.write_raw_handle(HANDLE_COMMAND, data, options).await
    }

    /// Write raw bytes to any handle.
    pub async fn write_raw_handle(
        &self,
        handle: u16,
        data: &[u8],
        options: WriteOptions,
    ) -> Result<()> {
        if handle == 0 {
            return Err(Error::InvalidParameter {
                name: "handle".to_string(),
                value: format!("{:#06x}", handle),
            });
        }
        if data.is_empty() {
            return Err(Error::InvalidParameter {
                name: "data".to_string(),
                value: String::new(),
            });
        }

        info!(
            "[{}] Raw write to {:#06x}: {} (resp={}, repeat={})",
            self.address(),
            handle,
            to_hex(data),
            options.with_response,
            options.repeat
        );
        self.session
            .write(GattTarget::Handle(handle), data, options)
            .await
    }

    /// Write raw bytes to a characteristic by UUID.
    pub async fn write_raw_uuid(&self, uuid: Uuid, data: &[u8], with_response: bool) -> Result<()> {
        if data.is_empty() {
            return Err(Error::InvalidParameter {
                name: "data".to_string(),
                value: String::new(),
            });
        }

        info!(
            "[{}] Raw write to {}: {} (resp={})",
            self.address(),
            uuid,
            to_hex(data),
            with_response
        );
        self.session
            .write(
                GattTarget::Uuid(uuid),
                data,
                WriteOptions::once(with_response),
            )
            .await
    }

    /// Tear the link down; the next command reconnects.
    pub async fn disconnect(&self) -> Result<()> {
        self.session.disconnect().await
    }

    // === Status ===

    /// Register a callback invoked with every status observation.
    pub fn on_status<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&StatusObservation) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.session.subscribe_status();
        let address = self.address().to_string();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(observation) => callback(&observation),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("[{}] Status callback lagged by {} updates", address, skipped)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Register a callback invoked with every 2-byte command confirmation.
    pub fn on_confirmation<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn([u8; COMMAND_LENGTH]) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.session.subscribe_confirmations();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(confirmation) => callback(confirmation.bytes),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Subscribe to status observations.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusObservation> {
        self.session.subscribe_status()
    }

    /// Subscribe to command confirmations.
    pub fn subscribe_confirmations(&self) -> broadcast::Receiver<Confirmation> {
        self.session.subscribe_confirmations()
    }

    /// Connect, wait up to `wait` for a status report, then release the link.
    ///
    /// Each call has its own subscription, so concurrent polls do not
    /// interfere with each other or with registered callbacks.
    pub async fn poll_status(&self, wait: Duration) -> Result<Option<Level>> {
        let mut status = self.session.subscribe_status();
        self.session.ensure_ready().await?;

        let next = async {
            loop {
                match status.recv().await {
                    Ok(observation) => return Some(observation.level),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                }
            }
        };
        let level = match tokio::time::timeout(wait, next).await {
            Ok(level) => level,
            Err(_) => {
                debug!(
                    "[{}] No status within {:?} of polling",
                    self.address(),
                    wait
                );
                None
            }
        };

        tokio::time::sleep(POLL_RELEASE_DELAY).await;
        self.session.disconnect().await?;
        Ok(level)
    }

    // === Diagnostics ===

    /// Read the init token without unlocking, caching it when non-zero.
    pub async fn read_init_token(&self) -> Result<Option<InitToken>> {
        let value = self
            .session
            .read(GattTarget::Handle(HANDLE_INIT), Readiness::Connected)
            .await?;

        let token = match InitToken::from_slice(&value) {
            Ok(token) => token,
            Err(_) => {
                warn!(
                    "[{}] Init value has unexpected length {}: {}",
                    self.address(),
                    value.len(),
                    to_hex(&value)
                );
                return Ok(None);
            }
        };

        if token.is_all_zero() {
            debug!("[{}] Init value is all zero", self.address());
            return Ok(None);
        }

        info!("[{}] Read init token: {}", self.address(), token);
        self.session.token_store().set(self.address(), token);
        Ok(Some(token))
    }

    /// Read every handle in `range`, returning the readable ones.
    pub async fn scan_handles(&self, range: RangeInclusive<u16>) -> Result<Vec<HandleReading>> {
        if range.is_empty() || *range.start() == 0 {
            return Err(Error::InvalidParameter {
                name: "range".to_string(),
                value: format!("{:#06x}..={:#06x}", range.start(), range.end()),
            });
        }

        self.session.ensure_connected().await?;

        let mut readings = Vec::new();
        for handle in range {
            match self
                .session
                .read(GattTarget::Handle(handle), Readiness::Connected)
                .await
            {
                Ok(value) => {
                    debug!(
                        "[{}] Handle {:#06x}: {} ({} bytes)",
                        self.address(),
                        handle,
                        to_hex(&value),
                        value.len()
                    );
                    readings.push(HandleReading { handle, value });
                }
                Err(err) if err.is_fatal_for_session() => return Err(err),
                Err(err) => debug!("[{}] Handle {:#06x} skipped: {}", self.address(), handle, err),
            }
        }

        info!(
            "[{}] Scan found {} readable handles",
            self.address(),
            readings.len()
        );
        Ok(readings)
    }
}

impl std::fmt::Debug for DeviceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceClient")
            .field("address", &self.address())
            .field("state", &self.connection_state())
            .field("write_mode", &self.config.write_mode)
            .finish()
    }
}
