//! Production transport on top of `btleplug`.
//!
//! btleplug addresses characteristics by UUID, never by attribute handle, so
//! handle-addressed operations go through a [`HandleTable`]. CCCD writes are
//! mapped onto btleplug's subscribe/unsubscribe for the characteristic the
//! CCCD belongs to.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::handles::{
    characteristic_for_cccd, describe_handle, CCCD_DESCRIPTOR_UUID, CCCD_DISABLE,
    CCCD_ENABLE_NOTIFY, COMMAND_CHARACTERISTIC_UUID, HANDLE_COMMAND, HANDLE_INIT,
};
use crate::ble::transport::{
    DisconnectCallback, GattTarget, GattTransport, NotificationCallback, TransportConnector,
};
use crate::error::{Error, Result};

/// Default time spent scanning for a heater missing from the adapter cache.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Maps attribute value handles to characteristic UUIDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleTable {
    entries: HashMap<u16, Uuid>,
}

impl HandleTable {
    /// A table with no entries.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Add a mapping.
    pub fn with_characteristic(mut self, handle: u16, uuid: Uuid) -> Self {
        self.insert(handle, uuid);
        self
    }

    /// Add or replace a mapping.
    pub fn insert(&mut self, handle: u16, uuid: Uuid) {
        self.entries.insert(handle, uuid);
    }

    /// UUID of the characteristic at `handle`.
    pub fn uuid_for(&self, handle: u16) -> Option<Uuid> {
        self.entries.get(&handle).copied()
    }

    /// Handle of the characteristic with `uuid`.
    pub fn handle_for(&self, uuid: &Uuid) -> Option<u16> {
        self.entries
            .iter()
            .filter(|(_, u)| *u == uuid)
            .map(|(h, _)| *h)
            .min()
    }

    /// Check that the handles the unlock handshake needs are mapped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] naming the first unmapped handle.
    pub fn require_handshake_handles(&self) -> Result<()> {
        for handle in [HANDLE_INIT, HANDLE_COMMAND] {
            if self.uuid_for(handle).is_none() {
                return Err(Error::InvalidParameter {
                    name: "handle table".to_string(),
                    value: format!("no characteristic mapped for {}", describe_handle(handle)),
                });
            }
        }
        Ok(())
    }

    /// Parse a `HANDLE=UUID` pair such as `0x001f=0000f003-0000-1000-8000-00805f9b34fb`.
    pub fn parse_entry(entry: &str) -> Result<(u16, Uuid)> {
        let invalid = || Error::InvalidParameter {
            name: "handle mapping".to_string(),
            value: entry.to_string(),
        };

        let (handle, uuid) = entry.split_once('=').ok_or_else(invalid)?;
        let handle = handle.trim();
        let handle = handle
            .strip_prefix("0x")
            .or_else(|| handle.strip_prefix("0X"))
            .unwrap_or(handle);
        let handle = u16::from_str_radix(handle, 16).map_err(|_| invalid())?;
        let uuid = Uuid::parse_str(uuid.trim()).map_err(|_| invalid())?;

        Ok((handle, uuid))
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::empty().with_characteristic(HANDLE_COMMAND, COMMAND_CHARACTERISTIC_UUID)
    }
}

/// Resolves heater addresses on one Bluetooth adapter.
pub struct PlatformConnector {
    adapter: Adapter,
    handles: HandleTable,
    scan_timeout: Duration,
}

impl PlatformConnector {
    /// Use the first Bluetooth adapter on the system.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Use a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            handles: HandleTable::default(),
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
        }
    }

    /// Set the handle table given to every transport.
    ///
    /// A table without the unlock handle still supports connected-only
    /// diagnostics, but every handshake will fail.
    pub fn with_handles(mut self, handles: HandleTable) -> Self {
        if let Err(e) = handles.require_handshake_handles() {
            warn!("Handle table cannot unlock heaters: {}", e);
        }
        self.handles = handles;
        self
    }

    /// Set how long to scan for a heater missing from the adapter cache.
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// The adapter in use.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn find(&self, address: &str) -> Result<Option<Peripheral>> {
        let peripherals = self.adapter.peripherals().await?;
        Ok(peripherals
            .into_iter()
            .find(|p| matches_address(p, address)))
    }

    async fn scan_for(&self, address: &str) -> Result<Option<Peripheral>> {
        let deadline = Instant::now() + self.scan_timeout;
        loop {
            if let Some(peripheral) = self.find(address).await? {
                return Ok(Some(peripheral));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(SCAN_POLL_INTERVAL).await;
        }
    }
}

fn matches_address(peripheral: &Peripheral, address: &str) -> bool {
    peripheral.address().to_string().eq_ignore_ascii_case(address)
        || format!("{:?}", peripheral.id())
            .to_uppercase()
            .contains(&address.to_uppercase())
}

#[async_trait]
impl TransportConnector for PlatformConnector {
    async fn lookup(&self, address: &str) -> Result<Option<Arc<dyn GattTransport>>> {
        let peripheral = match self.find(address).await? {
            Some(peripheral) => Some(peripheral),
            None => {
                debug!(
                    "[{}] Not in adapter cache, scanning for up to {:?}",
                    address, self.scan_timeout
                );
                self.adapter.start_scan(ScanFilter::default()).await?;
                let found = self.scan_for(address).await;
                if let Err(e) = self.adapter.stop_scan().await {
                    debug!("Failed to stop scan: {}", e);
                }
                found?
            }
        };

        Ok(peripheral.map(|peripheral| {
            Arc::new(PlatformTransport::new(
                self.adapter.clone(),
                peripheral,
                self.handles.clone(),
            )) as Arc<dyn GattTransport>
        }))
    }
}

/// A link to one heater over btleplug.
pub struct PlatformTransport {
    adapter: Adapter,
    peripheral: Peripheral,
    handles: HandleTable,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PlatformTransport {
    /// Wrap a discovered peripheral.
    pub fn new(adapter: Adapter, peripheral: Peripheral, handles: HandleTable) -> Self {
        Self {
            adapter,
            peripheral,
            handles,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The underlying peripheral.
    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| Error::CharacteristicNotFound {
                target: uuid.to_string(),
            })
    }

    fn resolve(&self, target: GattTarget) -> Result<Characteristic> {
        let uuid = match target {
            GattTarget::Handle(handle) => {
                self.handles
                    .uuid_for(handle)
                    .ok_or_else(|| Error::CharacteristicNotFound {
                        target: describe_handle(handle),
                    })?
            }
            GattTarget::Uuid(uuid) => uuid,
        };
        self.characteristic(uuid)
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl GattTransport for PlatformTransport {
    async fn close_stale_connections(&self) -> Result<()> {
        if self.peripheral.is_connected().await? {
            info!("Peripheral already connected at BLE level, closing stale link");
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn connect(&self, on_disconnect: DisconnectCallback) -> Result<()> {
        self.peripheral.connect().await?;

        if let Err(e) = self.peripheral.discover_services().await {
            warn!("Failed to discover services: {}", e);
        }
        for characteristic in self.peripheral.characteristics() {
            debug!(
                "Found characteristic: {} in service {} ({:?})",
                characteristic.uuid, characteristic.service_uuid, characteristic.properties
            );
        }

        let mut events = self.adapter.events().await?;
        let id = self.peripheral.id();
        let watcher = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone == id {
                        on_disconnect();
                        break;
                    }
                }
            }
        });
        self.tasks.lock().push(watcher);

        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.abort_tasks();
        self.peripheral.disconnect().await?;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn read(&self, target: GattTarget) -> Result<Vec<u8>> {
        let characteristic = self.resolve(target)?;
        let data = self.peripheral.read(&characteristic).await?;
        trace!("Read {} bytes from {}", data.len(), target);
        Ok(data)
    }

    async fn write(&self, target: GattTarget, data: &[u8], with_response: bool) -> Result<()> {
        let characteristic = self.resolve(target)?;

        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        self.peripheral
            .write(&characteristic, data, write_type)
            .await?;

        trace!("Wrote {} bytes to {}", data.len(), target);
        Ok(())
    }

    async fn write_descriptor(&self, handle: u16, data: &[u8]) -> Result<()> {
        let value_handle =
            characteristic_for_cccd(handle).ok_or_else(|| Error::CharacteristicNotFound {
                target: describe_handle(handle),
            })?;
        let characteristic = self.resolve(GattTarget::Handle(value_handle))?;

        if data == CCCD_ENABLE_NOTIFY.as_slice() {
            self.peripheral.subscribe(&characteristic).await?;
        } else if data == CCCD_DISABLE.as_slice() {
            self.peripheral.unsubscribe(&characteristic).await?;
        } else {
            let descriptor = characteristic
                .descriptors
                .iter()
                .find(|d| d.uuid == CCCD_DESCRIPTOR_UUID)
                .cloned()
                .ok_or_else(|| Error::CharacteristicNotFound {
                    target: describe_handle(handle),
                })?;
            self.peripheral.write_descriptor(&descriptor, data).await?;
        }

        debug!("Configured {} via {}", describe_handle(handle), characteristic.uuid);
        Ok(())
    }

    async fn subscribe(&self, callback: NotificationCallback) -> Result<()> {
        let mut notifications = self.peripheral.notifications().await?;
        let handles = self.handles.clone();

        let pump = tokio::spawn(async move {
            debug!("Notification listener task starting");
            while let Some(notification) = notifications.next().await {
                let source = handles.handle_for(&notification.uuid).unwrap_or_default();
                callback(source, notification.value);
            }
            debug!("Notification stream ended");
        });
        self.tasks.lock().push(pump);

        Ok(())
    }
}

impl Drop for PlatformTransport {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
