//! Registry of heater clients keyed by address.
//!
//! Hosts hold one [`HeaterRegistry`] and look heaters up through it instead
//! of keeping per-address state of their own. Each heater gets its own
//! session; heaters share nothing but the connector and token store.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::ble::platform::{HandleTable, PlatformConnector};
use crate::ble::transport::TransportConnector;
use crate::client::DeviceClient;
use crate::config::{ClientConfig, SessionConfig};
use crate::error::Result;
use crate::token_store::{MemoryTokenStore, TokenStore};

/// Owns one [`DeviceClient`] per heater.
pub struct HeaterRegistry {
    connector: Arc<dyn TransportConnector>,
    tokens: Arc<dyn TokenStore>,
    session_config: SessionConfig,
    client_config: ClientConfig,
    clients: RwLock<HashMap<String, Arc<DeviceClient>>>,
}

impl HeaterRegistry {
    /// Create a registry over the given connector and token store.
    pub fn new(connector: Arc<dyn TransportConnector>, tokens: Arc<dyn TokenStore>) -> Self {
        Self {
            connector,
            tokens,
            session_config: SessionConfig::default(),
            client_config: ClientConfig::default(),
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry on the first Bluetooth adapter, caching tokens in memory.
    ///
    /// `handles` must map at least the unlock handle (0x001F) and the command
    /// handle (0x0028) to the characteristic UUIDs the heaters report.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`](crate::Error::InvalidParameter) if
    /// `handles` cannot drive the handshake, or an error if Bluetooth is not
    /// available.
    pub async fn with_platform(handles: HandleTable) -> Result<Self> {
        handles.require_handshake_handles()?;
        let connector = PlatformConnector::new().await?.with_handles(handles);
        Ok(Self::new(
            Arc::new(connector),
            Arc::new(MemoryTokenStore::new()),
        ))
    }

    /// Configuration applied to clients created from now on.
    pub fn with_config(mut self, session_config: SessionConfig, client_config: ClientConfig) -> Self {
        self.session_config = session_config;
        self.client_config = client_config;
        self
    }

    /// Canonical form of an address.
    pub fn normalize_address(address: &str) -> String {
        address.trim().to_uppercase()
    }

    /// Get the client for `address`, creating it if needed. Does not connect.
    pub fn get_or_insert(&self, address: &str) -> Arc<DeviceClient> {
        let key = Self::normalize_address(address);

        if let Some(client) = self.clients.read().get(&key) {
            return client.clone();
        }

        self.clients
            .write()
            .entry(key)
            .or_insert_with_key(|key| {
                info!("[{}] Registering heater", key);
                Arc::new(DeviceClient::with_config(
                    key,
                    self.connector.clone(),
                    self.tokens.clone(),
                    self.session_config.clone(),
                    self.client_config.clone(),
                ))
            })
            .clone()
    }

    /// Get the client for `address`, if registered.
    pub fn get(&self, address: &str) -> Option<Arc<DeviceClient>> {
        self.clients
            .read()
            .get(&Self::normalize_address(address))
            .cloned()
    }

    /// All registered clients.
    pub fn clients(&self) -> HashMap<String, Arc<DeviceClient>> {
        self.clients.read().clone()
    }

    /// Registered addresses, sorted.
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.clients.read().keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Number of registered heaters.
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    /// Whether no heaters are registered.
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Unregister a heater, disconnecting it first.
    pub async fn remove(&self, address: &str) -> Result<Option<Arc<DeviceClient>>> {
        let removed = self
            .clients
            .write()
            .remove(&Self::normalize_address(address));

        if let Some(client) = &removed {
            debug!("[{}] Unregistering heater", client.address());
            client.disconnect().await?;
        }
        Ok(removed)
    }

    /// Disconnect every heater and clear the registry.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down heater registry");

        let clients: Vec<_> = self.clients.read().values().cloned().collect();
        for client in clients {
            if let Err(e) = client.disconnect().await {
                warn!("Error disconnecting heater {}: {}", client.address(), e);
            }
        }

        self.clients.write().clear();

        Ok(())
    }
}

impl std::fmt::Debug for HeaterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaterRegistry")
            .field("heaters", &self.addresses())
            .finish()
    }
}
