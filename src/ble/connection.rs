//! Connection state tracking.

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

/// Connection state of a heater session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No link.
    #[default]
    Disconnected,
    /// Resolving the endpoint and establishing the link.
    Connecting,
    /// Link up, initialization handshake not yet complete.
    Connected,
    /// Link up and unlocked; commands are accepted.
    Ready,
    /// Tearing the link down.
    Disconnecting,
}

impl ConnectionState {
    /// Check if a link is up.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Ready)
    }

    /// Check if the session accepts commands.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Event for connection state changes.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    /// Address of the heater.
    pub address: String,
    /// The new connection state.
    pub state: ConnectionState,
}

/// Holds the current state and broadcasts transitions.
pub(crate) struct ConnectionTracker {
    address: String,
    state: RwLock<ConnectionState>,
    event_tx: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionTracker {
    pub(crate) fn new(address: String) -> Self {
        let (event_tx, _) = broadcast::channel(16);

        Self {
            address,
            state: RwLock::new(ConnectionState::Disconnected),
            event_tx,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Update the state and emit an event if it changed.
    pub(crate) fn set(&self, new_state: ConnectionState) {
        let old_state = {
            let mut state = self.state.write();
            let old = *state;
            *state = new_state;
            old
        };

        if old_state != new_state {
            debug!(
                "[{}] Connection state changed: {} -> {}",
                self.address, old_state, new_state
            );

            let _ = self.event_tx.send(ConnectionEvent {
                address: self.address.clone(),
                state: new_state,
            });
        }
    }
}
