//! Heater session management.
//!
//! A [`SessionManager`] owns the single link to one heater. It serializes
//! every GATT operation through one async gate, runs the fixed
//! initialization handshake on each new link, routes notifications through
//! the classifier and stale filter, and releases the link after a period of
//! inactivity so the vendor app can take over.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::ble::connection::{ConnectionEvent, ConnectionState, ConnectionTracker};
use crate::ble::handles::{
    describe_handle, CCCD_COMMAND, CCCD_ENABLE_NOTIFY, HANDLE_INIT, HANDSHAKE_CCCD_ORDER,
};
use crate::ble::transport::{
    DisconnectCallback, GattTarget, GattTransport, NotificationCallback, TransportConnector,
};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::protocol::classifier::{classify, Confirmation, FilterDecision, Notification, StaleFilter};
use crate::protocol::codec::{select_init_token, InitToken, Level, TokenSelection, TokenSource};
use crate::token_store::TokenStore;
use crate::utils::to_hex;

/// Where a status observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StatusSource {
    /// Decoded from a status notification.
    Notification,
    /// Assumed from a command the heater accepted.
    Command,
}

/// An authoritative heater level.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatusObservation {
    /// The heater level.
    pub level: Level,
    /// How the level was learned.
    pub source: StatusSource,
    /// When it was observed.
    pub observed_at: DateTime<Utc>,
}

/// How far a link must be brought up before an operation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Link up; the handshake may not have run. Used for diagnostics.
    Connected,
    /// Link up and unlocked.
    Ready,
}

/// Options for [`SessionManager::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Use write-with-response.
    pub with_response: bool,
    /// Number of writes. Zero is treated as one.
    pub repeat: u32,
    /// Pause between writes.
    pub interval: Duration,
}

impl WriteOptions {
    /// A single write.
    pub fn once(with_response: bool) -> Self {
        Self {
            with_response,
            repeat: 1,
            interval: Duration::ZERO,
        }
    }

    /// `repeat` writes spaced by `interval`.
    pub fn repeated(with_response: bool, repeat: u32, interval: Duration) -> Self {
        Self {
            with_response,
            repeat,
            interval,
        }
    }
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self::repeated(false, 1, Duration::from_millis(100))
    }
}

/// State guarded by the gate.
#[derive(Default)]
struct Link {
    transport: Option<Arc<dyn GattTransport>>,
    initialized: bool,
}

impl Link {
    fn transport(&self) -> Result<Arc<dyn GattTransport>> {
        self.transport.clone().ok_or(Error::NotConnected)
    }
}

/// Exclusive access to the link.
///
/// Fields drop in declaration order: the gate is released before `_rearm`
/// runs, so the idle timer is never armed while the gate is held.
struct LinkGuard<'a> {
    link: AsyncMutexGuard<'a, Link>,
    _rearm: IdleRearm<'a>,
}

impl Deref for LinkGuard<'_> {
    type Target = Link;

    fn deref(&self) -> &Link {
        &self.link
    }
}

impl DerefMut for LinkGuard<'_> {
    fn deref_mut(&mut self) -> &mut Link {
        &mut self.link
    }
}

struct IdleRearm<'a>(&'a Arc<SessionInner>);

impl Drop for IdleRearm<'_> {
    fn drop(&mut self) {
        self.0.arm_idle_timer();
    }
}

struct SessionInner {
    address: String,
    connector: Arc<dyn TransportConnector>,
    tokens: Arc<dyn TokenStore>,
    config: SessionConfig,
    /// Serializes every GATT operation on the link.
    gate: AsyncMutex<Link>,
    connection: ConnectionTracker,
    /// Bumped on every connect so late callbacks from old links are ignored.
    generation: AtomicU64,
    link_lost: AtomicBool,
    stale: Mutex<StaleFilter>,
    last_status: RwLock<Option<StatusObservation>>,
    status_tx: broadcast::Sender<StatusObservation>,
    confirmation_tx: broadcast::Sender<Confirmation>,
    idle_timer: Mutex<Option<(u64, JoinHandle<()>)>>,
    timer_seq: AtomicU64,
}

/// Owns the link to one heater.
///
/// Cloning is cheap; clones share the same link.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    /// Create a session for `address`. Nothing is connected until the first operation.
    pub fn new(
        address: &str,
        connector: Arc<dyn TransportConnector>,
        tokens: Arc<dyn TokenStore>,
        config: SessionConfig,
    ) -> Self {
        let address = address.trim().to_uppercase();
        let (status_tx, _) = broadcast::channel(32);
        let (confirmation_tx, _) = broadcast::channel(64);

        Self {
            inner: Arc::new(SessionInner {
                connection: ConnectionTracker::new(address.clone()),
                address,
                connector,
                tokens,
                stale: Mutex::new(StaleFilter::new(config.stale_window)),
                config,
                gate: AsyncMutex::new(Link::default()),
                generation: AtomicU64::new(0),
                link_lost: AtomicBool::new(false),
                last_status: RwLock::new(None),
                status_tx,
                confirmation_tx,
                idle_timer: Mutex::new(None),
                timer_seq: AtomicU64::new(0),
            }),
        }
    }

    /// The heater's address.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Token store used by the handshake.
    pub fn token_store(&self) -> &Arc<dyn TokenStore> {
        &self.inner.tokens
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Whether the link is up and unlocked.
    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Subscribe to connection state changes.
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.connection.subscribe()
    }

    /// Whether an idle-disconnect timer is pending.
    pub fn idle_timer_pending(&self) -> bool {
        self.inner.idle_timer.lock().is_some()
    }

    /// Connect and run the handshake if needed.
    pub async fn ensure_ready(&self) -> Result<()> {
        self.inner.acquire(Readiness::Ready).await.map(drop)
    }

    /// Connect without running the handshake.
    pub async fn ensure_connected(&self) -> Result<()> {
        self.inner.acquire(Readiness::Connected).await.map(drop)
    }

    /// Read a characteristic value.
    pub async fn read(&self, target: GattTarget, readiness: Readiness) -> Result<Vec<u8>> {
        let mut guard = self.inner.acquire(readiness).await?;
        let transport = guard.transport()?;

        match transport.read(target).await {
            Ok(value) => {
                trace!(
                    "[{}] Read {} bytes from {}",
                    self.inner.address,
                    value.len(),
                    target
                );
                Ok(value)
            }
            Err(err) => {
                if !self.inner.link_alive(&transport).await {
                    self.inner.teardown(&mut guard, "read failed").await;
                }
                Err(Error::ReadFailed {
                    address: self.inner.address.clone(),
                    target: target.to_string(),
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Write `data` to `target`, possibly several times.
    ///
    /// The gate is released between repeats. A failure on the first write
    /// aborts with an error; failures on later repeats are logged and the
    /// burst continues. If the link goes away mid-burst the remaining
    /// repeats are abandoned and [`Error::NotConnected`] is returned.
    pub async fn write(&self, target: GattTarget, data: &[u8], options: WriteOptions) -> Result<()> {
        let repeat = options.repeat.max(1);

        for attempt in 1..=repeat {
            let mut guard = if attempt == 1 {
                self.inner.acquire(Readiness::Ready).await?
            } else {
                match self.inner.acquire_open().await {
                    Ok(guard) => guard,
                    Err(err) => {
                        warn!(
                            "[{}] Link gone after {} of {} writes to {}, aborting",
                            self.inner.address,
                            attempt - 1,
                            repeat,
                            target
                        );
                        return Err(err);
                    }
                }
            };

            trace!(
                "[{}] Write #{} to {}, resp={}: {}",
                self.inner.address,
                attempt,
                target,
                options.with_response,
                to_hex(data)
            );
            let outcome = self
                .inner
                .write_on(&mut guard, target, data, options.with_response)
                .await;
            drop(guard);

            if let Err(err) = outcome {
                if attempt == 1 || err.is_fatal_for_session() {
                    return Err(err);
                }
                warn!(
                    "[{}] Write failed on attempt {}: {}",
                    self.inner.address, attempt, err
                );
            }

            if attempt < repeat {
                tokio::time::sleep(options.interval).await;
            }
        }

        Ok(())
    }

    /// Tear the link down. The next operation reconnects and re-runs the handshake.
    pub async fn disconnect(&self) -> Result<()> {
        let mut link = self.inner.gate.lock().await;
        self.inner.teardown(&mut link, "requested").await;
        Ok(())
    }

    /// Record that a command for `level` is about to be issued.
    pub fn expect_level(&self, level: Level) {
        debug!(
            "[{}] Expecting {} (contradicting status ignored for {:?})",
            self.inner.address, level, self.inner.config.stale_window
        );
        self.inner.stale.lock().expect(level, Instant::now());
    }

    /// Publish a level assumed from an accepted command.
    pub fn publish_assumed_status(&self, level: Level) {
        self.inner.publish(level, StatusSource::Command);
    }

    /// The last authoritative level.
    pub fn last_status(&self) -> Option<StatusObservation> {
        self.inner.last_status.read().clone()
    }

    /// Subscribe to status observations.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusObservation> {
        self.inner.status_tx.subscribe()
    }

    /// Subscribe to raw command confirmations.
    pub fn subscribe_confirmations(&self) -> broadcast::Receiver<Confirmation> {
        self.inner.confirmation_tx.subscribe()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("address", &self.inner.address)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionInner {
    /// Take the gate and bring the link up to `readiness`.
    async fn acquire<'a>(self: &'a Arc<Self>, readiness: Readiness) -> Result<LinkGuard<'a>> {
        let mut guard = LinkGuard {
            link: self.gate.lock().await,
            _rearm: IdleRearm(self),
        };
        self.ensure(&mut guard, readiness).await?;
        Ok(guard)
    }

    /// Take the gate on a link that is already up, without reconnecting.
    async fn acquire_open<'a>(self: &'a Arc<Self>) -> Result<LinkGuard<'a>> {
        let guard = LinkGuard {
            link: self.gate.lock().await,
            _rearm: IdleRearm(self),
        };
        match guard.transport.clone() {
            Some(transport) if guard.initialized && self.link_alive(&transport).await => Ok(guard),
            _ => Err(Error::NotConnected),
        }
    }

    async fn link_alive(&self, transport: &Arc<dyn GattTransport>) -> bool {
        !self.link_lost.load(Ordering::SeqCst) && transport.is_connected().await
    }

    async fn ensure(self: &Arc<Self>, link: &mut Link, readiness: Readiness) -> Result<()> {
        if let Some(transport) = link.transport.clone() {
            if self.link_alive(&transport).await {
                if readiness == Readiness::Connected || link.initialized {
                    return Ok(());
                }
            } else {
                info!("[{}] Link dropped, reconnecting", self.address);
                link.transport = None;
                link.initialized = false;
                self.stale.lock().clear();
                self.connection.set(ConnectionState::Disconnected);
            }
        }

        if link.transport.is_none() {
            self.connect(link).await?;
        }

        if readiness == Readiness::Ready && !link.initialized {
            if let Err(err) = self.run_handshake(link).await {
                error!("{}", err);
                if err.is_fatal_for_session() {
                    self.teardown(link, "initialization failed").await;
                }
                return Err(err);
            }
        }

        Ok(())
    }

    async fn connect(self: &Arc<Self>, link: &mut Link) -> Result<()> {
        self.connection.set(ConnectionState::Connecting);

        let transport = match self.connector.lookup(&self.address).await {
            Ok(Some(transport)) => transport,
            Ok(None) => {
                self.connection.set(ConnectionState::Disconnected);
                return Err(Error::LookupFailed {
                    address: self.address.clone(),
                    reason: "device not found or not connectable".to_string(),
                });
            }
            Err(err) => {
                self.connection.set(ConnectionState::Disconnected);
                return Err(Error::LookupFailed {
                    address: self.address.clone(),
                    reason: err.to_string(),
                });
            }
        };

        if let Err(err) = transport.close_stale_connections().await {
            debug!(
                "[{}] close_stale_connections warning: {}",
                self.address, err
            );
        }

        info!("[{}] Connecting...", self.address);

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.link_lost.store(false, Ordering::SeqCst);

        let weak = Arc::downgrade(self);
        let on_disconnect: DisconnectCallback = Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handle_link_lost(generation);
            }
        });

        if let Err(err) = transport.connect(on_disconnect).await {
            self.connection.set(ConnectionState::Disconnected);
            return Err(Error::ConnectFailed {
                address: self.address.clone(),
                reason: err.to_string(),
            });
        }

        info!("[{}] Connected", self.address);

        let weak = Arc::downgrade(self);
        let on_notification: NotificationCallback = Arc::new(move |handle, payload| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_notification(handle, &payload);
            }
        });
        if let Err(err) = transport.subscribe(on_notification).await {
            warn!(
                "[{}] Could not route notifications, status updates will be missing: {}",
                self.address, err
            );
        }

        link.transport = Some(transport);
        link.initialized = false;
        self.connection.set(ConnectionState::Connected);

        tokio::time::sleep(self.config.post_connect_delay).await;
        Ok(())
    }

    /// Unlock the heater and arm notifications, in the order the firmware requires.
    async fn run_handshake(&self, link: &mut Link) -> Result<()> {
        let transport = link.transport()?;
        info!("[{}] Running initialization sequence", self.address);

        let read = match transport.read(GattTarget::Handle(HANDLE_INIT)).await {
            Ok(value) => {
                info!(
                    "[{}] Read init value from handle {:#06x}: {}",
                    self.address,
                    HANDLE_INIT,
                    to_hex(&value)
                );
                Some(value)
            }
            Err(err) => {
                error!("[{}] Failed to read init value: {}", self.address, err);
                None
            }
        };

        let cached = self.tokens.get(&self.address);
        let selection = select_init_token(read.as_deref(), cached.as_ref());
        match selection.source {
            TokenSource::Echoed => debug!(
                "[{}] Echoing init value back: {}",
                self.address,
                to_hex(&selection.bytes)
            ),
            TokenSource::Cached => warn!(
                "[{}] Init value from device unusable, using stored token: {}",
                self.address,
                to_hex(&selection.bytes)
            ),
            TokenSource::Static => warn!(
                "[{}] No init value read, falling back to static payload: {}",
                self.address,
                to_hex(&selection.bytes)
            ),
        }

        transport
            .write(GattTarget::Handle(HANDLE_INIT), &selection.bytes, true)
            .await
            .map_err(|err| Error::InitFailed {
                address: self.address.clone(),
                stage: "unlock write",
                reason: err.to_string(),
            })?;
        self.remember_token(&selection, cached);
        tokio::time::sleep(self.config.init_settle_delay).await;

        for cccd in HANDSHAKE_CCCD_ORDER {
            match self.enable_notifications(&transport, cccd).await {
                Ok(()) => debug!("[{}] CCCD {:#06x} enabled", self.address, cccd),
                Err(err) if cccd == CCCD_COMMAND => {
                    return Err(Error::InitFailed {
                        address: self.address.clone(),
                        stage: "command CCCD",
                        reason: err.to_string(),
                    });
                }
                Err(err) => warn!(
                    "[{}] Could not enable CCCD {:#06x}: {}",
                    self.address, cccd, err
                ),
            }
            tokio::time::sleep(self.config.cccd_settle_delay).await;
        }

        link.initialized = true;
        self.connection.set(ConnectionState::Ready);
        info!("[{}] Initialization sequence complete", self.address);
        Ok(())
    }

    /// Write the enable value to a CCCD, falling back to a characteristic write.
    async fn enable_notifications(&self, transport: &Arc<dyn GattTransport>, cccd: u16) -> Result<()> {
        let descriptor_err = match transport.write_descriptor(cccd, &CCCD_ENABLE_NOTIFY).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        debug!(
            "[{}] Descriptor write to {:#06x} failed: {}, trying characteristic write",
            self.address, cccd, descriptor_err
        );

        transport
            .write(GattTarget::Handle(cccd), &CCCD_ENABLE_NOTIFY, true)
            .await
            .map_err(|char_err| Error::WriteFailed {
                address: self.address.clone(),
                target: describe_handle(cccd),
                reason: format!("descriptor: {}; characteristic: {}", descriptor_err, char_err),
            })
    }

    fn remember_token(&self, selection: &TokenSelection, cached: Option<InitToken>) {
        if selection.source == TokenSource::Static {
            return;
        }
        let Ok(token) = InitToken::from_slice(&selection.bytes) else {
            return;
        };
        if token.is_all_zero() || cached == Some(token) {
            return;
        }
        info!("[{}] Storing init token: {}", self.address, token);
        self.tokens.set(&self.address, token);
    }

    async fn write_on(
        &self,
        link: &mut Link,
        target: GattTarget,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let transport = link.transport()?;

        match transport.write(target, data, with_response).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let err = Error::WriteFailed {
                    address: self.address.clone(),
                    target: target.to_string(),
                    reason: err.to_string(),
                };
                error!("{}", err);
                if !self.link_alive(&transport).await {
                    self.teardown(link, "write failed").await;
                }
                Err(err)
            }
        }
    }

    /// Close the link and return to `Disconnected`. Requires the gate.
    async fn teardown(&self, link: &mut Link, reason: &str) {
        self.cancel_idle_timer();
        link.initialized = false;

        if let Some(transport) = link.transport.take() {
            self.connection.set(ConnectionState::Disconnecting);
            if transport.is_connected().await {
                info!("[{}] Disconnecting ({})", self.address, reason);
                if let Err(err) = transport.disconnect().await {
                    debug!("[{}] Disconnect error: {}", self.address, err);
                }
            }
        }

        self.stale.lock().clear();
        self.connection.set(ConnectionState::Disconnected);
    }

    fn handle_link_lost(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            trace!("[{}] Ignoring disconnect from an old link", self.address);
            return;
        }
        if self.link_lost.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("[{}] Disconnected", self.address);
        self.cancel_idle_timer();
        self.stale.lock().clear();
        self.connection.set(ConnectionState::Disconnected);
    }

    fn handle_notification(self: &Arc<Self>, handle: u16, payload: &[u8]) {
        self.rearm_when_idle();

        match classify(handle, payload) {
            Notification::Confirmation(bytes) => {
                info!("[{}] Command confirmed: {}", self.address, to_hex(&bytes));
                let _ = self.confirmation_tx.send(Confirmation { handle, bytes });
            }
            Notification::StatusReport(level) => {
                let decision = self.stale.lock().evaluate(level, Instant::now());
                match decision {
                    FilterDecision::Deliver => {
                        info!(
                            "[{}] Heater status from notification: {}",
                            self.address, level
                        );
                        self.publish(level, StatusSource::Notification);
                    }
                    FilterDecision::Suppress { expected, age } => debug!(
                        "[{}] Ignoring stale notification: {} (expected {}, sent {:?} ago)",
                        self.address, level, expected, age
                    ),
                }
            }
            Notification::StatusByte(bytes) => debug!(
                "[{}] Status byte from {:#06x}: {}",
                self.address,
                handle,
                to_hex(&bytes)
            ),
            Notification::Unclassified(bytes) => debug!(
                "[{}] Notification ({} bytes) from {:#06x}: {}",
                self.address,
                bytes.len(),
                handle,
                to_hex(&bytes)
            ),
        }
    }

    fn publish(&self, level: Level, source: StatusSource) {
        let observation = StatusObservation {
            level,
            source,
            observed_at: Utc::now(),
        };
        *self.last_status.write() = Some(observation.clone());
        let _ = self.status_tx.send(observation);
    }

    /// Re-arm the idle timer once the gate is free.
    ///
    /// Notifications can arrive while an operation holds the gate, so the
    /// re-arm waits its turn behind it.
    fn rearm_when_idle(self: &Arc<Self>) {
        if self.config.idle_timeout.is_none() {
            return;
        }
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            if let Some(inner) = weak.upgrade() {
                // Locals drop in reverse: the gate is released before the re-arm.
                let _rearm = IdleRearm(&inner);
                let _link = inner.gate.lock().await;
            }
        });
    }

    /// (Re)start the idle-disconnect countdown.
    fn arm_idle_timer(self: &Arc<Self>) {
        let Some(timeout) = self.config.idle_timeout else {
            return;
        };
        if !self.connection.state().is_connected() {
            return;
        }

        let id = self.timer_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.idle_expired(id).await;
            }
        });

        trace!("[{}] Idle timer armed ({:?})", self.address, timeout);
        if let Some((_, previous)) = self.idle_timer.lock().replace((id, handle)) {
            previous.abort();
        }
    }

    fn cancel_idle_timer(&self) {
        if let Some((_, handle)) = self.idle_timer.lock().take() {
            handle.abort();
        }
    }

    /// Take ownership of timer `id` so a concurrent re-arm cannot abort it mid-teardown.
    fn claim_idle_timer(&self, id: u64) -> bool {
        let mut slot = self.idle_timer.lock();
        match slot.as_ref() {
            Some((current, _)) if *current == id => {
                slot.take();
                true
            }
            _ => false,
        }
    }

    async fn idle_expired(&self, id: u64) {
        let mut link = self.gate.lock().await;
        if !self.claim_idle_timer(id) || link.transport.is_none() {
            return;
        }

        info!(
            "[{}] Auto-disconnecting after {:?} of inactivity",
            self.address, self.config.idle_timeout
        );
        self.teardown(&mut link, "idle timeout").await;
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some((_, handle)) = self.idle_timer.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::fake::{FakeConnector, FakeTransport, Op, DEVICE_TOKEN};
    use crate::ble::handles::{
        CCCD_STATUS_BYTE, CCCD_STATUS_DATA, HANDLE_COMMAND, HANDLE_STATUS_DATA,
    };
    use crate::protocol::codec::status_frame_for;
    use crate::token_store::{MemoryTokenStore, MockTokenStore};
    use pretty_assertions::assert_eq;

    const ADDRESS: &str = "c4:4f:33:8b:6c:36";

    fn session_with_store(
        transport: &Arc<FakeTransport>,
        tokens: Arc<dyn TokenStore>,
    ) -> (SessionManager, Arc<FakeConnector>) {
        let connector = FakeConnector::new(transport.clone());
        let session = SessionManager::new(
            ADDRESS,
            connector.clone(),
            tokens,
            SessionConfig::default(),
        );
        (session, connector)
    }

    fn session(transport: &Arc<FakeTransport>) -> (SessionManager, Arc<FakeConnector>) {
        session_with_store(transport, Arc::new(MemoryTokenStore::new()))
    }

    fn handshake(token: &[u8]) -> Vec<Op> {
        vec![
            Op::CloseStale,
            Op::Connect,
            Op::Subscribe,
            Op::Read(GattTarget::Handle(HANDLE_INIT)),
            Op::Write {
                target: GattTarget::Handle(HANDLE_INIT),
                data: token.to_vec(),
                with_response: true,
            },
            Op::WriteDescriptor {
                handle: CCCD_STATUS_BYTE,
                data: CCCD_ENABLE_NOTIFY.to_vec(),
            },
            Op::WriteDescriptor {
                handle: CCCD_STATUS_DATA,
                data: CCCD_ENABLE_NOTIFY.to_vec(),
            },
            Op::WriteDescriptor {
                handle: CCCD_COMMAND,
                data: CCCD_ENABLE_NOTIFY.to_vec(),
            },
        ]
    }

    fn cccd_positions(ops: &[Op]) -> Vec<u16> {
        ops.iter()
            .filter_map(|op| match op {
                Op::WriteDescriptor { handle, .. } => Some(*handle),
                Op::Write {
                    target: GattTarget::Handle(h),
                    ..
                } if HANDSHAKE_CCCD_ORDER.contains(h) => Some(*h),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_session_runs_handshake_in_order() {
        let transport = FakeTransport::new();
        let (session, _) = session(&transport);

        assert_eq!(session.state(), ConnectionState::Disconnected);
        session.ensure_ready().await.unwrap();

        assert_eq!(transport.ops(), handshake(&DEVICE_TOKEN));
        assert_eq!(session.state(), ConnectionState::Ready);
        assert_eq!(session.address(), "C4:4F:33:8B:6C:36");
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_runs_once_per_link() {
        let transport = FakeTransport::new();
        let (session, connector) = session(&transport);

        session.ensure_ready().await.unwrap();
        session.ensure_ready().await.unwrap();

        assert_eq!(transport.count(&Op::Connect), 1);
        assert_eq!(connector.lookups(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_cccd_failures_keep_command_cccd_last() {
        let transport = FakeTransport::new();
        for cccd in [CCCD_STATUS_BYTE, CCCD_STATUS_DATA] {
            transport.fail_descriptor(cccd);
            transport.fail_write(GattTarget::Handle(cccd));
        }
        let (session, _) = session(&transport);

        session.ensure_ready().await.unwrap();

        let ops = transport.ops();
        assert_eq!(
            cccd_positions(&ops),
            vec![
                CCCD_STATUS_BYTE,
                CCCD_STATUS_BYTE,
                CCCD_STATUS_DATA,
                CCCD_STATUS_DATA,
                CCCD_COMMAND
            ]
        );
        let unlock = ops
            .iter()
            .position(|op| matches!(op, Op::Write { target: GattTarget::Handle(HANDLE_INIT), .. }))
            .unwrap();
        let first_cccd = ops
            .iter()
            .position(|op| matches!(op, Op::WriteDescriptor { .. }))
            .unwrap();
        assert!(unlock < first_cccd);
        assert!(session.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_descriptor_failure_falls_back_to_characteristic_write() {
        let transport = FakeTransport::new();
        transport.fail_descriptor(CCCD_STATUS_DATA);
        let (session, _) = session(&transport);

        session.ensure_ready().await.unwrap();

        assert_eq!(
            transport.writes_to(GattTarget::Handle(CCCD_STATUS_DATA)),
            vec![CCCD_ENABLE_NOTIFY.to_vec()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_cccd_failure_is_fatal() {
        let transport = FakeTransport::new();
        transport.fail_descriptor(CCCD_COMMAND);
        transport.fail_write(GattTarget::Handle(CCCD_COMMAND));
        let (session, _) = session(&transport);

        let err = session.ensure_ready().await.unwrap_err();

        assert!(matches!(err, Error::InitFailed { stage: "command CCCD", .. }));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(transport.ops().last(), Some(&Op::Disconnect));
        assert!(!session.idle_timer_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlock_write_failure_is_fatal() {
        let transport = FakeTransport::new();
        transport.fail_write(GattTarget::Handle(HANDLE_INIT));
        let (session, _) = session(&transport);

        let err = session.ensure_ready().await.unwrap_err();

        assert!(matches!(err, Error::InitFailed { stage: "unlock write", .. }));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!transport
            .ops()
            .iter()
            .any(|op| matches!(op, Op::WriteDescriptor { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_zero_token_uses_cached_fallback() {
        let transport = FakeTransport::new();
        transport.set_read(GattTarget::Handle(HANDLE_INIT), vec![0; 9]);
        let cached = InitToken::new([0xFF, 0xFF, 0xFF, 0xFD, 0x94, 0x34, 0x01, 0x02, 0x03]);

        let mut store = MockTokenStore::new();
        store.expect_get().returning(move |_| Some(cached));
        store.expect_set().never();
        let (session, _) = session_with_store(&transport, Arc::new(store));

        session.ensure_ready().await.unwrap();

        assert_eq!(
            transport.writes_to(GattTarget::Handle(HANDLE_INIT)),
            vec![cached.as_bytes().to_vec()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_token_read_uses_static_payload() {
        let transport = FakeTransport::new();
        transport.fail_read(GattTarget::Handle(HANDLE_INIT));

        let mut store = MockTokenStore::new();
        store.expect_get().returning(|_| None);
        store.expect_set().never();
        let (session, _) = session_with_store(&transport, Arc::new(store));

        session.ensure_ready().await.unwrap();

        assert_eq!(
            transport.writes_to(GattTarget::Handle(HANDLE_INIT)),
            vec![InitToken::STATIC_FALLBACK.as_bytes().to_vec()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_token_is_cached() {
        let transport = FakeTransport::new();
        let store = Arc::new(MemoryTokenStore::new());
        let (session, _) = session_with_store(&transport, store.clone());

        session.ensure_ready().await.unwrap();

        assert_eq!(store.get(ADDRESS), Some(InitToken::new(DEVICE_TOKEN)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_disconnects_and_next_use_reinitializes() {
        let transport = FakeTransport::new();
        let (session, _) = session(&transport);

        session.ensure_ready().await.unwrap();
        assert!(session.idle_timer_pending());

        tokio::time::sleep(Duration::from_secs(181)).await;

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(transport.count(&Op::Disconnect), 1);

        transport.clear_ops();
        session.ensure_ready().await.unwrap();
        assert_eq!(transport.ops(), handshake(&DEVICE_TOKEN));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_rearms_idle_timer() {
        let transport = FakeTransport::new();
        let (session, _) = session(&transport);
        session.ensure_ready().await.unwrap();

        tokio::time::sleep(Duration::from_secs(170)).await;
        transport.notify(HANDLE_STATUS_DATA, status_frame_for(Level::Low));
        tokio::time::sleep(Duration::from_secs(170)).await;
        assert!(session.is_ready());

        session
            .write(
                GattTarget::Handle(HANDLE_COMMAND),
                &[0x01, 0x21],
                WriteOptions::once(false),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(170)).await;
        assert!(session.is_ready());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_can_be_disabled() {
        let transport = FakeTransport::new();
        let connector = FakeConnector::new(transport.clone());
        let session = SessionManager::new(
            ADDRESS,
            connector,
            Arc::new(MemoryTokenStore::new()),
            SessionConfig::default().with_idle_timeout(None),
        );

        session.ensure_ready().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3600)).await;

        assert!(session.is_ready());
        assert!(!session.idle_timer_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_disconnect_forces_reinitialization() {
        let transport = FakeTransport::new();
        let (session, _) = session(&transport);
        session.ensure_ready().await.unwrap();

        transport.drop_link();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!session.idle_timer_pending());

        transport.clear_ops();
        session.ensure_ready().await.unwrap();
        assert_eq!(transport.ops(), handshake(&DEVICE_TOKEN));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_failure() {
        let transport = FakeTransport::new();
        let (session, connector) = session(&transport);
        connector.set_missing(true);

        let err = session.ensure_ready().await.unwrap_err();

        assert!(matches!(err, Error::LookupFailed { .. }));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(transport.ops().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_then_retry() {
        let transport = FakeTransport::new();
        transport.fail_connect(true);
        let (session, _) = session(&transport);

        let err = session.ensure_ready().await.unwrap_err();
        assert!(matches!(err, Error::ConnectFailed { .. }));
        assert_eq!(session.state(), ConnectionState::Disconnected);

        transport.fail_connect(false);
        session.ensure_ready().await.unwrap();
        assert!(session.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_status_suppressed_inside_window() {
        let transport = FakeTransport::new();
        let (session, _) = session(&transport);
        session.ensure_ready().await.unwrap();
        let mut status = session.subscribe_status();

        session.expect_level(Level::High);
        tokio::time::advance(Duration::from_millis(500)).await;
        transport.notify(HANDLE_STATUS_DATA, status_frame_for(Level::Off));
        assert!(status.try_recv().is_err());
        assert_eq!(session.last_status(), None);

        tokio::time::advance(Duration::from_millis(1000)).await;
        transport.notify(HANDLE_STATUS_DATA, status_frame_for(Level::Off));
        let observation = status.try_recv().unwrap();
        assert_eq!(observation.level, Level::Off);
        assert_eq!(observation.source, StatusSource::Notification);
    }

    #[tokio::test(start_paused = true)]
    async fn test_matching_status_delivered_inside_window() {
        let transport = FakeTransport::new();
        let (session, _) = session(&transport);
        session.ensure_ready().await.unwrap();
        let mut status = session.subscribe_status();

        session.expect_level(Level::Medium);
        transport.notify(HANDLE_STATUS_DATA, status_frame_for(Level::Medium));

        assert_eq!(status.try_recv().unwrap().level, Level::Medium);
        assert_eq!(session.last_status().map(|s| s.level), Some(Level::Medium));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmations_are_broadcast() {
        let transport = FakeTransport::new();
        let (session, _) = session(&transport);
        session.ensure_ready().await.unwrap();
        let mut confirmations = session.subscribe_confirmations();

        transport.notify(HANDLE_COMMAND, vec![0x01, 0x42]);
        transport.notify(HANDLE_STATUS_DATA, vec![0x01, 0x02, 0x03]);

        let confirmation = confirmations.try_recv().unwrap();
        assert_eq!(confirmation.bytes, [0x01, 0x42]);
        assert_eq!(confirmation.handle, HANDLE_COMMAND);
        assert!(confirmations.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_write_failure_aborts_burst() {
        let transport = FakeTransport::new();
        transport.fail_write(GattTarget::Handle(HANDLE_COMMAND));
        let (session, _) = session(&transport);

        let err = session
            .write(
                GattTarget::Handle(HANDLE_COMMAND),
                &[0x00, 0x21],
                WriteOptions::repeated(false, 5, Duration::from_millis(16)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::WriteFailed { .. }));
        assert_eq!(transport.writes_to(GattTarget::Handle(HANDLE_COMMAND)).len(), 1);
        // Link is still up, so the session stays usable.
        assert!(session.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_write_failures_are_best_effort() {
        let transport = FakeTransport::new();
        let (session, _) = session(&transport);
        session.ensure_ready().await.unwrap();

        let target = GattTarget::Handle(HANDLE_COMMAND);
        let burst = session.write(
            target,
            &[0x00, 0x21],
            WriteOptions::repeated(false, 3, Duration::from_millis(100)),
        );
        let sabotage = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            transport.fail_write(target);
        };
        let (result, ()) = tokio::join!(burst, sabotage);

        result.unwrap();
        assert_eq!(transport.writes_to(target).len(), 3);
        transport.heal_write(target);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_mid_burst_aborts_remaining_writes() {
        let transport = FakeTransport::new();
        let (session, _) = session(&transport);
        session.ensure_ready().await.unwrap();

        let target = GattTarget::Handle(HANDLE_COMMAND);
        let burst = session.write(
            target,
            &[0x00, 0x21],
            WriteOptions::repeated(false, 5, Duration::from_millis(100)),
        );
        let interrupt = async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            session.disconnect().await
        };
        let (result, disconnected) = tokio::join!(burst, interrupt);

        disconnected.unwrap();
        assert!(matches!(result, Err(Error::NotConnected)));
        assert_eq!(transport.writes_to(target).len(), 2);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_read_skips_handshake() {
        let transport = FakeTransport::new();
        transport.set_read(GattTarget::Handle(0x0010), vec![0x42]);
        let (session, _) = session(&transport);

        let value = session
            .read(GattTarget::Handle(0x0010), Readiness::Connected)
            .await
            .unwrap();

        assert_eq!(value, vec![0x42]);
        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(!transport
            .ops()
            .iter()
            .any(|op| matches!(op, Op::WriteDescriptor { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_failure_keeps_live_link() {
        let transport = FakeTransport::new();
        transport.fail_read(GattTarget::Handle(0x0011));
        let (session, _) = session(&transport);

        let err = session
            .read(GattTarget::Handle(0x0011), Readiness::Connected)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ReadFailed { .. }));
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_armed_only_after_gate_released() {
        let transport = FakeTransport::new();
        transport.set_latency(Duration::from_millis(20));
        let (session, _) = session(&transport);

        let writer = session.clone();
        let write = tokio::spawn(async move {
            writer
                .write(
                    GattTarget::Handle(HANDLE_COMMAND),
                    &[0x01, 0x42],
                    WriteOptions::once(false),
                )
                .await
        });

        // The command write echoes a confirmation while it still holds the gate.
        while !write.is_finished() {
            assert!(!session.idle_timer_pending());
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        write.await.unwrap().unwrap();

        assert!(session.idle_timer_pending());
        assert_eq!(transport.writes_to(GattTarget::Handle(HANDLE_COMMAND)).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_never_overlap_on_the_link() {
        let transport = FakeTransport::new();
        transport.set_latency(Duration::from_millis(10));
        let (session, _) = session(&transport);
        let target = GattTarget::Handle(HANDLE_COMMAND);

        let (burst, single, read) = tokio::join!(
            session.write(
                target,
                &[0x00, 0x21],
                WriteOptions::repeated(false, 4, Duration::from_millis(5)),
            ),
            session.write(target, &[0x01, 0x42], WriteOptions::once(false)),
            session.read(GattTarget::Handle(HANDLE_INIT), Readiness::Ready),
        );

        burst.unwrap();
        single.unwrap();
        read.unwrap();
        assert_eq!(transport.max_in_flight(), 1);
        assert_eq!(transport.count(&Op::Connect), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_resets_stale_filter() {
        let transport = FakeTransport::new();
        let (session, _) = session(&transport);
        session.ensure_ready().await.unwrap();
        let mut status = session.subscribe_status();

        session.expect_level(Level::High);
        transport.drop_link();
        session.ensure_ready().await.unwrap();

        // Reconnect finished well inside the stale window.
        transport.notify(HANDLE_STATUS_DATA, status_frame_for(Level::Off));
        assert_eq!(status.try_recv().unwrap().level, Level::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_events() {
        let transport = FakeTransport::new();
        let (session, _) = session(&transport);
        let mut events = session.subscribe_state();

        session.ensure_ready().await.unwrap();
        session.disconnect().await.unwrap();

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            states.push(event.state);
        }
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Ready,
                ConnectionState::Disconnecting,
                ConnectionState::Disconnected,
            ]
        );
    }
}
