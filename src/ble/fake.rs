//! Scripted in-memory transport for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::ble::handles::{COMMAND_CHARACTERISTIC_UUID, HANDLE_COMMAND, HANDLE_INIT};
use crate::ble::transport::{
    DisconnectCallback, GattTarget, GattTransport, NotificationCallback, TransportConnector,
};
use crate::error::{Error, Result};

/// Token the fake reports from the unlock handle unless told otherwise.
pub(crate) const DEVICE_TOKEN: [u8; 9] = [0xFF, 0xFF, 0xFF, 0xFD, 0x11, 0x22, 0x00, 0x00, 0x00];

/// A recorded transport operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Op {
    CloseStale,
    Connect,
    Disconnect,
    Subscribe,
    Read(GattTarget),
    Write {
        target: GattTarget,
        data: Vec<u8>,
        with_response: bool,
    },
    WriteDescriptor {
        handle: u16,
        data: Vec<u8>,
    },
}

#[derive(Default)]
struct FakeState {
    ops: Vec<Op>,
    connected: bool,
    reads: HashMap<GattTarget, Vec<u8>>,
    failing_reads: HashSet<GattTarget>,
    failing_writes: HashSet<GattTarget>,
    failing_descriptors: HashSet<u16>,
    fail_connect: bool,
    echo_commands: bool,
    notify: Option<NotificationCallback>,
    on_disconnect: Option<DisconnectCallback>,
}

pub(crate) struct FakeTransport {
    state: Mutex<FakeState>,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Marks one radio operation as in flight until dropped.
struct InFlight<'a>(&'a FakeTransport);

impl<'a> InFlight<'a> {
    fn enter(transport: &'a FakeTransport) -> Self {
        let now = transport.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        transport.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(transport)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        let mut state = FakeState {
            echo_commands: true,
            ..FakeState::default()
        };
        state
            .reads
            .insert(GattTarget::Handle(HANDLE_INIT), DEVICE_TOKEN.to_vec());

        Arc::new(Self {
            state: Mutex::new(state),
            latency: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// Make every connect, read, write and disconnect take `latency`.
    pub(crate) fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Most operations ever observed running at once.
    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn on_air(&self) -> InFlight<'_> {
        let in_flight = InFlight::enter(self);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        in_flight
    }

    pub(crate) fn set_read(&self, target: GattTarget, value: Vec<u8>) {
        self.state.lock().reads.insert(target, value);
    }

    pub(crate) fn fail_read(&self, target: GattTarget) {
        self.state.lock().failing_reads.insert(target);
    }

    pub(crate) fn fail_write(&self, target: GattTarget) {
        self.state.lock().failing_writes.insert(target);
    }

    pub(crate) fn heal_write(&self, target: GattTarget) {
        self.state.lock().failing_writes.remove(&target);
    }

    pub(crate) fn fail_descriptor(&self, handle: u16) {
        self.state.lock().failing_descriptors.insert(handle);
    }

    pub(crate) fn fail_connect(&self, fail: bool) {
        self.state.lock().fail_connect = fail;
    }

    pub(crate) fn echo_commands(&self, echo: bool) {
        self.state.lock().echo_commands = echo;
    }

    pub(crate) fn ops(&self) -> Vec<Op> {
        self.state.lock().ops.clone()
    }

    pub(crate) fn clear_ops(&self) {
        self.state.lock().ops.clear();
    }

    pub(crate) fn count(&self, op: &Op) -> usize {
        self.state.lock().ops.iter().filter(|o| *o == op).count()
    }

    /// Payloads written to `target`, in order.
    pub(crate) fn writes_to(&self, target: GattTarget) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::Write {
                    target: t, data, ..
                } if *t == target => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Deliver a notification as if it came from the heater.
    pub(crate) fn notify(&self, handle: u16, payload: Vec<u8>) {
        let callback = self.state.lock().notify.clone();
        if let Some(callback) = callback {
            callback(handle, payload);
        }
    }

    /// Drop the link as if the radio went away.
    pub(crate) fn drop_link(&self) {
        let callback = {
            let mut state = self.state.lock();
            state.connected = false;
            state.on_disconnect.take()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    fn check_connected(state: &FakeState) -> Result<()> {
        if state.connected {
            Ok(())
        } else {
            Err(Error::Transport("not connected".to_string()))
        }
    }
}

#[async_trait]
impl GattTransport for FakeTransport {
    async fn close_stale_connections(&self) -> Result<()> {
        self.state.lock().ops.push(Op::CloseStale);
        Ok(())
    }

    async fn connect(&self, on_disconnect: DisconnectCallback) -> Result<()> {
        let _on_air = self.on_air().await;
        let mut state = self.state.lock();
        state.ops.push(Op::Connect);
        if state.fail_connect {
            return Err(Error::Transport("connection refused".to_string()));
        }
        state.connected = true;
        state.on_disconnect = Some(on_disconnect);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let _on_air = self.on_air().await;
        self.state.lock().ops.push(Op::Disconnect);
        self.drop_link();
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn read(&self, target: GattTarget) -> Result<Vec<u8>> {
        let _on_air = self.on_air().await;
        let mut state = self.state.lock();
        state.ops.push(Op::Read(target));
        Self::check_connected(&state)?;
        if state.failing_reads.contains(&target) {
            return Err(Error::Transport(format!("read not permitted on {}", target)));
        }
        state
            .reads
            .get(&target)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("no attribute at {}", target)))
    }

    async fn write(&self, target: GattTarget, data: &[u8], with_response: bool) -> Result<()> {
        let _on_air = self.on_air().await;
        let echo = {
            let mut state = self.state.lock();
            state.ops.push(Op::Write {
                target,
                data: data.to_vec(),
                with_response,
            });
            Self::check_connected(&state)?;
            if state.failing_writes.contains(&target) {
                return Err(Error::Transport(format!("write rejected on {}", target)));
            }
            let is_command = target == GattTarget::Handle(HANDLE_COMMAND)
                || target == GattTarget::Uuid(COMMAND_CHARACTERISTIC_UUID);
            state.echo_commands && is_command && data.len() == 2
        };

        if echo {
            self.notify(HANDLE_COMMAND, data.to_vec());
        }
        Ok(())
    }

    async fn write_descriptor(&self, handle: u16, data: &[u8]) -> Result<()> {
        let _on_air = self.on_air().await;
        let mut state = self.state.lock();
        state.ops.push(Op::WriteDescriptor {
            handle,
            data: data.to_vec(),
        });
        Self::check_connected(&state)?;
        if state.failing_descriptors.contains(&handle) {
            return Err(Error::Transport(format!(
                "descriptor write rejected on {:#06x}",
                handle
            )));
        }
        Ok(())
    }

    async fn subscribe(&self, callback: NotificationCallback) -> Result<()> {
        let mut state = self.state.lock();
        state.ops.push(Op::Subscribe);
        state.notify = Some(callback);
        Ok(())
    }
}

pub(crate) struct FakeConnector {
    transport: Arc<FakeTransport>,
    missing: AtomicBool,
    lookups: AtomicUsize,
}

impl FakeConnector {
    pub(crate) fn new(transport: Arc<FakeTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            missing: AtomicBool::new(false),
            lookups: AtomicUsize::new(0),
        })
    }

    pub(crate) fn set_missing(&self, missing: bool) {
        self.missing.store(missing, Ordering::SeqCst);
    }

    pub(crate) fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportConnector for FakeConnector {
    async fn lookup(&self, _address: &str) -> Result<Option<Arc<dyn GattTransport>>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.missing.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(self.transport.clone() as Arc<dyn GattTransport>))
    }
}
