//! Fakes shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use uuid::Uuid;

use uart_bridge::ble::{
    BleCentral, CharacteristicProperties, DeviceDescriptor, DeviceId, GattCharacteristic,
    LinkEvent, RadioState, UART_RX_UUID, UART_SERVICE_UUID, UART_TX_UUID,
};
use uart_bridge::serial::{PortDescriptor, SerialConnection, SerialDriver};
use uart_bridge::{Error, Result};

/// Install a test subscriber once. `RUST_LOG=uart_bridge=trace` shows the
/// transport logs of a failing test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

/// Run `future` on a fresh runtime. Used inside proptest cases.
pub fn block_on<F: Future>(future: F) -> F::Output {
    tokio_test::block_on(future)
}

/// A request the transport made of the [`FakeCentral`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan(Uuid),
    StopScan,
    Connect(DeviceId),
    DiscoverServices(DeviceId),
    DiscoverCharacteristics(DeviceId, Uuid),
    Subscribe(DeviceId, Uuid),
    Write(DeviceId, Uuid, Vec<u8>),
    Disconnect(DeviceId),
}

/// The UART characteristics a well-behaved peripheral exposes.
pub fn uart_characteristics() -> Vec<GattCharacteristic> {
    vec![
        GattCharacteristic {
            uuid: UART_RX_UUID,
            service_uuid: UART_SERVICE_UUID,
            properties: CharacteristicProperties {
                write: true,
                write_without_response: true,
                notify: false,
            },
        },
        GattCharacteristic {
            uuid: UART_TX_UUID,
            service_uuid: UART_SERVICE_UUID,
            properties: CharacteristicProperties {
                notify: true,
                ..Default::default()
            },
        },
    ]
}

struct FakeCentralInner {
    event_tx: mpsc::UnboundedSender<LinkEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
    calls: Mutex<Vec<Call>>,
    max_write_len: AtomicUsize,
    services: Mutex<Vec<Uuid>>,
    characteristics: Mutex<Vec<GattCharacteristic>>,
    refuse_connect: Mutex<Option<String>>,
    fail_scan: AtomicBool,
    hold_connects: AtomicBool,
    write_gate: Arc<RwLock<()>>,
}

/// A [`BleCentral`] that records requests and answers them on its event
/// stream from within the request, the way a fast radio would.
#[derive(Clone)]
pub struct FakeCentral {
    inner: Arc<FakeCentralInner>,
}

impl Default for FakeCentral {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCentral {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded();
        Self {
            inner: Arc::new(FakeCentralInner {
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
                calls: Mutex::new(Vec::new()),
                max_write_len: AtomicUsize::new(20),
                services: Mutex::new(vec![UART_SERVICE_UUID]),
                characteristics: Mutex::new(uart_characteristics()),
                refuse_connect: Mutex::new(None),
                fail_scan: AtomicBool::new(false),
                hold_connects: AtomicBool::new(false),
                write_gate: Arc::new(RwLock::new(())),
            }),
        }
    }

    pub fn set_max_write_len(&self, len: usize) {
        self.inner.max_write_len.store(len, Ordering::SeqCst);
    }

    pub fn set_services(&self, services: Vec<Uuid>) {
        *self.inner.services.lock() = services;
    }

    pub fn set_characteristics(&self, characteristics: Vec<GattCharacteristic>) {
        *self.inner.characteristics.lock() = characteristics;
    }

    pub fn refuse_connect(&self, reason: &str) {
        *self.inner.refuse_connect.lock() = Some(reason.to_string());
    }

    /// Make `start_scan` fail, as an adapter that is really off does.
    pub fn fail_scan(&self, fail: bool) {
        self.inner.fail_scan.store(fail, Ordering::SeqCst);
    }

    /// Leave connects unanswered, so the transport stays `Connecting`.
    pub fn hold_connects(&self, hold: bool) {
        self.inner.hold_connects.store(hold, Ordering::SeqCst);
    }

    /// Writes wait until the returned guard is dropped.
    pub async fn hold_writes(&self) -> OwnedRwLockWriteGuard<()> {
        self.inner.write_gate.clone().write_owned().await
    }

    /// Push an unsolicited event into the stream.
    pub fn emit(&self, event: LinkEvent) {
        let _ = self.inner.event_tx.unbounded_send(event);
    }

    pub fn set_radio(&self, radio: RadioState) {
        self.emit(LinkEvent::RadioStateChanged(radio));
    }

    pub fn advertise(&self, id: &str, name: &str) {
        self.emit(LinkEvent::Discovered(DeviceDescriptor::new(
            id,
            Some(name.to_string()),
        )));
    }

    pub fn notify(&self, id: &str, characteristic: Uuid, value: &[u8]) {
        self.emit(LinkEvent::Notification {
            id: DeviceId::new(id),
            characteristic,
            value: value.to_vec(),
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.inner.calls.lock().clear();
    }

    /// Payloads written, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Write(_, _, data) => Some(data),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.inner.calls.lock().push(call);
    }
}

#[async_trait]
impl BleCentral for FakeCentral {
    async fn events(&self) -> Result<BoxStream<'static, LinkEvent>> {
        let rx = self
            .inner
            .event_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Internal("event stream already taken".to_string()))?;
        Ok(rx.boxed())
    }

    async fn start_scan(&self, service: Uuid) -> Result<()> {
        self.record(Call::StartScan(service));
        if self.inner.fail_scan.load(Ordering::SeqCst) {
            return Err(Error::BluetoothUnavailable);
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(Call::StopScan);
        Ok(())
    }

    async fn connect(&self, id: &DeviceId) -> Result<()> {
        self.record(Call::Connect(id.clone()));
        if self.inner.hold_connects.load(Ordering::SeqCst) {
            return Ok(());
        }
        let refusal = self.inner.refuse_connect.lock().clone();
        match refusal {
            Some(reason) => self.emit(LinkEvent::ConnectFailed {
                id: id.clone(),
                reason,
            }),
            None => self.emit(LinkEvent::Connected(id.clone())),
        }
        Ok(())
    }

    async fn discover_services(&self, id: &DeviceId) -> Result<()> {
        self.record(Call::DiscoverServices(id.clone()));
        let services = self.inner.services.lock().clone();
        self.emit(LinkEvent::ServicesDiscovered {
            id: id.clone(),
            services,
        });
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        id: &DeviceId,
        service: Uuid,
        _characteristics: &[Uuid],
    ) -> Result<()> {
        self.record(Call::DiscoverCharacteristics(id.clone(), service));
        let characteristics = self.inner.characteristics.lock().clone();
        self.emit(LinkEvent::CharacteristicsDiscovered {
            id: id.clone(),
            service,
            characteristics,
        });
        Ok(())
    }

    async fn subscribe(&self, id: &DeviceId, characteristic: &GattCharacteristic) -> Result<()> {
        self.record(Call::Subscribe(id.clone(), characteristic.uuid));
        Ok(())
    }

    fn max_write_len(&self, _id: &DeviceId) -> usize {
        self.inner.max_write_len.load(Ordering::SeqCst)
    }

    async fn write(
        &self,
        id: &DeviceId,
        characteristic: &GattCharacteristic,
        data: &[u8],
    ) -> Result<()> {
        let _pass = self.inner.write_gate.read().await;
        self.record(Call::Write(id.clone(), characteristic.uuid, data.to_vec()));
        Ok(())
    }

    async fn disconnect(&self, id: &DeviceId) -> Result<()> {
        self.record(Call::Disconnect(id.clone()));
        self.emit(LinkEvent::Disconnected {
            id: id.clone(),
            reason: None,
        });
        Ok(())
    }
}

struct FakeDriverInner {
    ports: Mutex<Vec<PortDescriptor>>,
    /// Device ends of opened ports, by path.
    devices: Mutex<HashMap<String, DuplexStream>>,
    opens: Mutex<Vec<(String, u32)>>,
    gate: Arc<RwLock<()>>,
}

/// A [`SerialDriver`] whose ports are in-memory pipes.
#[derive(Clone)]
pub struct FakeSerialDriver {
    inner: Arc<FakeDriverInner>,
}

impl Default for FakeSerialDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSerialDriver {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FakeDriverInner {
                ports: Mutex::new(Vec::new()),
                devices: Mutex::new(HashMap::new()),
                opens: Mutex::new(Vec::new()),
                gate: Arc::new(RwLock::new(())),
            }),
        }
    }

    pub fn plug(&self, path: &str) {
        self.inner
            .ports
            .lock()
            .push(PortDescriptor::from_path(path));
    }

    /// Remove the port and hang up its device end.
    pub fn unplug(&self, path: &str) {
        self.inner.ports.lock().retain(|p| p.path != path);
        self.inner.devices.lock().remove(path);
    }

    /// Take the device end of an opened port.
    pub fn take_device(&self, path: &str) -> DuplexStream {
        self.inner
            .devices
            .lock()
            .remove(path)
            .unwrap_or_else(|| panic!("{path} was not opened"))
    }

    /// Every `(path, baud_rate)` the transport opened.
    pub fn opens(&self) -> Vec<(String, u32)> {
        self.inner.opens.lock().clone()
    }

    /// Opens wait until the returned guard is dropped.
    pub async fn hold_opens(&self) -> OwnedRwLockWriteGuard<()> {
        self.inner.gate.clone().write_owned().await
    }
}

#[async_trait]
impl SerialDriver for FakeSerialDriver {
    fn available_ports(&self) -> Result<Vec<PortDescriptor>> {
        Ok(self.inner.ports.lock().clone())
    }

    async fn open(&self, path: &str, baud_rate: u32) -> Result<SerialConnection> {
        let _pass = self.inner.gate.read().await;

        if !self.inner.ports.lock().iter().any(|p| p.path == path) {
            return Err(Error::ConnectionFailed {
                reason: format!("no such port {path}"),
            });
        }

        let (client, device) = tokio::io::duplex(256);
        self.inner.devices.lock().insert(path.to_string(), device);
        self.inner.opens.lock().push((path.to_string(), baud_rate));
        Ok(SerialConnection::from_stream(client))
    }
}
