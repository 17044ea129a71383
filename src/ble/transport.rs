//! BLE UART transport.
//!
//! [`BleTransport`] is a handle to a background task that owns a
//! [`BleCentral`] and runs the connection state machine:
//!
//! ```text
//! Idle --start_scan--> Discovering --connect--> Connecting
//!     --(service, characteristics, subscribe)--> Connected
//!     --disconnect--> Disconnecting --> Idle
//! ```
//!
//! Any failure while connecting returns to `Idle` and evicts the device from
//! the discovered set. Chunked writes run on a per-link writer task, so a
//! stalled write never holds up a disconnect.

use futures::stream::{BoxStream, StreamExt};
use parking_lot::RwLock;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::ble::central::{BleCentral, GattCharacteristic, LinkEvent, RadioState};
use crate::ble::device::{DeviceDescriptor, DeviceId, DeviceSet};
use crate::ble::uuids::{UART_CHARACTERISTICS, UART_RX_UUID, UART_SERVICE_UUID, UART_TX_UUID};
use crate::config::BleConfig;
use crate::error::{Error, Result};
use crate::transport::{
    spawn_callback, CallbackHandle, ConnectionState, LinkWriter, Outbound, TextBuffer, Transport,
    TransportEvent,
};
use crate::utils::chunk_payload;

/// Requests queued by the handle for the transport task.
enum Command {
    StartScan,
    StopScan,
    Connect(DeviceId),
    Send(String),
    Disconnect,
    ClearText,
    Sync(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// State readable from the handle. Written only by the transport task.
#[derive(Debug, Default)]
struct BleShared {
    state: ConnectionState,
    radio: RadioState,
    devices: DeviceSet,
    active_device: Option<DeviceId>,
    text: TextBuffer,
}

/// The link the task is opening, holding, or closing.
struct ActiveLink {
    id: DeviceId,
    notify: Option<GattCharacteristic>,
    /// Present while connected.
    writer: Option<LinkWriter>,
}

impl ActiveLink {
    fn new(id: DeviceId) -> Self {
        Self {
            id,
            notify: None,
            writer: None,
        }
    }

    /// Stop the writer, dropping writes still queued.
    async fn close_writer(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.close().await;
        }
    }
}

/// Text transport over the Nordic UART Service.
pub struct BleTransport {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<RwLock<BleShared>>,
    event_tx: broadcast::Sender<TransportEvent>,
    callback_counter: AtomicU64,
}

impl BleTransport {
    /// Start a transport driving `central`.
    ///
    /// # Errors
    ///
    /// Returns an error if the central's event stream cannot be obtained.
    pub async fn new<C: BleCentral>(central: C, config: BleConfig) -> Result<Self> {
        let events = central.events().await?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let shared = Arc::new(RwLock::new(BleShared::default()));

        let task = BleTask {
            central: Arc::new(central),
            config,
            shared: shared.clone(),
            event_tx: event_tx.clone(),
            link: None,
            scan_requested: false,
        };
        tokio::spawn(task.run(events, command_rx));

        Ok(Self {
            commands,
            shared,
            event_tx,
            callback_counter: AtomicU64::new(0),
        })
    }

    /// Start a transport on the system's first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn with_system_adapter(config: BleConfig) -> Result<Self> {
        let central = crate::ble::BtleplugCentral::new(config.clone()).await?;
        Self::new(central, config).await
    }

    /// Clear the discovered devices and scan for UART peripherals.
    ///
    /// If the radio is off the scan starts as soon as it powers on.
    pub fn start_scan(&self) -> Result<()> {
        self.command(Command::StartScan)
    }

    /// Stop scanning.
    pub fn stop_scan(&self) -> Result<()> {
        self.command(Command::StopScan)
    }

    /// Devices discovered since the last scan started.
    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        self.shared.read().devices.to_vec()
    }

    /// Last reported radio power state.
    pub fn radio_state(&self) -> RadioState {
        self.shared.read().radio
    }

    /// The device being connected, connected, or disconnected.
    pub fn active_device(&self) -> Option<DeviceId> {
        self.shared.read().active_device.clone()
    }

    /// Register a callback for received text.
    pub fn on_text_received<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        spawn_callback(
            &self.callback_counter,
            self.event_tx.subscribe(),
            |event| match event {
                TransportEvent::TextReceived(text) => Some(text),
                _ => None,
            },
            callback,
        )
    }

    /// Register a callback for connection state changes.
    pub fn on_state_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        spawn_callback(
            &self.callback_counter,
            self.event_tx.subscribe(),
            |event| match event {
                TransportEvent::StateChanged { new, .. } => Some(new),
                _ => None,
            },
            callback,
        )
    }

    /// Wait until every command and link event delivered before this call
    /// has been applied, and every text sent before it has been written.
    ///
    /// A link closed while writes are pending drops them, and `sync` returns
    /// as soon as the close is done.
    pub async fn sync(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Sync(tx))?;
        match rx.await {
            Ok(()) => Ok(()),
            Err(_) if !self.commands.is_closed() => Ok(()),
            Err(_) => Err(Error::TransportClosed),
        }
    }

    /// Tear down any link and stop the transport task.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Shutdown(tx))?;
        rx.await.map_err(|_| Error::TransportClosed)
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::TransportClosed)
    }
}

impl Transport for BleTransport {
    type Target = DeviceId;

    fn state(&self) -> ConnectionState {
        self.shared.read().state
    }

    fn received_text(&self) -> String {
        self.shared.read().text.as_str().to_string()
    }

    fn connect(&self, target: DeviceId) -> Result<()> {
        self.command(Command::Connect(target))
    }

    fn send(&self, text: &str) -> Result<()> {
        self.command(Command::Send(text.to_string()))
    }

    fn disconnect(&self) -> Result<()> {
        self.command(Command::Disconnect)
    }

    fn clear_received_text(&self) -> Result<()> {
        self.command(Command::ClearText)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }
}

/// The single writer of a [`BleTransport`]'s state.
struct BleTask<C> {
    central: Arc<C>,
    config: BleConfig,
    shared: Arc<RwLock<BleShared>>,
    event_tx: broadcast::Sender<TransportEvent>,
    link: Option<ActiveLink>,
    /// A scan was requested while the radio was unavailable.
    scan_requested: bool,
}

impl<C: BleCentral> BleTask<C> {
    async fn run(
        mut self,
        mut events: BoxStream<'static, LinkEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        debug!("BLE transport task started");

        loop {
            // Link events first, so a command sees every event delivered
            // before it.
            tokio::select! {
                biased;
                Some(event) = events.next() => self.handle_link_event(event).await,
                command = commands.recv() => match command {
                    Some(Command::Shutdown(done)) => {
                        self.teardown().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
            }
        }

        debug!("BLE transport task ended");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartScan => self.start_scan().await,
            Command::StopScan => {
                self.scan_requested = false;
                self.stop_scan().await;
            }
            Command::Connect(id) => self.connect(id).await,
            Command::Send(text) => self.send(text),
            Command::Disconnect => self.disconnect().await,
            Command::ClearText => {
                self.shared.write().text.clear();
                self.emit(TransportEvent::TextCleared);
            }
            Command::Sync(done) => match self.link.as_ref().and_then(|l| l.writer.as_ref()) {
                Some(writer) => writer.flush(done),
                None => {
                    let _ = done.send(());
                }
            },
            // Handled by the run loop.
            Command::Shutdown(_) => {}
        }
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::RadioStateChanged(radio) => self.radio_changed(radio).await,
            LinkEvent::Discovered(device) => {
                if self.state() != ConnectionState::Discovering {
                    trace!("Ignoring discovery of {} outside a scan", device.id);
                    return;
                }
                let id = device.id.clone();
                if self.shared.write().devices.insert(device) {
                    debug!("Discovered UART peripheral {}", id);
                    self.emit(TransportEvent::DevicesChanged);
                }
            }
            LinkEvent::Connected(id) => {
                if !self.is_connecting_to(&id) {
                    debug!("Ignoring link to {}", id);
                    return;
                }
                debug!("Link to {} established, discovering services", id);
                if let Err(e) = self.central.discover_services(&id).await {
                    self.fail_connect(format!("service discovery failed: {e}"))
                        .await;
                }
            }
            LinkEvent::ConnectFailed { id, reason } => {
                if self.is_connecting_to(&id) {
                    self.fail_connect(reason).await;
                }
            }
            LinkEvent::ServicesDiscovered { id, services } => {
                if !self.is_connecting_to(&id) {
                    return;
                }
                if !services.contains(&UART_SERVICE_UUID) {
                    let reason = Error::ServiceNotFound {
                        uuid: UART_SERVICE_UUID.to_string(),
                    };
                    self.fail_connect(reason.to_string()).await;
                    return;
                }
                if let Err(e) = self
                    .central
                    .discover_characteristics(&id, UART_SERVICE_UUID, &UART_CHARACTERISTICS)
                    .await
                {
                    self.fail_connect(format!("characteristic discovery failed: {e}"))
                        .await;
                }
            }
            LinkEvent::CharacteristicsDiscovered {
                id,
                service,
                characteristics,
            } => {
                if self.is_connecting_to(&id) && service == UART_SERVICE_UUID {
                    self.finish_connect(id, &characteristics).await;
                }
            }
            LinkEvent::DiscoveryFailed { id, reason } => {
                if self.is_connecting_to(&id) {
                    self.fail_connect(reason).await;
                }
            }
            LinkEvent::Disconnected { id, reason } => self.link_closed(id, reason).await,
            LinkEvent::Notification {
                id,
                characteristic,
                value,
            } => {
                let subscribed = self.state() == ConnectionState::Connected
                    && self.link.as_ref().is_some_and(|link| {
                        link.id == id
                            && link
                                .notify
                                .as_ref()
                                .is_some_and(|n| n.uuid == characteristic)
                    });
                if !subscribed {
                    trace!("Ignoring notification from {} on {}", id, characteristic);
                    return;
                }

                trace!("Notification from {}: {} bytes", id, value.len());
                let appended = self.shared.write().text.append_bytes(&value);
                if let Some(text) = appended {
                    self.emit(TransportEvent::TextReceived(text));
                }
            }
        }
    }

    async fn start_scan(&mut self) {
        if self.state().has_link() {
            warn!("Ignoring scan request while a link is active");
            return;
        }

        self.shared.write().devices.clear();
        self.emit(TransportEvent::DevicesChanged);

        let radio = self.shared.read().radio;
        if !radio.is_powered_on() {
            info!("Bluetooth radio unavailable ({:?}), scan deferred", radio);
            self.scan_requested = true;
            self.emit(TransportEvent::RadioUnavailable);
            return;
        }

        info!("Starting BLE scan for UART peripherals");
        match self.central.start_scan(UART_SERVICE_UUID).await {
            Ok(()) => {
                self.scan_requested = false;
                self.set_state(ConnectionState::Discovering);
            }
            Err(e) => {
                // Retried on the next power-on report.
                warn!("Failed to start scan, deferred: {}", e);
                self.scan_requested = true;
                self.emit(TransportEvent::RadioUnavailable);
            }
        }
    }

    async fn stop_scan(&mut self) {
        if self.state() != ConnectionState::Discovering {
            return;
        }

        info!("Stopping BLE scan");
        if let Err(e) = self.central.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        self.set_state(ConnectionState::Idle);
    }

    async fn connect(&mut self, id: DeviceId) {
        if self.state().has_link() {
            warn!("Ignoring connect to {}: a link is already active", id);
            return;
        }
        if !self.shared.read().devices.contains(&id) {
            let err = Error::DeviceNotFound {
                identifier: id.to_string(),
            };
            warn!("Ignoring connect: {}", err);
            return;
        }

        self.scan_requested = false;
        self.stop_scan().await;

        info!("Connecting to {}", id);
        self.link = Some(ActiveLink::new(id.clone()));
        self.shared.write().active_device = Some(id.clone());
        self.set_state(ConnectionState::Connecting);

        if let Err(e) = self.central.connect(&id).await {
            self.fail_connect(e.to_string()).await;
        }
    }

    /// Pick the UART characteristics out of a discovery result and subscribe.
    async fn finish_connect(&mut self, id: DeviceId, characteristics: &[GattCharacteristic]) {
        let write = characteristics
            .iter()
            .find(|c| c.uuid == UART_RX_UUID && c.properties.can_write())
            .cloned();
        let notify = characteristics
            .iter()
            .find(|c| c.uuid == UART_TX_UUID && c.properties.notify)
            .cloned();

        let (write, notify) = match (write, notify) {
            (Some(write), Some(notify)) => (write, notify),
            (None, _) => {
                let reason = Error::CharacteristicNotFound {
                    uuid: UART_RX_UUID.to_string(),
                };
                self.fail_connect(reason.to_string()).await;
                return;
            }
            (_, None) => {
                let reason = Error::CharacteristicNotFound {
                    uuid: UART_TX_UUID.to_string(),
                };
                self.fail_connect(reason.to_string()).await;
                return;
            }
        };

        if let Err(e) = self.central.subscribe(&id, &notify).await {
            self.fail_connect(format!("subscribe failed: {e}")).await;
            return;
        }

        if let Some(link) = self.link.as_mut() {
            link.writer = Some(spawn_link_writer(self.central.clone(), id.clone(), write));
            link.notify = Some(notify);
        }
        info!("Connected to {}", id);
        self.set_state(ConnectionState::Connected);
    }

    /// Abandon the connection attempt, release the link, and evict the device.
    ///
    /// The central is always told to disconnect, so an attempt still pending
    /// on the platform side is dropped rather than completing later.
    async fn fail_connect(&mut self, reason: String) {
        let Some(mut link) = self.link.take() else {
            return;
        };

        warn!("Connection to {} failed: {}", link.id, reason);

        link.close_writer().await;
        if let Err(e) = self.central.disconnect(&link.id).await {
            debug!("Failed to release link to {}: {}", link.id, e);
        }

        self.evict(&link.id);
        self.shared.write().active_device = None;
        self.set_state(ConnectionState::Idle);
        self.emit(TransportEvent::ConnectFailed { reason });
    }

    fn send(&mut self, text: String) {
        let writer = match (&self.link, self.state()) {
            (Some(link), ConnectionState::Connected) => link.writer.as_ref(),
            _ => None,
        };
        match writer {
            Some(writer) => writer.write(text.into_bytes()),
            None => debug!("Not connected, dropping {} bytes", text.len()),
        }
    }

    async fn disconnect(&mut self) {
        match self.state() {
            ConnectionState::Discovering => {
                self.scan_requested = false;
                self.stop_scan().await;
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                let Some(link) = self.link.as_mut() else {
                    return;
                };
                link.notify = None;
                link.close_writer().await;
                let id = link.id.clone();

                info!("Disconnecting from {}", id);
                self.set_state(ConnectionState::Disconnecting);

                if let Err(e) = self.central.disconnect(&id).await {
                    warn!("Disconnect from {} failed: {}", id, e);
                    self.link_closed(id, Some(e.to_string())).await;
                }
            }
            ConnectionState::Idle | ConnectionState::Disconnecting => {
                debug!("Nothing to disconnect");
            }
        }
    }

    /// The central reported the link to `id` as gone.
    async fn link_closed(&mut self, id: DeviceId, reason: Option<String>) {
        if self.state() == ConnectionState::Connecting && self.is_connecting_to(&id) {
            // The device went away before the connection completed.
            let reason = reason.unwrap_or_else(|| "device disconnected".to_string());
            self.fail_connect(reason).await;
            return;
        }

        self.evict(&id);

        if self.link.as_ref().is_some_and(|link| link.id == id) {
            if let Some(mut link) = self.link.take() {
                link.close_writer().await;
            }
            self.shared.write().active_device = None;
            match reason {
                Some(reason) => info!("Link to {} lost: {}", id, reason),
                None => info!("Disconnected from {}", id),
            }
            self.set_state(ConnectionState::Idle);
        }
    }

    async fn radio_changed(&mut self, radio: RadioState) {
        let old = std::mem::replace(&mut self.shared.write().radio, radio);
        // A repeated power-on still retries a scan that failed to start.
        if old == radio && !(radio.is_powered_on() && self.scan_requested) {
            return;
        }
        info!("Bluetooth radio state: {:?} -> {:?}", old, radio);

        if radio.is_powered_on() {
            let idle = self.state() == ConnectionState::Idle;
            if self.scan_requested || (idle && self.config.scan_on_power_on) {
                self.start_scan().await;
            }
            return;
        }

        match self.state() {
            ConnectionState::Discovering => {
                self.scan_requested = true;
                self.set_state(ConnectionState::Idle);
            }
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Disconnecting => {
                if let Some(mut link) = self.link.take() {
                    warn!("Radio lost, dropping link to {}", link.id);
                    link.close_writer().await;
                    self.evict(&link.id);
                }
                self.shared.write().active_device = None;
                self.set_state(ConnectionState::Idle);
            }
            ConnectionState::Idle => {}
        }
    }

    /// Release everything before the task exits.
    async fn teardown(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close_writer().await;
            if let Err(e) = self.central.disconnect(&link.id).await {
                debug!("Failed to release link to {}: {}", link.id, e);
            }
            self.shared.write().active_device = None;
        }
        self.stop_scan().await;
        self.set_state(ConnectionState::Idle);
    }

    fn is_connecting_to(&self, id: &DeviceId) -> bool {
        self.state() == ConnectionState::Connecting
            && self.link.as_ref().is_some_and(|link| link.id == *id)
    }

    fn evict(&mut self, id: &DeviceId) {
        if self.shared.write().devices.remove(id) {
            debug!("Removed {} from discovered devices", id);
            self.emit(TransportEvent::DevicesChanged);
        }
    }

    fn state(&self) -> ConnectionState {
        self.shared.read().state
    }

    /// Update the connection state and emit an event.
    fn set_state(&self, new_state: ConnectionState) {
        let old_state = std::mem::replace(&mut self.shared.write().state, new_state);

        if old_state != new_state {
            debug!("BLE state changed: {} -> {}", old_state, new_state);
            self.emit(TransportEvent::StateChanged {
                old: old_state,
                new: new_state,
            });
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Write queued text to `id` in chunks the link can carry.
fn spawn_link_writer<C: BleCentral>(
    central: Arc<C>,
    id: DeviceId,
    write: GattCharacteristic,
) -> LinkWriter {
    LinkWriter::spawn(move |mut queue| async move {
        while let Some(outbound) = queue.recv().await {
            match outbound {
                Outbound::Payload(payload) => {
                    write_chunks(central.as_ref(), &id, &write, &payload).await;
                }
                Outbound::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
    })
}

async fn write_chunks<C: BleCentral>(
    central: &C,
    id: &DeviceId,
    write: &GattCharacteristic,
    payload: &[u8],
) {
    let max_len = central.max_write_len(id);
    let mut chunks = 0;

    for chunk in chunk_payload(payload, max_len) {
        if let Err(e) = central.write(id, write, chunk).await {
            warn!("Write to {} failed after {} chunks: {}", id, chunks, e);
            return;
        }
        chunks += 1;
    }

    trace!(
        "Sent {} bytes to {} in {} chunks of at most {}",
        payload.len(),
        id,
        chunks,
        max_len
    );
}
