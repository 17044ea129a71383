//! [`BleCentral`] implementation over btleplug.
//!
//! btleplug hands out peripherals through an [`Adapter`]; this module keeps
//! the platform [`Peripheral`] handles keyed by [`DeviceId`] and translates
//! adapter events, connection results and notifications into [`LinkEvent`]s.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::channel::mpsc;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::central::{
    BleCentral, CharacteristicProperties, GattCharacteristic, LinkEvent, RadioState,
};
use crate::ble::device::{DeviceDescriptor, DeviceId};
use crate::ble::uuids::is_uart_service;
use crate::config::BleConfig;
use crate::error::{Error, Result};

type EventSender = mpsc::UnboundedSender<LinkEvent>;

/// Peripherals seen by the adapter, keyed by identifier.
type PeripheralMap = Arc<RwLock<HashMap<DeviceId, Peripheral>>>;

/// A [`BleCentral`] backed by a btleplug adapter.
pub struct BtleplugCentral {
    /// The BLE adapter to use.
    adapter: Adapter,
    /// Platform handles of discovered peripherals.
    peripherals: PeripheralMap,
    /// Connection attempts that have not completed yet.
    pending: Arc<Mutex<HashSet<DeviceId>>>,
    /// Sender half of the event stream.
    event_tx: EventSender,
    /// Receiver half, until [`BleCentral::events`] takes it.
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
    /// Adapter event pump.
    adapter_task: Mutex<Option<JoinHandle<()>>>,
    /// Notification forwarders, one per subscribed peripheral.
    notification_tasks: Mutex<HashMap<DeviceId, JoinHandle<()>>>,
    /// Write length reported for every link.
    max_write_len: usize,
}

impl BtleplugCentral {
    /// Create a central on the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new(config: BleConfig) -> Result<Self> {
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

        Ok(Self::with_adapter(adapter, config))
    }

    /// Create a central on a specific adapter.
    pub fn with_adapter(adapter: Adapter, config: BleConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded();

        Self {
            adapter,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashSet::new())),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            adapter_task: Mutex::new(None),
            notification_tasks: Mutex::new(HashMap::new()),
            max_write_len: config.max_write_len.max(1),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    fn peripheral(&self, id: &DeviceId) -> Result<Peripheral> {
        self.peripherals
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound {
                identifier: id.to_string(),
            })
    }

    fn stop_notifications(&self, id: &DeviceId) {
        if let Some(handle) = self.notification_tasks.lock().remove(id) {
            handle.abort();
        }
    }

    /// Find a btleplug characteristic matching `characteristic`.
    fn platform_characteristic(
        peripheral: &Peripheral,
        characteristic: &GattCharacteristic,
    ) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| {
                c.uuid == characteristic.uuid && c.service_uuid == characteristic.service_uuid
            })
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: characteristic.uuid.to_string(),
            })
    }

    /// Handle a BLE central event.
    async fn handle_event(
        event: CentralEvent,
        adapter: &Adapter,
        peripherals: &PeripheralMap,
        event_tx: &EventSender,
    ) {
        match event {
            CentralEvent::DeviceDiscovered(id) => {
                trace!("Device discovered: {:?}", id);
                Self::process_peripheral(adapter, id, peripherals, event_tx).await;
            }
            CentralEvent::DeviceUpdated(id) => {
                trace!("Device updated: {:?}", id);
                Self::process_peripheral(adapter, id, peripherals, event_tx).await;
            }
            CentralEvent::ServicesAdvertisement { id, services } => {
                if services.iter().any(is_uart_service) {
                    Self::process_peripheral(adapter, id, peripherals, event_tx).await;
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                debug!("Device disconnected: {:?}", id);
                let _ = event_tx.unbounded_send(LinkEvent::Disconnected {
                    id: DeviceId::new(id.to_string()),
                    reason: Some("peripheral disconnected".to_string()),
                });
            }
            CentralEvent::StateUpdate(state) => {
                let radio = match state {
                    CentralState::PoweredOn => RadioState::PoweredOn,
                    CentralState::PoweredOff => RadioState::PoweredOff,
                    _ => RadioState::Unknown,
                };
                let _ = event_tx.unbounded_send(LinkEvent::RadioStateChanged(radio));
            }
            _ => {}
        }
    }

    /// Report a peripheral if it advertises the UART service.
    async fn process_peripheral(
        adapter: &Adapter,
        id: PeripheralId,
        peripherals: &PeripheralMap,
        event_tx: &EventSender,
    ) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        // Some platforms ignore the scan filter.
        if !properties.services.iter().any(is_uart_service) {
            return;
        }

        let identifier = DeviceId::new(id.to_string());
        peripherals.write().insert(identifier.clone(), peripheral);

        let _ = event_tx.unbounded_send(LinkEvent::Discovered(DeviceDescriptor {
            id: identifier,
            name: properties.local_name,
            rssi: properties.rssi,
        }));
    }
}

fn characteristic_properties(flags: CharPropFlags) -> CharacteristicProperties {
    CharacteristicProperties {
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
    }
}

#[async_trait]
impl BleCentral for BtleplugCentral {
    async fn events(&self) -> Result<BoxStream<'static, LinkEvent>> {
        let event_rx = self
            .event_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Internal("event stream already taken".to_string()))?;

        let mut events = self.adapter.events().await.map_err(Error::Bluetooth)?;

        // btleplug has no portable way to query the initial radio state; an
        // adapter that hands out an event stream is treated as powered on
        // until it reports otherwise.
        let _ = self
            .event_tx
            .unbounded_send(LinkEvent::RadioStateChanged(RadioState::PoweredOn));

        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                Self::handle_event(event, &adapter, &peripherals, &event_tx).await;
            }
            debug!("Adapter event stream ended");
        });
        *self.adapter_task.lock() = Some(handle);

        Ok(event_rx.boxed())
    }

    async fn start_scan(&self, service: Uuid) -> Result<()> {
        self.adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await
            .map_err(Error::Bluetooth)
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await.map_err(Error::Bluetooth)
    }

    async fn connect(&self, id: &DeviceId) -> Result<()> {
        let peripheral = self.peripheral(id)?;
        self.pending.lock().insert(id.clone());

        let id = id.clone();
        let pending = self.pending.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let result = peripheral.connect().await;
            // A disconnect request removes the entry while we wait.
            let still_wanted = pending.lock().remove(&id);

            let event = match result {
                Ok(()) if still_wanted => LinkEvent::Connected(id),
                Ok(()) => {
                    debug!("Connection to {} completed after being abandoned", id);
                    if let Err(e) = peripheral.disconnect().await {
                        debug!("Failed to drop abandoned link to {}: {}", id, e);
                    }
                    return;
                }
                Err(e) => LinkEvent::ConnectFailed {
                    id,
                    reason: e.to_string(),
                },
            };
            let _ = event_tx.unbounded_send(event);
        });

        Ok(())
    }

    async fn discover_services(&self, id: &DeviceId) -> Result<()> {
        let peripheral = self.peripheral(id)?;
        let id = id.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            // btleplug discovers characteristics together with services.
            let event = match peripheral.discover_services().await {
                Ok(()) => LinkEvent::ServicesDiscovered {
                    id,
                    services: peripheral.services().iter().map(|s| s.uuid).collect(),
                },
                Err(e) => {
                    warn!("Failed to discover services on {}: {}", id, e);
                    LinkEvent::DiscoveryFailed {
                        id,
                        reason: e.to_string(),
                    }
                }
            };
            let _ = event_tx.unbounded_send(event);
        });

        Ok(())
    }

    async fn discover_characteristics(
        &self,
        id: &DeviceId,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<()> {
        let peripheral = self.peripheral(id)?;

        let found: Vec<GattCharacteristic> = peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == service)
            .flat_map(|s| s.characteristics)
            .filter(|c| characteristics.contains(&c.uuid))
            .map(|c| {
                debug!(
                    "Found characteristic: {} in service {}, properties: {:?}",
                    c.uuid, c.service_uuid, c.properties
                );
                GattCharacteristic {
                    uuid: c.uuid,
                    service_uuid: c.service_uuid,
                    properties: characteristic_properties(c.properties),
                }
            })
            .collect();

        let _ = self
            .event_tx
            .unbounded_send(LinkEvent::CharacteristicsDiscovered {
                id: id.clone(),
                service,
                characteristics: found,
            });

        Ok(())
    }

    async fn subscribe(&self, id: &DeviceId, characteristic: &GattCharacteristic) -> Result<()> {
        let peripheral = self.peripheral(id)?;
        let platform = Self::platform_characteristic(&peripheral, characteristic)?;

        // Open the stream before subscribing so no early value is lost.
        let mut notifications = peripheral.notifications().await.map_err(Error::Bluetooth)?;

        peripheral.subscribe(&platform).await.map_err(|e| {
            debug!("Failed to subscribe to {}: {:?}", platform.uuid, e);
            Error::Bluetooth(e)
        })?;

        debug!("Subscribed to notifications from {}", platform.uuid);

        let device = id.clone();
        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                trace!(
                    "Notification received from {}: {} bytes",
                    notification.uuid,
                    notification.value.len()
                );
                let event = LinkEvent::Notification {
                    id: device.clone(),
                    characteristic: notification.uuid,
                    value: notification.value,
                };
                if event_tx.unbounded_send(event).is_err() {
                    break;
                }
            }
            debug!("Notification listener for {} stopped", device);
        });

        if let Some(previous) = self.notification_tasks.lock().insert(id.clone(), handle) {
            previous.abort();
        }

        Ok(())
    }

    fn max_write_len(&self, _id: &DeviceId) -> usize {
        self.max_write_len
    }

    async fn write(
        &self,
        id: &DeviceId,
        characteristic: &GattCharacteristic,
        data: &[u8],
    ) -> Result<()> {
        let peripheral = self.peripheral(id)?;
        let platform = Self::platform_characteristic(&peripheral, characteristic)?;

        peripheral
            .write(&platform, data, WriteType::WithoutResponse)
            .await
            .map_err(Error::Bluetooth)?;

        trace!("Wrote {} bytes to characteristic {}", data.len(), platform.uuid);

        Ok(())
    }

    async fn disconnect(&self, id: &DeviceId) -> Result<()> {
        let peripheral = self.peripheral(id)?;
        self.stop_notifications(id);

        let abandoned = self.pending.lock().remove(id);

        let id = id.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let reason = if abandoned {
                None
            } else {
                match peripheral.disconnect().await {
                    Ok(()) => None,
                    Err(e) => {
                        error!("Failed to disconnect from {}: {}", id, e);
                        Some(e.to_string())
                    }
                }
            };
            let _ = event_tx.unbounded_send(LinkEvent::Disconnected { id, reason });
        });

        Ok(())
    }
}

impl Drop for BtleplugCentral {
    fn drop(&mut self) {
        if let Some(handle) = self.adapter_task.lock().take() {
            handle.abort();
        }
        for (_, handle) in self.notification_tasks.lock().drain() {
            handle.abort();
        }
    }
}
