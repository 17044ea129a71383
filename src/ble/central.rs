//! The seam between [`BleTransport`](crate::ble::BleTransport) and a BLE stack.
//!
//! A [`BleCentral`] accepts requests and reports their outcome as
//! [`LinkEvent`]s on the stream returned by [`BleCentral::events`]. Requests
//! that take radio time (`connect`, `discover_services`,
//! `discover_characteristics`, `disconnect`) must return as soon as the
//! request is issued; completion is reported only through events.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ble::device::{DeviceDescriptor, DeviceId};
use crate::error::Result;

/// Power state of the BLE radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RadioState {
    /// Not reported yet.
    #[default]
    Unknown,
    /// Radio is on and usable.
    PoweredOn,
    /// Radio is off or unavailable.
    PoweredOff,
}

impl RadioState {
    /// Check if the radio can be used.
    pub fn is_powered_on(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

/// Properties of a GATT characteristic the bridge cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CharacteristicProperties {
    /// Supports write with response.
    pub write: bool,
    /// Supports write without response.
    pub write_without_response: bool,
    /// Supports notifications.
    pub notify: bool,
}

impl CharacteristicProperties {
    /// Check if the characteristic accepts writes of either kind.
    pub fn can_write(&self) -> bool {
        self.write || self.write_without_response
    }
}

/// A discovered GATT characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GattCharacteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// UUID of the service that contains it.
    pub service_uuid: Uuid,
    /// Supported operations.
    pub properties: CharacteristicProperties,
}

/// Event reported by a [`BleCentral`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The radio power state changed.
    RadioStateChanged(RadioState),
    /// A peripheral advertising the UART service was seen.
    Discovered(DeviceDescriptor),
    /// A link to the peripheral was established.
    Connected(DeviceId),
    /// A connection attempt failed.
    ConnectFailed {
        /// The peripheral.
        id: DeviceId,
        /// Description of the failure.
        reason: String,
    },
    /// Service discovery finished.
    ServicesDiscovered {
        /// The peripheral.
        id: DeviceId,
        /// UUIDs of the discovered services.
        services: Vec<Uuid>,
    },
    /// Characteristic discovery for a service finished.
    CharacteristicsDiscovered {
        /// The peripheral.
        id: DeviceId,
        /// The service that was searched.
        service: Uuid,
        /// Characteristics found in it.
        characteristics: Vec<GattCharacteristic>,
    },
    /// Service or characteristic discovery failed.
    DiscoveryFailed {
        /// The peripheral.
        id: DeviceId,
        /// Description of the failure.
        reason: String,
    },
    /// The link went away, requested or not.
    Disconnected {
        /// The peripheral.
        id: DeviceId,
        /// Description of the cause for an unrequested disconnect.
        reason: Option<String>,
    },
    /// A notification arrived.
    Notification {
        /// The peripheral.
        id: DeviceId,
        /// The characteristic that notified.
        characteristic: Uuid,
        /// The notified value.
        value: Vec<u8>,
    },
}

/// A BLE central the transport drives.
#[async_trait]
pub trait BleCentral: Send + Sync + 'static {
    /// Take the event stream. Called once, when the transport starts.
    async fn events(&self) -> Result<BoxStream<'static, LinkEvent>>;

    /// Start scanning for peripherals advertising `service`.
    async fn start_scan(&self, service: Uuid) -> Result<()>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<()>;

    /// Request a link. Completes with [`LinkEvent::Connected`] or
    /// [`LinkEvent::ConnectFailed`].
    async fn connect(&self, id: &DeviceId) -> Result<()>;

    /// Request service discovery. Completes with
    /// [`LinkEvent::ServicesDiscovered`] or [`LinkEvent::DiscoveryFailed`].
    async fn discover_services(&self, id: &DeviceId) -> Result<()>;

    /// Request discovery of `characteristics` within `service`. Completes with
    /// [`LinkEvent::CharacteristicsDiscovered`] or [`LinkEvent::DiscoveryFailed`].
    async fn discover_characteristics(
        &self,
        id: &DeviceId,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<()>;

    /// Enable notifications on `characteristic`. Values arrive as
    /// [`LinkEvent::Notification`].
    async fn subscribe(&self, id: &DeviceId, characteristic: &GattCharacteristic) -> Result<()>;

    /// Largest payload a single write without response may carry right now.
    fn max_write_len(&self, id: &DeviceId) -> usize;

    /// Write without response.
    async fn write(
        &self,
        id: &DeviceId,
        characteristic: &GattCharacteristic,
        data: &[u8],
    ) -> Result<()>;

    /// Tear down the link, or abandon a pending connection attempt.
    /// Completes with [`LinkEvent::Disconnected`].
    async fn disconnect(&self, id: &DeviceId) -> Result<()>;
}
