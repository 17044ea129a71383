//! Discovered peripherals.

use serde::{Deserialize, Serialize};

/// Stable identifier of a BLE peripheral.
///
/// This is the string form of the platform's peripheral id. The platform
/// handle itself stays inside the [`BleCentral`](crate::ble::BleCentral).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap a platform identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A peripheral found while scanning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Stable identifier.
    pub id: DeviceId,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Signal strength in dBm at discovery.
    pub rssi: Option<i16>,
}

impl DeviceDescriptor {
    /// Create a descriptor without signal strength.
    pub fn new(id: impl Into<DeviceId>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
            rssi: None,
        }
    }

    /// Name to show to the user.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

/// Discovered peripherals, keyed by identifier, in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSet {
    devices: Vec<DeviceDescriptor>,
}

impl DeviceSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device unless one with the same id is already present.
    ///
    /// Returns `true` if the device was added.
    pub fn insert(&mut self, device: DeviceDescriptor) -> bool {
        if self.contains(&device.id) {
            return false;
        }
        self.devices.push(device);
        true
    }

    /// Remove the device with `id`. Returns `true` if it was present.
    pub fn remove(&mut self, id: &DeviceId) -> bool {
        let before = self.devices.len();
        self.devices.retain(|d| d.id != *id);
        self.devices.len() != before
    }

    /// Check if a device with `id` is present.
    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.iter().any(|d| d.id == *id)
    }

    /// Look up a device.
    pub fn get(&self, id: &DeviceId) -> Option<&DeviceDescriptor> {
        self.devices.iter().find(|d| d.id == *id)
    }

    /// Remove every device.
    pub fn clear(&mut self) {
        self.devices.clear();
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Devices in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices.iter()
    }

    /// Copy the devices out.
    pub fn to_vec(&self) -> Vec<DeviceDescriptor> {
        self.devices.clone()
    }
}
