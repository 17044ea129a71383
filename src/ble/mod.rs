//! BLE transport module.
//!
//! This module provides the Nordic UART Service transport and the
//! [`BleCentral`] seam it drives, plus a btleplug implementation of that seam.

pub mod btleplug_central;
pub mod central;
pub mod device;
pub mod transport;
pub mod uuids;

pub use btleplug_central::BtleplugCentral;
pub use central::{BleCentral, CharacteristicProperties, GattCharacteristic, LinkEvent, RadioState};
pub use device::{DeviceDescriptor, DeviceId, DeviceSet};
pub use transport::BleTransport;
pub use uuids::*;
