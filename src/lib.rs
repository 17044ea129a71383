// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # uart-bridge
//!
//! Text transports for UART-style devices, over Bluetooth Low Energy and over
//! serial ports.
//!
//! Both transports present the same shape through the [`Transport`] trait: a
//! connection state, a growing buffer of received text, and `connect`,
//! `send`, and `disconnect` operations that are queued to a background task
//! which owns the link.
//!
//! ## Features
//!
//! - **BLE**: Scan for peripherals advertising the Nordic UART Service,
//!   connect, and exchange text over its RX and TX characteristics
//! - **Serial**: Enumerate ports, open one at a chosen baud rate, and exchange
//!   text over it
//! - **Persistence**: The selected baud rate survives restarts
//! - **Observers**: Subscribe to [`TransportEvent`]s or register callbacks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use uart_bridge::{BleConfig, BleTransport, Result, Transport};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Scanning starts as soon as the radio is powered on
//!     let transport = BleTransport::with_system_adapter(BleConfig::default()).await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     if let Some(device) = transport.devices().first() {
//!         println!("Connecting to {}", device.display_name());
//!         transport.connect(device.id.clone())?;
//!     }
//!
//!     let _handle = transport.on_text_received(|text| print!("{}", text));
//!     transport.send("hello\n")?;
//!
//!     transport.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps. Only `/dev/cu.*` serial devices are
//! listed.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` and `dialout`
//! groups.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.

// Public modules
pub mod ble;
pub mod config;
pub mod error;
pub mod preferences;
pub mod serial;
pub mod transport;
pub mod utils;

// Re-exports for convenience
pub use config::{BleConfig, SerialConfig, BAUD_RATES, DEFAULT_BAUD_RATE};
pub use error::{Error, Result};
pub use preferences::{JsonFilePreferences, MemoryPreferences, PreferenceStore};
pub use transport::{CallbackHandle, ConnectionState, TextBuffer, Transport, TransportEvent};
pub use utils::{chunk_payload, decode_utf8};

// Re-export commonly used types from submodules
pub use ble::{
    BleCentral, BleTransport, BtleplugCentral, DeviceDescriptor, DeviceId, LinkEvent, RadioState,
};
pub use serial::{
    PortDescriptor, PortKind, SerialConnection, SerialDriver, SerialTarget, SerialTransport,
    TokioSerialDriver,
};
