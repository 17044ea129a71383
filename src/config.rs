//! Transport configuration.
//!
//! Both transports take a small configuration struct at construction. The
//! defaults match what a typical terminal application wants.

/// Baud rates offered to the user for serial connections.
pub const BAUD_RATES: [u32; 5] = [9600, 19200, 38400, 57600, 115200];

/// Baud rate used when no preference has been stored yet.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Preference key under which the last selected baud rate is stored.
pub const BAUD_RATE_PREFERENCE_KEY: &str = "SelectedBaudRate";

/// Largest payload of a single write without response at the default ATT MTU
/// (23 bytes minus the 3 byte ATT header).
pub const DEFAULT_BLE_WRITE_LEN: usize = 20;

/// Configuration for a [`BleTransport`](crate::ble::BleTransport).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BleConfig {
    /// Start scanning whenever the radio reports powered on while idle.
    pub scan_on_power_on: bool,
    /// Maximum write length reported by [`BtleplugCentral`](crate::ble::BtleplugCentral).
    pub max_write_len: usize,
    /// Capacity of the observer broadcast channel.
    pub event_capacity: usize,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            scan_on_power_on: true,
            max_write_len: DEFAULT_BLE_WRITE_LEN,
            event_capacity: 256,
        }
    }
}

impl BleConfig {
    /// Enable or disable scanning on radio power-on.
    pub fn with_scan_on_power_on(mut self, enabled: bool) -> Self {
        self.scan_on_power_on = enabled;
        self
    }

    /// Override the maximum write length.
    pub fn with_max_write_len(mut self, len: usize) -> Self {
        self.max_write_len = len.max(1);
        self
    }
}

/// Configuration for a [`SerialTransport`](crate::serial::SerialTransport).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Baud rate used when the preference store holds no value.
    pub default_baud_rate: u32,
    /// Size of the buffer each read from the port fills.
    pub read_buffer_size: usize,
    /// Capacity of the observer broadcast channel.
    pub event_capacity: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            default_baud_rate: DEFAULT_BAUD_RATE,
            read_buffer_size: 1024,
            event_capacity: 256,
        }
    }
}

impl SerialConfig {
    /// Override the fallback baud rate.
    pub fn with_default_baud_rate(mut self, baud_rate: u32) -> Self {
        self.default_baud_rate = baud_rate;
        self
    }

    /// Override the read buffer size.
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }
}
