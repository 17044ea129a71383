//! BLE Service and Characteristic UUIDs.
//!
//! The bridge speaks the Nordic UART Service (NUS).

use uuid::Uuid;

/// Nordic UART Service UUID.
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e24dcca9e);
/// UART RX characteristic UUID (write to peripheral).
pub const UART_RX_UUID: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e24dcca9e);
/// UART TX characteristic UUID (notifications from peripheral).
pub const UART_TX_UUID: Uuid = Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e24dcca9e);

/// Characteristics the bridge needs inside the UART service.
pub const UART_CHARACTERISTICS: [Uuid; 2] = [UART_RX_UUID, UART_TX_UUID];

/// Check if a service UUID is the UART service.
pub fn is_uart_service(uuid: &Uuid) -> bool {
    *uuid == UART_SERVICE_UUID
}
