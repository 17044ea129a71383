//! [`SerialDriver`] implementation over tokio-serial.

use async_trait::async_trait;
use tokio_serial::{SerialPortBuilderExt, SerialPortType};
use tracing::{debug, info};

use crate::error::Result;
use crate::serial::port::{PortDescriptor, PortKind, SerialConnection, SerialDriver};

/// Serial driver for the ports of this machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSerialDriver;

impl TokioSerialDriver {
    /// Create a driver.
    pub fn new() -> Self {
        Self
    }
}

fn describe(port: tokio_serial::SerialPortInfo) -> PortDescriptor {
    let mut descriptor = PortDescriptor::from_path(port.port_name);

    match port.port_type {
        SerialPortType::UsbPort(info) => {
            descriptor.kind = PortKind::Usb;
            if let Some(product) = info.product {
                descriptor.name = product;
            }
        }
        SerialPortType::PciPort => descriptor.kind = PortKind::Pci,
        SerialPortType::BluetoothPort => descriptor.kind = PortKind::Bluetooth,
        SerialPortType::Unknown => {}
    }

    descriptor
}

#[async_trait]
impl SerialDriver for TokioSerialDriver {
    fn available_ports(&self) -> Result<Vec<PortDescriptor>> {
        let ports = tokio_serial::available_ports()?;

        Ok(ports
            .into_iter()
            // On macOS only the cu (calling unit) devices are listed; the tty
            // devices block on open waiting for carrier detect.
            .filter(|_p| {
                #[cfg(target_os = "macos")]
                {
                    !_p.port_name.starts_with("/dev/tty.")
                }
                #[cfg(not(target_os = "macos"))]
                {
                    true
                }
            })
            .map(describe)
            .collect())
    }

    async fn open(&self, path: &str, baud_rate: u32) -> Result<SerialConnection> {
        debug!("Opening {} at {} baud", path, baud_rate);

        let stream = tokio_serial::new(path, baud_rate).open_native_async()?;

        info!("Opened {} at {} baud", path, baud_rate);
        Ok(SerialConnection::from_stream(stream))
    }
}
