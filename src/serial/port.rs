//! Serial ports and the driver seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// Kind of hardware behind a serial port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PortKind {
    /// USB serial adapter.
    Usb,
    /// Built-in PCI serial port.
    Pci,
    /// Bluetooth serial profile.
    Bluetooth,
    /// Anything else.
    #[default]
    Unknown,
}

/// A serial port found by enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescriptor {
    /// OS path used to open the port.
    pub path: String,
    /// Name to show to the user.
    pub name: String,
    /// Kind of hardware.
    pub kind: PortKind,
}

impl PortDescriptor {
    /// Create a descriptor whose display name is the last path component.
    pub fn from_path(path: impl Into<String>) -> Self {
        let path = path.into();
        let name = path.rsplit('/').next().unwrap_or(&path).to_string();
        Self {
            path,
            name,
            kind: PortKind::Unknown,
        }
    }
}

/// Readable half of an open port.
pub type PortReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writable half of an open port.
pub type PortWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An open port, split into halves.
///
/// Dropping both halves closes the port.
pub struct SerialConnection {
    /// Inbound bytes. End of stream or an error means the port went away.
    pub reader: PortReader,
    /// Outbound bytes.
    pub writer: PortWriter,
}

impl SerialConnection {
    /// Split a bidirectional stream into a connection.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

impl std::fmt::Debug for SerialConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialConnection").finish_non_exhaustive()
    }
}

/// Enumerates and opens serial ports.
#[async_trait]
pub trait SerialDriver: Send + Sync + 'static {
    /// List the ports currently present.
    fn available_ports(&self) -> Result<Vec<PortDescriptor>>;

    /// Open `path` at `baud_rate`. Resolves once the OS has confirmed the
    /// port is open.
    async fn open(&self, path: &str, baud_rate: u32) -> Result<SerialConnection>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_descriptor_from_path() {
        let port = PortDescriptor::from_path("/dev/ttyUSB0");
        assert_eq!(port.name, "ttyUSB0");
        assert_eq!(port.kind, PortKind::Unknown);

        assert_eq!(PortDescriptor::from_path("COM3").name, "COM3");
    }

    #[tokio::test]
    async fn test_connection_from_stream() {
        let (client, mut device) = tokio::io::duplex(64);
        let mut connection = SerialConnection::from_stream(client);

        connection.writer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        device.write_all(b"pong").await.unwrap();
        connection.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }
}
