//! Serial transport module.
//!
//! This module provides the serial UART transport and the [`SerialDriver`]
//! seam it opens ports through, plus a tokio-serial implementation of that
//! seam.

pub mod port;
pub mod tokio_driver;
pub mod transport;

pub use port::{PortDescriptor, PortKind, PortReader, PortWriter, SerialConnection, SerialDriver};
pub use tokio_driver::TokioSerialDriver;
pub use transport::{SerialTarget, SerialTransport};
