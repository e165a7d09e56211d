//! Serial transport.
//!
//! The acquisition core only needs a byte stream that can be read and
//! written asynchronously. [`SerialPortIO`] names that requirement, so the
//! same connection code drives:
//!
//! - `tokio_serial::SerialStream` (real hardware, via [`SerialPortOpener`])
//! - `tokio::io::DuplexStream` (tests)
//! - any other mock implementing the async I/O traits
//!
//! How a stream is obtained is abstracted behind [`StreamOpener`].

use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async serial port I/O.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types meeting the requirements
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

// =============================================================================
// Open options
// =============================================================================

/// Parameters for opening the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialOptions {
    /// Port path (e.g. `/dev/ttyACM0`, `COM3`)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Read buffer size in bytes
    pub buffer_size: usize,
}

impl Default for SerialOptions {
    fn default() -> Self {
        Self {
            port: default_port().to_string(),
            baud_rate: 115_200,
            buffer_size: 65_536,
        }
    }
}

fn default_port() -> &'static str {
    if cfg!(windows) {
        "COM3"
    } else {
        "/dev/ttyACM0"
    }
}

/// Source of byte streams.
#[async_trait]
pub trait StreamOpener: Send + Sync {
    /// Open a stream or fail with [`DaqError::Connection`].
    async fn open(&self, options: &SerialOptions) -> AppResult<DynSerial>;
}

// =============================================================================
// Hardware opener
// =============================================================================

/// Opens real serial ports with `tokio-serial` (8N1, no flow control).
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialPortOpener;

#[async_trait]
impl StreamOpener for SerialPortOpener {
    async fn open(&self, options: &SerialOptions) -> AppResult<DynSerial> {
        let port = open_serial_async(&options.port, options.baud_rate).await?;
        Ok(Box::new(port))
    }
}

/// Open a serial port on the blocking pool.
///
/// Port initialization can block for a noticeable time on some platforms,
/// so it is kept off the async runtime.
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
) -> AppResult<tokio_serial::SerialStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    debug!(port = %port_path, baud_rate, "Opening serial port");

    let stream = spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| DaqError::Connection(format!("{port_path_owned}: {e}")))
    })
    .await
    .map_err(|e| DaqError::Connection(format!("serial open task failed: {e}")))??;

    info!(port = %port_path, baud_rate, "Serial port opened");
    Ok(stream)
}

/// A serial port visible to the OS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortListing {
    /// Port path
    pub name: String,
    /// USB product string or port type
    pub description: String,
}

/// List serial ports.
pub fn list_ports() -> AppResult<Vec<PortListing>> {
    let ports = serialport::available_ports()
        .map_err(|e| DaqError::Connection(format!("cannot enumerate ports: {e}")))?;

    Ok(ports
        .into_iter()
        .map(|port| {
            let description = match port.port_type {
                serialport::SerialPortType::UsbPort(usb) => format!(
                    "USB {:04x}:{:04x} {}",
                    usb.vid,
                    usb.pid,
                    usb.product.unwrap_or_default()
                ),
                serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                serialport::SerialPortType::PciPort => "PCI".to_string(),
                serialport::SerialPortType::Unknown => "Unknown".to_string(),
            };
            PortListing {
                name: port.port_name,
                description: description.trim_end().to_string(),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn duplex_stream_is_a_serial_port() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut port: DynSerial = Box::new(device);

        host.write_all(b"1,2\n").await.unwrap();
        let mut buf = [0u8; 4];
        port.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"1,2\n");
    }

    #[tokio::test]
    async fn missing_port_is_a_connection_error() {
        let options = SerialOptions {
            port: "/dev/volt-daq-does-not-exist".to_string(),
            ..SerialOptions::default()
        };
        match SerialPortOpener.open(&options).await {
            Err(DaqError::Connection(msg)) => assert!(msg.contains("volt-daq-does-not-exist")),
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("opened a port that does not exist"),
        }
    }

    #[test]
    fn default_options() {
        let options = SerialOptions::default();
        assert_eq!(options.baud_rate, 115_200);
        assert_eq!(options.buffer_size, 65_536);
    }
}
