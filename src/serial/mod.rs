//! # Serial Communication Module
//!
//! Handles the serial link to the flight controller's USB VCP port.
//!
//! This module handles:
//! - Discovering and ranking candidate serial ports
//! - Opening a port with 8N1, no flow control
//! - Bounded-timeout reads and flushed writes
//! - Idempotent release of the port

pub mod discovery;
pub mod port_trait;

pub use discovery::{discover, PortCandidate, PortPreference};
pub use port_trait::Transport;

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt};
use tracing::{debug, info, warn};

use crate::error::TransportError;

/// Default baud rate for INAV's MSP port (ignored by USB VCP, honoured by UARTs)
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Byte link to the flight controller
///
/// Generic over the underlying stream so tests can substitute an in-memory
/// mock for the serial device.
pub struct SerialLink<S = tokio_serial::SerialStream> {
    /// Stream handle, `None` once closed
    stream: Option<S>,
    /// Device path (e.g., /dev/ttyACM0)
    device_path: String,
    /// Configured baud rate
    baud_rate: u32,
}

impl<S> std::fmt::Debug for SerialLink<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink")
            .field("device_path", &self.device_path)
            .field("baud_rate", &self.baud_rate)
            .field("open", &self.stream.is_some())
            .finish_non_exhaustive()
    }
}

impl SerialLink<tokio_serial::SerialStream> {
    /// Open a serial port with MSP settings
    ///
    /// # Arguments
    ///
    /// * `path` - Device path (e.g., "/dev/ttyACM0" or "COM3")
    /// * `baud_rate` - Baud rate
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::OpenFailed`] if the device cannot be opened
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use fc_link::serial::{SerialLink, DEFAULT_BAUD_RATE};
    ///
    /// #[tokio::main(flavor = "current_thread")]
    /// async fn main() -> anyhow::Result<()> {
    ///     let link = SerialLink::open("/dev/ttyACM0", DEFAULT_BAUD_RATE)?;
    ///     println!("Opened {}", link.device_path());
    ///     Ok(())
    /// }
    /// ```
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, TransportError> {
        debug!("Opening serial port {} at {} baud", path, baud_rate);

        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| TransportError::OpenFailed {
                path: path.to_string(),
                message: e.to_string(),
            })?;

        // Stale bytes from a previous session would be mistaken for responses
        if let Err(e) = port.clear(tokio_serial::ClearBuffer::All) {
            warn!("Could not clear buffers on {}: {}", path, e);
        }

        info!("Opened serial port {}", path);
        Ok(Self::from_stream(port, path, baud_rate))
    }
}

impl<S> SerialLink<S> {
    /// Wrap an already-open stream
    pub fn from_stream(stream: S, path: &str, baud_rate: u32) -> Self {
        Self {
            stream: Some(stream),
            device_path: path.to_string(),
            baud_rate,
        }
    }

    /// Get the device path of the port
    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// Get the configured baud rate
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

#[async_trait]
impl<S> Transport for SerialLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        let mut buf = vec![0u8; max_bytes];

        match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
            Err(_) => Ok(Vec::new()),
            Ok(Ok(0)) => Err(TransportError::Disconnected),
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(buf)
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
            Ok(Err(e)) => Err(TransportError::ReadFailed(e.to_string())),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;

        stream
            .write_all(data)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| TransportError::WriteFailed(format!("flush: {}", e)))?;

        debug!("Wrote {} bytes to {}", data.len(), self.device_path);
        Ok(())
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            info!("Closed serial port {}", self.device_path);
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}
