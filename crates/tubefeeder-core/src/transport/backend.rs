//! Serial backends
//!
//! The transport only needs two things from the platform: a list of ports and
//! a byte stream for one of them. Hardware goes through `serialport` and
//! `tokio-serial`; tests plug in an in-memory controller.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, StopBits};
use tracing::{debug, warn};

use crate::config::SerialSettings;
use crate::discovery::{self, PortDescriptor};
use crate::error::{FeederError, Result};

/// Byte stream to the controller
pub trait SerialIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialIo for T {}

/// Owned stream handed out by a backend
pub type DynSerial = Box<dyn SerialIo>;

/// Source of serial ports and streams
pub trait SerialBackend: Send + Sync {
    /// Currently attached ports
    fn enumerate(&self) -> Vec<PortDescriptor>;

    /// Open `path` with the given settings; must be called within a tokio runtime
    fn open(&self, path: &str, settings: &SerialSettings) -> Result<DynSerial>;
}

/// Real serial ports
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeSerial;

impl SerialBackend for NativeSerial {
    fn enumerate(&self) -> Vec<PortDescriptor> {
        discovery::enumerate()
    }

    fn open(&self, path: &str, settings: &SerialSettings) -> Result<DynSerial> {
        // Standard 8N1, no flow control
        let mut stream = tokio_serial::new(path, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(settings.read_timeout_ms))
            .open_native_async()
            .map_err(|e| FeederError::TransportError(format!("could not open {}: {}", path, e)))?;

        // Opening the port pulses DTR, which resets the board into its bootloader.
        // Keep DTR asserted afterwards so the controller is not reset again mid-session.
        if let Err(e) = stream.write_data_terminal_ready(true) {
            warn!("failed to assert DTR on {}: {} (continuing)", path, e);
        } else {
            debug!("DTR asserted on {}", path);
        }

        Ok(Box::new(stream))
    }
}
