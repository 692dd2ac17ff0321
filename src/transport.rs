use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::Duration;

/// A duplex byte stream to the device under test.
///
/// Implementations provide short bounded reads and best-effort writes; the
/// framing layer above decides what read failures mean. Only the inability
/// to open a transport in the first place is treated as fatal.
pub trait Transport: Send {
    /// Read whatever bytes are available, blocking at most for the
    /// transport's own short internal timeout. Returns `Ok(0)` when no data
    /// arrived in time.
    fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Write all bytes.
    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()>;

    /// Drive the DTR control line. Wired to the DUT reset circuit on the
    /// bench fixture.
    fn set_dtr(&mut self, level: bool) -> std::io::Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to open serial port '{port}': {source}")]
    Open {
        port: String,
        source: serialport::Error,
    },
}

/// [`Transport`] over a physical serial port.
pub struct SerialTransport {
    serial: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub const DEFAULT_BAUD: u32 = 115_200;

    /// Short per-read timeout; response accumulation is bounded by the
    /// command timeout above this layer, not here.
    const READ_TIMEOUT: Duration = Duration::from_millis(100);

    pub fn open(port: &str, baud: u32) -> Result<Self, TransportError> {
        let serial = serialport::new(port, baud)
            .timeout(Self::READ_TIMEOUT)
            .open()
            .map_err(|source| TransportError::Open {
                port: port.to_string(),
                source,
            })?;

        log::debug!("Opened serial port {port} at {baud} baud");
        Ok(Self { serial })
    }
}

impl Transport for SerialTransport {
    fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.serial.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.serial.write_all(bytes)
    }

    fn set_dtr(&mut self, level: bool) -> std::io::Result<()> {
        self.serial
            .write_data_terminal_ready(level)
            .map_err(Into::into)
    }
}
