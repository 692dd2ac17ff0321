//! Session object for one Aquarian board on the bench.
//!
//! [`Board`] owns the console connection for the duration of a test
//! session and exposes the firmware's command set as typed operations.
//! Opening the transport is the only fatal failure; every command after
//! that reports failure as a value and leaves retry policy to the caller.

use crate::console::{Console, PassFailOutcome, FAIL};
use crate::transport::{SerialTransport, Transport, TransportError};
use std::thread;
use std::time::Duration;

/// Oldest board-test firmware this tool knows how to drive.
pub const MIN_FIRMWARE_VERSION: &str = "1.20.0";

const SHORT_TIMEOUT: Duration = Duration::from_secs(2);
const LONG_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Failed to read test firmware version")]
    VersionUnavailable,

    #[error("Test firmware {found} is older than required {required}")]
    FirmwareTooOld { found: String, required: String },
}

/// Addressable status LEDs on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Led {
    Sys,
    Ble,
}

impl Led {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sys => "SYS",
            Self::Ble => "BLE",
        }
    }
}

/// LED colors the test firmware accepts, plus off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedColor {
    Red,
    Green,
    Blue,
    Off,
}

impl LedColor {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Red => "RED",
            Self::Green => "GRN",
            Self::Blue => "BLU",
            Self::Off => "OFF",
        }
    }
}

pub struct Board<T: Transport = SerialTransport> {
    console: Console<T>,
}

impl Board<SerialTransport> {
    /// Open the DUT console port. Unlike everything that follows, an open
    /// failure is fatal to the session and surfaced immediately.
    pub fn open(port: &str, baud: u32) -> Result<Self, BoardError> {
        let transport = SerialTransport::open(port, baud)?;
        Ok(Self::new(Console::new(transport)))
    }
}

impl<T: Transport> Board<T> {
    pub fn new(console: Console<T>) -> Self {
        Self { console }
    }

    /// The raw console, for callers issuing commands this wrapper does not
    /// model (ADC/digital polling modes).
    pub fn console(&mut self) -> &mut Console<T> {
        &mut self.console
    }

    pub fn into_console(self) -> Console<T> {
        self.console
    }

    /// Pulse DTR to reset the DUT, then wait `delay` for it to boot.
    pub fn reset(&mut self, delay: Duration) {
        let transport = self.console.transport_mut();
        if let Err(e) = transport.set_dtr(true) {
            log::warn!("Asserting reset failed: {e}");
        }
        thread::sleep(Duration::from_millis(100));
        if let Err(e) = transport.set_dtr(false) {
            log::warn!("Releasing reset failed: {e}");
        }
        thread::sleep(delay);
    }

    /// Hold or release the DUT reset line without cycling it.
    pub fn reset_hold(&mut self, active: bool) {
        if let Err(e) = self.console.transport_mut().set_dtr(active) {
            log::warn!("Driving reset line failed: {e}");
        }
    }

    /// Board-test firmware version string.
    pub fn read_version(&mut self) -> Option<String> {
        self.read_data_line("TST-VER", SHORT_TIMEOUT)
    }

    /// Read the firmware version and fail unless it is at least `min`.
    pub fn require_version(&mut self, min: &str) -> Result<String, BoardError> {
        let found = self
            .read_version()
            .ok_or(BoardError::VersionUnavailable)?;
        match (parse_version(&found), parse_version(min)) {
            (Some(f), Some(m)) if f >= m => Ok(found),
            _ => Err(BoardError::FirmwareTooOld {
                found,
                required: min.to_string(),
            }),
        }
    }

    pub fn read_cpu_id(&mut self) -> Option<String> {
        self.read_data_line("CPU-ID", LONG_TIMEOUT)
    }

    pub fn read_atca_serial(&mut self) -> Option<String> {
        self.read_data_line("ATCA-SN-READ", SHORT_TIMEOUT)
    }

    pub fn read_eeprom_info(&mut self) -> Option<String> {
        self.read_data_line("EEPROM-INFO", SHORT_TIMEOUT)
    }

    /// Momentary-button state, `None` when the read did not complete.
    pub fn read_button(&mut self) -> Option<bool> {
        let line = self.read_data_line("BUTTON-READ", LONG_TIMEOUT)?;
        if line.starts_with("BTN:0") {
            Some(false)
        } else if line.starts_with("BTN:1") {
            Some(true)
        } else {
            None
        }
    }

    /// Write the board serial number and date stamp to EEPROM.
    ///
    /// EEPROM writes are flaky right after power-up, so this retries up to
    /// five attempts one second apart. The retry policy lives here, not in
    /// the console.
    pub fn set_eeprom_info(&mut self, serial_number: u32, date: &str) -> bool {
        let cmd = format!("EEPROM-SET KA1-{serial_number:06} {date}");
        for attempt in 1..=5 {
            if self.console.send_expect_ok(&cmd, SHORT_TIMEOUT) {
                return true;
            }
            log::warn!("EEPROM-SET attempt {attempt} failed");
            if attempt < 5 {
                thread::sleep(Duration::from_secs(1));
            }
        }
        false
    }

    pub fn set_led(&mut self, led: Led, color: LedColor) -> bool {
        let cmd = format!("LED-{}-SET {}", led.as_str(), color.as_str());
        self.console.send_expect_ok(&cmd, SHORT_TIMEOUT)
    }

    /// Run one of the firmware's self-test commands (`EEPROM-TEST`,
    /// `IOX-TEST`, `ATCA-TEST`, `ADC-TEST`, ...).
    pub fn run_test(&mut self, cmd: &str) -> PassFailOutcome {
        self.console.send_expect_pass_fail(cmd, SHORT_TIMEOUT)
    }

    /// Send a command and return the data line above the trailing `OK`,
    /// or `None` for timeout or a malformed response.
    fn read_data_line(&mut self, cmd: &str, timeout: Duration) -> Option<String> {
        let resp = self.console.send(cmd, timeout);
        if resp == FAIL {
            return None;
        }
        let lines: Vec<&str> = resp.split("\r\n").collect();
        match lines[..] {
            [.., data, "OK"] => Some(data.trim().to_string()),
            _ => None,
        }
    }
}

/// Parse a dotted `major.minor.patch` firmware version.
fn parse_version(s: &str) -> Option<(u32, u32, u32)> {
    let mut parts = s.trim().splitn(3, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    Some((major, minor, patch))
}
