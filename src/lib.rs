//! # Aquarian bench-test tooling
//!
//! Host-side factory test tooling for the Aquarian board. The DUT runs a
//! board-test firmware exposing a line-oriented command console over
//! serial; this crate drives tests by issuing commands and parsing the
//! prompt-framed responses, and monitors the bench fixture's digital
//! signals through a polled GPIO expander.
//!
//! ## Layers
//!
//! - [`transport`]: the duplex byte stream to the DUT, with short bounded
//!   reads. Only failure to *open* a transport is fatal.
//! - [`console`]: request/response framing with timeout and
//!   resynchronization. Timeouts and empty responses both surface as the
//!   [`console::FAIL`] sentinel.
//! - [`gpio`]: polling monitor that normalizes active-high/active-low
//!   wiring into logical levels and dispatches edge callbacks.
//! - [`fault`]: one-way latch for unrecoverable fixture I/O failure.
//! - [`board`]: per-session object wrapping the console with the
//!   firmware's typed command set.
//!
//! ## Example
//!
//! ```rust,no_run
//! use aquarian_bench::{Board, MIN_FIRMWARE_VERSION};
//!
//! let mut board = Board::open("/dev/ttyUSB0", 115_200)?;
//! let version = board.require_version(MIN_FIRMWARE_VERSION)?;
//! println!("Test firmware version: {version}");
//! assert!(board.run_test("EEPROM-TEST").passed());
//! # Ok::<(), aquarian_bench::BoardError>(())
//! ```

pub mod board;
pub mod config;
pub mod console;
pub mod fault;
pub mod gpio;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use board::{Board, BoardError, Led, LedColor, MIN_FIRMWARE_VERSION};
pub use config::{BenchConfig, ConfigError};
pub use console::{Console, PassFailOutcome, FAIL, PROMPT};
pub use fault::FaultLatch;
pub use gpio::{ActiveState, ChannelConfig, GpioError, GpioMonitor, GpioPort};
pub use transport::{SerialTransport, Transport, TransportError};
