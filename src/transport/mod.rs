//! Device transports
//!
//! A transport is the exclusively owned link between one equipment and its
//! device: a serial port, a VISA session or a scripted mock. Commands are
//! written verbatim (the device vocabulary carries its own terminators, e.g.
//! `IN_PV_00\r\n`) and replies are read one line at a time.
//!
//! Reads are always bounded by the transport timeout. When the timeout
//! expires, `read_line` returns whatever arrived so far (often the empty
//! string) instead of an error; the caller's parser then rejects it like any
//! other malformed reply.

use crate::error::AppResult;
use async_trait::async_trait;
use std::time::Duration;

pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial;
#[cfg(feature = "instrument_visa")]
pub mod visa;

pub use mock::MockTransport;

/// Default bound on a single line read.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(2000);

/// Line-oriented link to a device.
#[async_trait]
pub trait Transport: Send {
    /// Human readable endpoint, for log messages.
    fn describe(&self) -> String;

    /// Writes a command exactly as given.
    async fn write(&mut self, command: &str) -> AppResult<()>;

    /// Reads one line including its terminator.
    ///
    /// On timeout returns the partial line received so far.
    async fn read_line(&mut self) -> AppResult<String>;

    /// Number of bytes already received and not yet consumed.
    async fn bytes_available(&mut self) -> AppResult<usize>;

    /// Writes a command and reads exactly one reply line.
    async fn query(&mut self, command: &str) -> AppResult<String> {
        self.write(command).await?;
        self.read_line().await
    }
}

/// Opens a serial port transport.
///
/// # Errors
/// `DaqError::Transport` if the port cannot be opened, or
/// `DaqError::FeatureNotEnabled` when built without `instrument_serial`.
#[cfg(feature = "instrument_serial")]
pub fn open_serial(
    port: &str,
    baud_rate: u32,
    timeout: Duration,
) -> AppResult<Box<dyn Transport>> {
    Ok(Box::new(serial::SerialTransport::open(port, baud_rate, timeout)?))
}

#[cfg(not(feature = "instrument_serial"))]
pub fn open_serial(
    _port: &str,
    _baud_rate: u32,
    _timeout: Duration,
) -> AppResult<Box<dyn Transport>> {
    Err(crate::error::DaqError::FeatureNotEnabled(
        "instrument_serial".to_string(),
    ))
}

/// Opens a VISA session transport.
///
/// # Errors
/// `DaqError::Transport` if the resource cannot be opened, or
/// `DaqError::FeatureNotEnabled` when built without `instrument_visa`.
#[cfg(feature = "instrument_visa")]
pub fn open_visa(resource: &str, timeout: Duration) -> AppResult<Box<dyn Transport>> {
    Ok(Box::new(visa::VisaTransport::open(resource, timeout)?))
}

#[cfg(not(feature = "instrument_visa"))]
pub fn open_visa(_resource: &str, _timeout: Duration) -> AppResult<Box<dyn Transport>> {
    Err(crate::error::DaqError::FeatureNotEnabled(
        "instrument_visa".to_string(),
    ))
}

/// Lists serial ports known to the operating system.
#[cfg(feature = "instrument_serial")]
pub fn available_ports() -> AppResult<Vec<String>> {
    serial::available_ports()
}

#[cfg(not(feature = "instrument_serial"))]
pub fn available_ports() -> AppResult<Vec<String>> {
    Err(crate::error::DaqError::FeatureNotEnabled(
        "instrument_serial".to_string(),
    ))
}
