//! Serial port transport (RS-232, USB-serial Arduinos, chillers)
//!
//! Wraps a `tokio_serial::SerialStream` with an internal receive buffer so
//! that `read_line` can hand out exactly one line per call and
//! `bytes_available` can report both buffered and not-yet-read bytes.

use super::Transport;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, warn};

/// Serial transport with 8N1 framing and no flow control.
pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
    stream: SerialStream,
    pending: Vec<u8>,
}

impl SerialTransport {
    /// Opens `port_name` at `baud_rate`.
    ///
    /// # Errors
    /// Returns `DaqError::Transport` if the port cannot be opened.
    pub fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> AppResult<Self> {
        let stream = tokio_serial::new(port_name, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                DaqError::Transport(format!(
                    "failed to open serial port '{}' at {} baud: {}",
                    port_name, baud_rate, e
                ))
            })?;

        debug!(port = port_name, baud_rate, "serial port opened");

        Ok(Self {
            port_name: port_name.to_string(),
            baud_rate,
            timeout,
            stream,
            pending: Vec::with_capacity(128),
        })
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=end).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn describe(&self) -> String {
        format!("{}@{}", self.port_name, self.baud_rate)
    }

    async fn write(&mut self, command: &str) -> AppResult<()> {
        self.stream
            .write_all(command.as_bytes())
            .await
            .map_err(|e| DaqError::Transport(format!("write to {} failed: {}", self.port_name, e)))?;
        self.stream
            .flush()
            .await
            .map_err(|e| DaqError::Transport(format!("flush of {} failed: {}", self.port_name, e)))?;

        debug!(port = %self.port_name, command = command.trim_end(), "sent");
        Ok(())
    }

    async fn read_line(&mut self) -> AppResult<String> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut buf = [0u8; 128];

        loop {
            if let Some(line) = self.take_line() {
                debug!(port = %self.port_name, response = line.trim_end(), "received");
                return Ok(line);
            }

            match tokio::time::timeout_at(deadline, self.stream.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    return Err(DaqError::Transport(format!(
                        "unexpected EOF from {}",
                        self.port_name
                    )))
                }
                Ok(Ok(n)) => self.pending.extend_from_slice(&buf[..n]),
                Ok(Err(e)) => {
                    return Err(DaqError::Transport(format!(
                        "read from {} failed: {}",
                        self.port_name, e
                    )))
                }
                Err(_) => {
                    let partial = String::from_utf8_lossy(&self.pending).into_owned();
                    self.pending.clear();
                    warn!(
                        port = %self.port_name,
                        timeout = ?self.timeout,
                        partial = partial.as_str(),
                        "serial read timed out"
                    );
                    return Ok(partial);
                }
            }
        }
    }

    async fn bytes_available(&mut self) -> AppResult<usize> {
        let waiting = self.stream.bytes_to_read().map_err(|e| {
            DaqError::Transport(format!("cannot query {}: {}", self.port_name, e))
        })?;
        Ok(self.pending.len() + waiting as usize)
    }
}

/// Names of the serial ports the OS reports.
pub fn available_ports() -> AppResult<Vec<String>> {
    let ports = serialport::available_ports()
        .map_err(|e| DaqError::Transport(format!("cannot enumerate serial ports: {}", e)))?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
