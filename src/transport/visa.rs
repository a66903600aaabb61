//! VISA transport for GPIB/USB/Ethernet instruments
//!
//! The `visa-rs` session is synchronous, so every exchange runs on Tokio's
//! blocking pool with the session behind an `Arc<Mutex>`.
//!
//! Supports resource strings like:
//! - "GPIB0::24::INSTR" (GPIB interface)
//! - "USB0::0x05E6::0x2450::04096331::INSTR" (USB-TMC)
//! - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)

use super::Transport;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::ffi::CString;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use visa_rs::prelude::*;

/// VISA session transport.
pub struct VisaTransport {
    resource: String,
    timeout: Duration,
    instrument: Arc<Mutex<Instrument>>,
    // Keeps the resource manager (and with it the session) alive.
    _rm: DefaultRM,
}

impl VisaTransport {
    /// Opens a VISA resource.
    ///
    /// # Errors
    /// Returns `DaqError::Transport` if the resource manager or the session
    /// cannot be opened.
    pub fn open(resource: &str, timeout: Duration) -> AppResult<Self> {
        let rm = DefaultRM::new()
            .map_err(|e| DaqError::Transport(format!("VISA resource manager unavailable: {}", e)))?;
        let name = CString::new(resource)
            .map_err(|_| DaqError::Transport(format!("invalid VISA resource '{}'", resource)))?;
        let instrument = rm
            .open(&name.into(), AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
            .map_err(|e| DaqError::Transport(format!("failed to open '{}': {}", resource, e)))?;

        debug!(resource, "VISA session opened");

        Ok(Self {
            resource: resource.to_string(),
            timeout,
            instrument: Arc::new(Mutex::new(instrument)),
            _rm: rm,
        })
    }
}

#[async_trait]
impl Transport for VisaTransport {
    fn describe(&self) -> String {
        self.resource.clone()
    }

    async fn write(&mut self, command: &str) -> AppResult<()> {
        let instrument = self.instrument.clone();
        let bytes = command.as_bytes().to_vec();
        let resource = self.resource.clone();

        tokio::task::spawn_blocking(move || {
            let guard = instrument.blocking_lock();
            (&*guard)
                .write_all(&bytes)
                .map_err(|e| DaqError::Transport(format!("VISA write to {} failed: {}", resource, e)))
        })
        .await
        .map_err(|e| DaqError::Transport(format!("VISA I/O task failed: {}", e)))??;

        debug!(resource = %self.resource, command = command.trim_end(), "sent");
        Ok(())
    }

    async fn read_line(&mut self) -> AppResult<String> {
        let instrument = self.instrument.clone();
        let timeout = self.timeout;
        let resource = self.resource.clone();

        let line = tokio::task::spawn_blocking(move || -> AppResult<String> {
            let guard = instrument.blocking_lock();
            let start = std::time::Instant::now();
            let mut line = Vec::new();
            let mut byte = [0u8; 1];

            while start.elapsed() < timeout {
                match (&*guard).read(&mut byte) {
                    Ok(1) => {
                        line.push(byte[0]);
                        if byte[0] == b'\n' {
                            break;
                        }
                    }
                    Ok(_) => break,
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => {
                        return Err(DaqError::Transport(format!(
                            "VISA read from {} failed: {}",
                            resource, e
                        )))
                    }
                }
            }
            Ok(String::from_utf8_lossy(&line).into_owned())
        })
        .await
        .map_err(|e| DaqError::Transport(format!("VISA I/O task failed: {}", e)))??;

        debug!(resource = %self.resource, response = line.trim_end(), "received");
        Ok(line)
    }

    async fn bytes_available(&mut self) -> AppResult<usize> {
        // VISA has no cheap "bytes waiting" query; callers poll with query().
        Ok(0)
    }
}
