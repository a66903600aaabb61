//! Current-voltage sweeps through the host configuration tree.
//!
//! The sweep never talks to hardware directly. It drives a high-voltage
//! channel by writing its demand and power keys and reads the measured
//! voltage and current back from the keys the HV frontend publishes, so it
//! works with any frontend that exposes per-channel arrays.
//!
//! Results are stored as plain `voltage current` lines, one point per line.

use crate::error::{AppResult, DaqError};
use crate::host::{HostBus, OdbValue};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Most points a single sweep may take.
pub const MAX_SWEEP_POINTS: usize = 10_000;

/// Sweep parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IvSweepConfig {
    /// Demand voltage array key
    #[serde(default = "default_voltage_path")]
    pub voltage_path: String,
    /// Channel power switch array key
    #[serde(default = "default_power_path")]
    pub power_path: String,
    /// Measured voltage array key
    #[serde(default = "default_voltage_readback")]
    pub voltage_readback: String,
    /// Measured current array key
    #[serde(default = "default_current_readback")]
    pub current_readback: String,
    /// First demand voltage (V)
    #[serde(default = "default_start")]
    pub start: f64,
    /// Sweep stops before reaching this voltage (V)
    #[serde(default = "default_end")]
    pub end: f64,
    /// Voltage increment (V)
    #[serde(default = "default_step")]
    pub step: f64,
    /// Wait after every voltage change (ms)
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// HV channel (array element)
    #[serde(default)]
    pub channel: usize,
}

impl Default for IvSweepConfig {
    fn default() -> Self {
        Self {
            voltage_path: default_voltage_path(),
            power_path: default_power_path(),
            voltage_readback: default_voltage_readback(),
            current_readback: default_current_readback(),
            start: default_start(),
            end: default_end(),
            step: default_step(),
            settle_ms: default_settle_ms(),
            channel: 0,
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_voltage_path() -> String {
    "/Equipment/caen_hv/Settings/Slot 0/VSet (V)".to_string()
}

fn default_power_path() -> String {
    "/Equipment/caen_hv/Settings/Slot 0/Pw".to_string()
}

fn default_voltage_readback() -> String {
    "/Equipment/caen_hv/Variables/VM00".to_string()
}

fn default_current_readback() -> String {
    "/Equipment/caen_hv/Variables/IM00".to_string()
}

fn default_start() -> f64 {
    30.0
}

fn default_end() -> f64 {
    35.0
}

fn default_step() -> f64 {
    0.25
}

fn default_settle_ms() -> u64 {
    10_000
}

impl IvSweepConfig {
    /// Rejects sweeps that would never take a point or never end.
    ///
    /// # Errors
    ///
    /// Returns `DaqError::Configuration` for a non-positive step or an
    /// empty range.
    pub fn validate(&self) -> AppResult<()> {
        if !(self.step.is_finite() && self.step > 0.0) {
            return Err(DaqError::Configuration(format!(
                "iv_sweep.step must be > 0, got {}",
                self.step
            )));
        }
        if !(self.start.is_finite() && self.end.is_finite() && self.end > self.start) {
            return Err(DaqError::Configuration(format!(
                "iv_sweep range [{}, {}) is empty",
                self.start, self.end
            )));
        }
        let points = ((self.end - self.start) / self.step).ceil();
        if points > MAX_SWEEP_POINTS as f64 {
            return Err(DaqError::Configuration(format!(
                "iv_sweep would take {} points, the limit is {}",
                points, MAX_SWEEP_POINTS
            )));
        }
        Ok(())
    }

    /// Demand voltages in sweep order.
    pub fn voltages(&self) -> Vec<f64> {
        let mut voltages = Vec::new();
        if self.validate().is_err() {
            return voltages;
        }
        let mut i = 0u32;
        while voltages.len() < MAX_SWEEP_POINTS {
            let voltage = self.start + f64::from(i) * self.step;
            if voltage >= self.end {
                break;
            }
            voltages.push(voltage);
            i += 1;
        }
        voltages
    }

    fn element(&self, path: &str) -> String {
        format!("{}[{}]", path, self.channel)
    }

    fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// One measured point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IvPoint {
    /// Measured voltage
    pub voltage: f64,
    /// Measured current
    pub current: f64,
}

/// Runs a sweep and returns the measured points.
///
/// The channel is always returned to the start voltage and switched off
/// afterwards, also when a step fails.
///
/// # Errors
///
/// Returns the first failed write or missing read-back, after the channel
/// has been shut down.
pub async fn run_sweep(host: &dyn HostBus, config: &IvSweepConfig) -> AppResult<Vec<IvPoint>> {
    config.validate()?;
    let voltage_key = config.element(&config.voltage_path);
    let power_key = config.element(&config.power_path);

    info!(channel = config.channel, start = config.start, end = config.end, "starting I-V sweep");
    let result = sweep_points(host, config, &voltage_key, &power_key).await;

    let reset = host.odb_set(&voltage_key, OdbValue::Float(config.start));
    let off = host.odb_set(&power_key, OdbValue::Bool(false));
    if let Err(e) = &off {
        host.msg(&format!("I-V sweep could not switch off channel {}: {}", config.channel, e), true);
    }

    let points = result?;
    reset?;
    off?;
    info!(points = points.len(), "I-V sweep finished");
    Ok(points)
}

async fn sweep_points(
    host: &dyn HostBus,
    config: &IvSweepConfig,
    voltage_key: &str,
    power_key: &str,
) -> AppResult<Vec<IvPoint>> {
    host.odb_set(voltage_key, OdbValue::Float(config.start))?;
    host.odb_set(power_key, OdbValue::Bool(true))?;
    tokio::time::sleep(config.settle()).await;

    let voltage_readback = config.element(&config.voltage_readback);
    let current_readback = config.element(&config.current_readback);
    let mut points = Vec::new();
    for demand in config.voltages() {
        host.odb_set(voltage_key, OdbValue::Float(demand))?;
        tokio::time::sleep(config.settle()).await;

        let point = IvPoint {
            voltage: readback(host, &voltage_readback)?,
            current: readback(host, &current_readback)?,
        };
        info!(demand, voltage = point.voltage, current = point.current, "I-V point");
        points.push(point);
    }
    Ok(points)
}

fn readback(host: &dyn HostBus, path: &str) -> AppResult<f64> {
    host.odb_get_f64(path)
        .ok_or_else(|| DaqError::Host(format!("no numeric read-back at {}", path)))
}

// ============================================================================
// I-V tables
// ============================================================================

/// Writes `points` as `voltage current` lines.
pub fn write_iv_table<P: AsRef<Path>>(path: P, points: &[IvPoint]) -> AppResult<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(path)?;
    for point in points {
        writeln!(file, "{} {}", point.voltage, point.current)?;
    }
    file.flush()?;
    Ok(())
}

/// Reads a table written by [`write_iv_table`] (or by hand).
///
/// Blank lines are skipped.
///
/// # Errors
///
/// Returns `DaqError::Configuration` naming the first malformed line.
pub fn read_iv_table<P: AsRef<Path>>(path: P) -> AppResult<Vec<IvPoint>> {
    let text = fs::read_to_string(path.as_ref())?;
    parse_iv_table(&text)
}

fn parse_iv_table(text: &str) -> AppResult<Vec<IvPoint>> {
    let mut points = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let point = match fields.as_slice() {
            [] => continue,
            [voltage, current] => match (voltage.parse(), current.parse()) {
                (Ok(voltage), Ok(current)) => IvPoint { voltage, current },
                _ => return Err(malformed(number + 1, line)),
            },
            _ => return Err(malformed(number + 1, line)),
        };
        points.push(point);
    }
    if points.is_empty() {
        warn!("I-V table holds no points");
    }
    Ok(points)
}

fn malformed(line_number: usize, line: &str) -> DaqError {
    DaqError::Configuration(format!(
        "I-V table line {}: expected 'voltage current', got {:?}",
        line_number, line
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::LocalHost;

    fn quick() -> IvSweepConfig {
        IvSweepConfig {
            start: 30.0,
            end: 31.0,
            step: 0.25,
            settle_ms: 10_000,
            channel: 2,
            ..IvSweepConfig::default()
        }
    }

    #[test]
    fn voltages_stop_before_end() {
        assert_eq!(quick().voltages(), [30.0, 30.25, 30.5, 30.75]);
        assert_eq!(IvSweepConfig::default().voltages().len(), 20);
    }

    #[test]
    fn empty_ranges_are_rejected() {
        let backwards = IvSweepConfig {
            end: 20.0,
            ..IvSweepConfig::default()
        };
        assert!(backwards.validate().is_err());
        assert!(backwards.voltages().is_empty());

        let stalled = IvSweepConfig {
            step: 0.0,
            ..IvSweepConfig::default()
        };
        assert!(stalled.validate().is_err());
    }

    #[test]
    fn oversized_sweeps_are_rejected() {
        let creeping = IvSweepConfig {
            step: 1e-10,
            ..IvSweepConfig::default()
        };
        assert!(creeping.validate().is_err());
        assert!(creeping.voltages().is_empty());

        let widest = IvSweepConfig {
            start: 0.0,
            end: MAX_SWEEP_POINTS as f64,
            step: 1.0,
            ..IvSweepConfig::default()
        };
        assert!(widest.validate().is_ok());
        assert_eq!(widest.voltages().len(), MAX_SWEEP_POINTS);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_reads_points_and_powers_off() {
        let (host, _rx) = LocalHost::in_memory();
        host.odb_set("/Equipment/caen_hv/Variables/VM00", vec![0.0, 0.0, 29.9].into())
            .unwrap();
        host.odb_set("/Equipment/caen_hv/Variables/IM00", vec![0.0, 0.0, 0.012].into())
            .unwrap();

        let started = tokio::time::Instant::now();
        let points = run_sweep(&host, &quick()).await.unwrap();

        // One settle after power-on plus one per point.
        assert_eq!(started.elapsed(), Duration::from_secs(50));
        assert_eq!(points.len(), 4);
        assert_eq!(points[0], IvPoint { voltage: 29.9, current: 0.012 });
        assert_eq!(
            host.odb_get_f64("/Equipment/caen_hv/Settings/Slot 0/VSet (V)[2]"),
            Some(30.0)
        );
        assert_eq!(
            host.odb_get_bool("/Equipment/caen_hv/Settings/Slot 0/Pw[2]"),
            Some(false)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_readback_still_powers_off() {
        let (host, _rx) = LocalHost::in_memory();
        let err = run_sweep(&host, &quick()).await.unwrap_err();
        assert!(err.to_string().contains("VM00[2]"));
        assert_eq!(
            host.odb_get_bool("/Equipment/caen_hv/Settings/Slot 0/Pw[2]"),
            Some(false)
        );
    }

    #[test]
    fn table_written_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs").join("iv.txt");
        let points = vec![
            IvPoint { voltage: 30.0, current: 0.5 },
            IvPoint { voltage: 30.25, current: 1.75 },
        ];
        write_iv_table(&path, &points).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "30 0.5\n30.25 1.75\n");
        assert_eq!(read_iv_table(&path).unwrap(), points);
    }

    #[test]
    fn malformed_line_is_reported_with_its_number() {
        let err = parse_iv_table("30 0.5\n\n30.25\n").unwrap_err();
        assert!(err.to_string().contains("line 3"));

        let err = parse_iv_table("30 abc\n").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }
}
