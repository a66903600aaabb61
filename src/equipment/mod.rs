//! Equipment: one device's polling and control unit.
//!
//! Each device type is a plain struct implementing [`Equipment`]; the
//! frontend owns a registry of boxed equipments and drives them. An
//! equipment never holds on to the host: every call receives the
//! [`HostBus`] it should talk to.
//!
//! # Lifecycle
//!
//! ```text
//! default_settings() seeded ─> connect() ─> watch(watched_paths())
//!                                              │
//!                 ┌────────────── poll() every common().period_ms
//!                 └────────────── on_setting_change() per watched write
//! ```
//!
//! Poll and setting-change calls are never concurrent for one frontend.
//!
//! # Parse-failure policy
//!
//! | equipment   | policy                                           |
//! |-------------|--------------------------------------------------|
//! | arduino     | abort the cycle, no event                        |
//! | ardutable   | report, no event (the stage never emits events)  |
//! | keithley    | abort the cycle, no event                        |
//! | lauda       | per-field NaN sentinel, event still emitted      |
//! | n1081b      | skip the failed section's bank                   |

pub mod arduino;
pub mod ardutable;
pub mod keithley;
pub mod lauda;
pub mod n1081b;

pub use arduino::ArduinoEquipment;
pub use ardutable::{ArdutableEquipment, StageState};
pub use keithley::KeithleyEquipment;
pub use lauda::LaudaEquipment;
pub use n1081b::{CounterModule, N1081BEquipment, Section};

use crate::config::CommonOverrides;
use crate::error::{AppResult, DaqError};
use crate::host::{Event, HostBus, OdbValue, SettingChange};
use crate::transport::{self, Transport, DEFAULT_READ_TIMEOUT};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default event buffer.
pub const SYSTEM_BUFFER: &str = "SYSTEM";

/// Settings every equipment shares with the host (`/Equipment/<name>/Common`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentCommon {
    /// Event ID stamped on every event
    pub event_id: u16,
    /// Trigger mask stamped on every event
    pub trigger_mask: u16,
    /// Destination buffer
    pub buffer: String,
    /// Poll period
    pub period_ms: u64,
    /// Poll also while no run is active
    pub read_always: bool,
    /// Record variables into the host's history
    pub log_history: bool,
}

impl EquipmentCommon {
    /// Periodic equipment on the system buffer, read always, with history.
    pub fn periodic(event_id: u16, period_ms: u64) -> Self {
        Self {
            event_id,
            trigger_mask: 0,
            buffer: SYSTEM_BUFFER.to_string(),
            period_ms,
            read_always: true,
            log_history: true,
        }
    }

    /// Enable or disable history logging.
    pub fn with_log_history(mut self, enabled: bool) -> Self {
        self.log_history = enabled;
        self
    }

    /// Applies configuration overrides.
    pub fn apply(&mut self, overrides: &CommonOverrides) {
        if let Some(event_id) = overrides.event_id {
            self.event_id = event_id;
        }
        if let Some(trigger_mask) = overrides.trigger_mask {
            self.trigger_mask = trigger_mask;
        }
        if let Some(buffer) = &overrides.buffer {
            self.buffer = buffer.clone();
        }
        if let Some(period_ms) = overrides.period_ms {
            self.period_ms = period_ms;
        }
    }

    /// Poll period as a `Duration` (at least 1 ms).
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.max(1))
    }
}

/// `/Equipment/<name>/Settings`
pub fn settings_dir(name: &str) -> String {
    format!("/Equipment/{}/Settings", name)
}

/// `/Equipment/<name>/Variables`
pub fn variables_dir(name: &str) -> String {
    format!("/Equipment/{}/Variables", name)
}

/// A polled device.
#[async_trait]
pub trait Equipment: Send {
    /// Equipment name, unique within the host.
    fn name(&self) -> &str;

    /// Common settings.
    fn common(&self) -> &EquipmentCommon;

    /// Mutable common settings (configuration overrides).
    fn common_mut(&mut self) -> &mut EquipmentCommon;

    /// Settings seeded under [`Equipment::settings_dir`] when absent.
    fn default_settings(&self) -> Vec<(&'static str, OdbValue)>;

    /// Paths to watch once connected. Defaults to the settings directory.
    fn watched_paths(&self) -> Vec<String> {
        vec![self.settings_dir()]
    }

    /// `/Equipment/<name>/Settings`
    fn settings_dir(&self) -> String {
        settings_dir(self.name())
    }

    /// `/Equipment/<name>/Variables`
    fn variables_dir(&self) -> String {
        variables_dir(self.name())
    }

    /// Empty event stamped with this equipment's event ID and trigger mask.
    fn new_event(&self) -> Event {
        let mut event = Event::new();
        event.header.event_id = self.common().event_id;
        event.header.trigger_mask = self.common().trigger_mask;
        event
    }

    /// Opens the device link and reads any initial device state.
    async fn connect(&mut self, host: &dyn HostBus) -> AppResult<()>;

    /// One poll cycle. `Ok(None)` means nothing to publish this time.
    async fn poll(&mut self, host: &dyn HostBus) -> AppResult<Option<Event>>;

    /// Reacts to a write on a watched path.
    ///
    /// The default reports the change to the operator and does nothing else.
    async fn on_setting_change(
        &mut self,
        host: &dyn HostBus,
        change: &SettingChange,
    ) -> AppResult<()> {
        report_change(host, change);
        Ok(())
    }
}

/// Tells the operator about a change the equipment does not act on.
pub(crate) fn report_change(host: &dyn HostBus, change: &SettingChange) {
    host.msg(
        &format!("Low-level: {} is now {}", change.path, change.value),
        false,
    );
}

/// Reads a string setting.
pub(crate) fn setting_str(host: &dyn HostBus, dir: &str, key: &str) -> AppResult<String> {
    let path = format!("{}/{}", dir, key);
    match host.odb_get(&path) {
        Some(OdbValue::String(value)) if !value.is_empty() => Ok(value),
        Some(other) => Err(DaqError::InvalidSetting {
            path,
            reason: format!("expected a non-empty string, found {:?}", other),
        }),
        None => Err(DaqError::InvalidSetting {
            path,
            reason: "missing".to_string(),
        }),
    }
}

/// Reads a numeric setting.
pub(crate) fn setting_f64(host: &dyn HostBus, dir: &str, key: &str) -> AppResult<f64> {
    let path = format!("{}/{}", dir, key);
    host.odb_get_f64(&path).ok_or_else(|| DaqError::InvalidSetting {
        path,
        reason: "expected a number".to_string(),
    })
}

/// Opens the serial port named by the `Serial Port` / `Serial Speed` settings.
pub(crate) fn open_serial_from_settings(
    host: &dyn HostBus,
    dir: &str,
) -> AppResult<Box<dyn Transport>> {
    let port = setting_str(host, dir, "Serial Port")?;
    let baud = setting_f64(host, dir, "Serial Speed")?;
    if !(baud > 0.0 && baud <= f64::from(u32::MAX)) {
        return Err(DaqError::InvalidSetting {
            path: format!("{}/Serial Speed", dir),
            reason: format!("{} is not a valid baud rate", baud),
        });
    }
    transport::open_serial(&port, baud as u32, DEFAULT_READ_TIMEOUT)
}

/// Prefixes a transport failure with what was being attempted.
pub(crate) fn with_context(err: DaqError, context: &str) -> DaqError {
    match err {
        DaqError::Transport(message) => DaqError::Transport(format!("{}: {}", context, message)),
        other => other,
    }
}

/// The open link, or `NotConnected`.
pub(crate) fn link(
    transport: &mut Option<Box<dyn Transport>>,
) -> AppResult<&mut Box<dyn Transport>> {
    transport.as_mut().ok_or(DaqError::NotConnected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::LocalHost;

    #[test]
    fn overrides_replace_only_given_fields() {
        let mut common = EquipmentCommon::periodic(500, 60_000);
        common.apply(&CommonOverrides {
            period_ms: Some(5_000),
            buffer: Some("BUF1".into()),
            ..CommonOverrides::default()
        });
        assert_eq!(common.event_id, 500);
        assert_eq!(common.period_ms, 5_000);
        assert_eq!(common.buffer, "BUF1");
        assert_eq!(common.period(), Duration::from_secs(5));
    }

    #[test]
    fn settings_helpers_report_paths() {
        let (host, _rx) = LocalHost::in_memory();
        let dir = settings_dir("Dev");
        host.odb_set("/Equipment/Dev/Settings/Serial Port", "".into())
            .unwrap();
        host.odb_set("/Equipment/Dev/Settings/Serial Speed", 0i64.into())
            .unwrap();

        let err = setting_str(&host, &dir, "Serial Port").unwrap_err();
        assert!(err.to_string().contains("Serial Port"));
        assert!(setting_f64(&host, &dir, "Missing").is_err());
        assert!(open_serial_from_settings(&host, &dir).is_err());
    }
}
