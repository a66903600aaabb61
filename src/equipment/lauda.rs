//! Lauda chiller.
//!
//! Plain-text protocol, one `\r\n` terminated command per line, one reply
//! line each:
//!
//! | command            | reply                  |
//! |--------------------|------------------------|
//! | `IN_PV_00`         | bath temperature       |
//! | `STATUS`           | status code            |
//! | `IN_SP_00`         | setpoint               |
//! | `IN_MODE_02`       | 0 = cooling on, 1 = off|
//! | `OUT_SP_00_XXX.XX` | `OK`                   |
//! | `START` / `STOP`   | `OK`                   |
//!
//! A failed read only blanks its own field (NaN), the event is still
//! published. With `Settings/Feedback` enabled, every cycle runs a PID step
//! on the temperature found at `Settings/Feedback Source` and writes the
//! corrected setpoint back to `Settings/SetPoint`, which in turn is sent to
//! the chiller through the normal settings-change path.

use super::{link, open_serial_from_settings, with_context, Equipment, EquipmentCommon};
use crate::error::{AppResult, DaqError};
use crate::host::{Event, HostBus, OdbValue, SettingChange};
use crate::parser::parse_number;
use crate::pid::Pid;
use crate::transport::Transport;
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Equipment name registered with the host.
pub const EQUIPMENT_NAME: &str = "LaudaEquipment";

/// Highest setpoint the `OUT_SP_00` command can express.
pub const MAX_SETPOINT: f64 = 999.99;

const READ_BATH: &str = "IN_PV_00\r\n";
const READ_STATUS: &str = "STATUS\r\n";
const READ_SETPOINT: &str = "IN_SP_00\r\n";
const READ_MODE: &str = "IN_MODE_02\r\n";
const START: &str = "START\r\n";
const STOP: &str = "STOP\r\n";

const DEFAULT_SETPOINT: f64 = 20.0;
const DEFAULT_FEEDBACK_SOURCE: &str = "/Equipment/ArduinoEquipment/Variables/ARD0[0]";
const DEFAULT_KP: f64 = 0.2;
const DEFAULT_KI: f64 = 0.0;
const DEFAULT_KD: f64 = 50.0;
const DEFAULT_LIMIT: f64 = 6.0;

/// `OUT_SP_00_XXX.XX\r\n` for `setpoint`, zero padded.
///
/// # Errors
/// `DaqError::InvalidSetting` outside `0..=999.99` or for non-finite values.
pub fn setpoint_command(setpoint: f64) -> AppResult<String> {
    let rounded = (setpoint * 100.0).round() / 100.0;
    if !rounded.is_finite() || !(0.0..=MAX_SETPOINT).contains(&rounded) {
        return Err(DaqError::InvalidSetting {
            path: format!("/Equipment/{}/Settings/SetPoint", EQUIPMENT_NAME),
            reason: format!("{} is outside 0..={}", setpoint, MAX_SETPOINT),
        });
    }
    Ok(format!("OUT_SP_00_{:06.2}\r\n", rounded))
}

/// Chiller equipment.
pub struct LaudaEquipment {
    common: EquipmentCommon,
    transport: Option<Box<dyn Transport>>,
    pid: Option<Pid>,
}

impl LaudaEquipment {
    /// Equipment that opens its serial port from the settings on connect.
    pub fn new() -> Self {
        Self {
            common: EquipmentCommon::periodic(501, 60_000),
            transport: None,
            pid: None,
        }
    }

    /// Uses `transport` instead of opening a serial port.
    pub fn with_transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// The active feedback controller, if feedback ran this session.
    pub fn controller(&self) -> Option<&Pid> {
        self.pid.as_ref()
    }

    fn setting(&self, key: &str) -> String {
        format!("{}/{}", self.settings_dir(), key)
    }

    async fn read_value(&mut self, command: &str) -> AppResult<f64> {
        let reply = link(&mut self.transport)?
            .query(command)
            .await
            .map_err(|e| with_context(e, command.trim_end()))?;
        parse_number(&reply)
    }

    /// Reads one field, substituting NaN (and telling the operator) on failure.
    async fn read_field(
        &mut self,
        host: &dyn HostBus,
        command: &str,
        what: &str,
        last_error: &mut Option<DaqError>,
    ) -> f64 {
        match self.read_value(command).await {
            Ok(value) => value,
            Err(e) => {
                host.msg(&format!("Error reading {}: {}", what, e), true);
                *last_error = Some(e);
                f64::NAN
            }
        }
    }

    async fn acknowledged(&mut self, command: &str, what: &str) -> AppResult<()> {
        let transport = link(&mut self.transport)?;
        let reply = transport
            .query(command)
            .await
            .map_err(|e| with_context(e, &format!("writing {}", what)))?;
        if !reply.starts_with("OK") {
            return Err(DaqError::Parse {
                response: reply,
                template: "OK".to_string(),
            });
        }
        debug!(equipment = EQUIPMENT_NAME, command = command.trim_end(), "acknowledged");
        Ok(())
    }

    /// PID correction for this cycle, or `None` when feedback cannot run.
    fn feedback_step(&mut self, host: &dyn HostBus) -> Option<f64> {
        let number = |key: &str, default: f64| host.odb_get_f64(&self.setting(key)).unwrap_or(default);

        let target = number("Demand Feedback", DEFAULT_SETPOINT);
        let (kp, ki, kd) = (
            number("Feedback Kp", DEFAULT_KP),
            number("Feedback Ki", DEFAULT_KI),
            number("Feedback Kd", DEFAULT_KD),
        );
        let limit = number("Feedback Limit", DEFAULT_LIMIT).abs();
        let source = host
            .odb_get(&self.setting("Feedback Source"))
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| DEFAULT_FEEDBACK_SOURCE.to_string());

        let Some(input) = host.odb_get_f64(&source).filter(|v| v.is_finite()) else {
            host.msg(
                &format!("Feedback source {} has no valid reading", source),
                true,
            );
            return None;
        };

        let reusable = self.pid.as_ref().is_some_and(|pid| {
            pid.gains() == (kp, ki, kd) && pid.limits() == (-limit, limit) && pid.target() == target
        });
        if !reusable {
            debug!(equipment = EQUIPMENT_NAME, kp, ki, kd, limit, target, "feedback controller reset");
            self.pid = Some(Pid::new(kp, ki, kd, target).with_symmetric_limit(limit));
        }

        let dt = self.common.period().as_secs_f64();
        let output = self.pid.as_mut().map(|pid| pid.update(input, dt))?;
        debug!(equipment = EQUIPMENT_NAME, input, target, output, "feedback step");
        Some(output)
    }
}

impl Default for LaudaEquipment {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Equipment for LaudaEquipment {
    fn name(&self) -> &str {
        EQUIPMENT_NAME
    }

    fn common(&self) -> &EquipmentCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut EquipmentCommon {
        &mut self.common
    }

    fn default_settings(&self) -> Vec<(&'static str, OdbValue)> {
        vec![
            ("Serial Port", "/dev/ttyUSB0".into()),
            ("Serial Speed", OdbValue::Int(9_600)),
            (
                "Names LAU0",
                vec!["Bath Temperature", "Status", "Cooling state", "SetPoint Temperature"].into(),
            ),
            ("Unit LAU0", vec!["C", "", "", "C"].into()),
            ("SetPoint", DEFAULT_SETPOINT.into()),
            ("Cooling", true.into()),
            ("Feedback", false.into()),
            ("Demand Feedback", DEFAULT_SETPOINT.into()),
            ("Feedback Source", DEFAULT_FEEDBACK_SOURCE.into()),
            ("Feedback Kp", DEFAULT_KP.into()),
            ("Feedback Ki", DEFAULT_KI.into()),
            ("Feedback Kd", DEFAULT_KD.into()),
            ("Feedback Limit", DEFAULT_LIMIT.into()),
        ]
    }

    async fn connect(&mut self, host: &dyn HostBus) -> AppResult<()> {
        if self.transport.is_none() {
            self.transport = Some(open_serial_from_settings(host, &self.settings_dir())?);
        }

        let setpoint = match self.read_value(READ_SETPOINT).await {
            Ok(value) => value,
            Err(e) => {
                host.msg(&format!("Error reading initial setpoint: {}", e), true);
                DEFAULT_SETPOINT
            }
        };
        let cooling = match self.read_value(READ_MODE).await {
            Ok(mode) => 1.0 - mode,
            Err(e) => {
                host.msg(&format!("Error reading initial cooling state: {}", e), true);
                0.0
            }
        };

        host.odb_set(&self.setting("SetPoint"), OdbValue::Float(setpoint))?;
        host.odb_set(&self.setting("Cooling"), OdbValue::Bool(cooling != 0.0))?;

        info!(equipment = EQUIPMENT_NAME, setpoint, cooling, "connected");
        Ok(())
    }

    async fn poll(&mut self, host: &dyn HostBus) -> AppResult<Option<Event>> {
        let mut last_error = None;
        let bath = self
            .read_field(host, READ_BATH, "bath temperature", &mut last_error)
            .await;
        let status = self
            .read_field(host, READ_STATUS, "chiller status", &mut last_error)
            .await;
        let mut setpoint = self
            .read_field(host, READ_SETPOINT, "setpoint", &mut last_error)
            .await;
        let cooling = self
            .read_field(host, READ_MODE, "cooling state", &mut last_error)
            .await;

        // Nothing answered at all: the link is gone, not just one reply.
        if [bath, status, setpoint, cooling].iter().all(|v| v.is_nan()) {
            if let Some(e) = last_error.filter(DaqError::is_transport) {
                return Err(e);
            }
        }

        if host.odb_get_bool(&self.setting("Feedback")).unwrap_or(false) {
            if setpoint.is_nan() {
                host.msg("Feedback skipped, setpoint unknown", true);
            } else if let Some(correction) = self.feedback_step(host) {
                setpoint += correction;
                host.odb_set(&self.setting("SetPoint"), OdbValue::Float(setpoint))?;
            }
        } else if self.pid.take().is_some() {
            debug!(equipment = EQUIPMENT_NAME, "feedback disabled");
        }

        let mut event = self.new_event();
        event.create_bank("LAU0", vec![bath, status, cooling, setpoint])?;
        Ok(Some(event))
    }

    async fn on_setting_change(
        &mut self,
        _host: &dyn HostBus,
        change: &SettingChange,
    ) -> AppResult<()> {
        if change.path == self.setting("SetPoint") {
            let value = change.value.as_f64().ok_or_else(|| DaqError::InvalidSetting {
                path: change.path.clone(),
                reason: format!("{} is not a temperature", change.value),
            })?;
            let command = setpoint_command(value)?;
            self.acknowledged(&command, "setpoint").await?;
            info!(equipment = EQUIPMENT_NAME, setpoint = value, "setpoint sent");
        } else if change.path == self.setting("Cooling") {
            let on = change.value.as_bool().ok_or_else(|| DaqError::InvalidSetting {
                path: change.path.clone(),
                reason: format!("{} is not a cooling state", change.value),
            })?;
            let command = if on { START } else { STOP };
            self.acknowledged(command, "cooling state").await?;
            info!(equipment = EQUIPMENT_NAME, cooling = on, "cooling state sent");
        } else {
            debug!(equipment = EQUIPMENT_NAME, path = %change.path, "setting changed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::LocalHost;
    use crate::transport::MockTransport;

    const SETTINGS: &str = "/Equipment/LaudaEquipment/Settings";

    fn script(mock: &MockTransport) {
        mock.respond(READ_BATH, "21.30\r\n")
            .respond(READ_STATUS, "0\r\n")
            .respond(READ_SETPOINT, "18.00\r\n")
            .respond(READ_MODE, "0\r\n");
    }

    async fn chiller(mock: &MockTransport, host: &LocalHost) -> LaudaEquipment {
        let mut equipment = LaudaEquipment::new().with_transport(Box::new(mock.clone()));
        for (key, value) in equipment.default_settings() {
            host.odb_set(&format!("{}/{}", SETTINGS, key), value).unwrap();
        }
        equipment.connect(host).await.unwrap();
        equipment
    }

    #[test]
    fn setpoint_commands_are_zero_padded() {
        assert_eq!(setpoint_command(5.5).unwrap(), "OUT_SP_00_005.50\r\n");
        assert_eq!(setpoint_command(20.0).unwrap(), "OUT_SP_00_020.00\r\n");
        assert_eq!(setpoint_command(123.456).unwrap(), "OUT_SP_00_123.46\r\n");
        assert!(setpoint_command(-1.0).is_err());
        assert!(setpoint_command(1000.0).is_err());
        assert!(setpoint_command(f64::NAN).is_err());
    }

    #[tokio::test]
    async fn connect_reads_initial_state() {
        let mock = MockTransport::new("lauda");
        script(&mock);
        let (host, _rx) = LocalHost::in_memory();
        chiller(&mock, &host).await;

        assert_eq!(host.odb_get_f64(&format!("{}/SetPoint", SETTINGS)), Some(18.0));
        assert_eq!(host.odb_get_bool(&format!("{}/Cooling", SETTINGS)), Some(true));
    }

    #[tokio::test]
    async fn connect_falls_back_on_silence() {
        let mock = MockTransport::new("lauda");
        let (host, _rx) = LocalHost::in_memory();
        chiller(&mock, &host).await;

        assert_eq!(host.odb_get_f64(&format!("{}/SetPoint", SETTINGS)), Some(20.0));
        assert_eq!(host.odb_get_bool(&format!("{}/Cooling", SETTINGS)), Some(false));
        assert_eq!(host.errors().len(), 2);
    }

    #[tokio::test]
    async fn repeated_polls_give_identical_banks() {
        let mock = MockTransport::new("lauda");
        script(&mock);
        let (host, _rx) = LocalHost::in_memory();
        let mut equipment = chiller(&mock, &host).await;
        mock.clear_written();

        let first = equipment.poll(&host).await.unwrap().unwrap();
        let second = equipment.poll(&host).await.unwrap().unwrap();
        assert_eq!(first.banks(), second.banks());
        assert_eq!(first.header.event_id, second.header.event_id);
        // Without feedback a cycle only reads.
        let written = mock.written();
        assert_eq!(written.len(), 8);
        assert_eq!(written[..4], written[4..]);
    }

    #[tokio::test]
    async fn failed_field_becomes_nan() {
        let mock = MockTransport::new("lauda");
        script(&mock);
        let (host, _rx) = LocalHost::in_memory();
        let mut equipment = chiller(&mock, &host).await;
        mock.respond(READ_STATUS, "ERR\r\n");

        let event = equipment.poll(&host).await.unwrap().unwrap();
        let data = event.bank("LAU0").unwrap().data();
        assert_eq!(data[0], 21.3);
        assert!(data[1].is_nan());
        assert_eq!(data[2], 0.0);
        assert_eq!(data[3], 18.0);
        assert!(host.errors().iter().any(|m| m.contains("chiller status")));
    }

    #[tokio::test]
    async fn dead_link_is_a_transport_failure() {
        let mock = MockTransport::new("lauda");
        script(&mock);
        let (host, _rx) = LocalHost::in_memory();
        let mut equipment = chiller(&mock, &host).await;
        equipment.transport = None;

        let err = equipment.poll(&host).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn feedback_corrects_setpoint() {
        let mock = MockTransport::new("lauda");
        script(&mock);
        let (host, mut rx) = LocalHost::in_memory();
        let mut equipment = chiller(&mock, &host).await;
        host.odb_set(&format!("{}/Feedback", SETTINGS), true.into()).unwrap();
        host.odb_set(&format!("{}/Demand Feedback", SETTINGS), 20.0.into()).unwrap();
        host.odb_set("/Equipment/ArduinoEquipment/Variables/ARD0", vec![19.0, 40.0, 1000.0].into())
            .unwrap();
        host.watch(SETTINGS);

        let event = equipment.poll(&host).await.unwrap().unwrap();
        // First step: no derivative history, P = 0.2 * (20 - 19).
        let expected = 18.0 + 0.2;
        assert!((event.bank("LAU0").unwrap().data()[3] - expected).abs() < 1e-12);

        let change = rx.try_recv().unwrap();
        assert_eq!(change.path, format!("{}/SetPoint", SETTINGS));
        mock.respond("OUT_SP_00_018.20\r\n", "OK\r\n");
        equipment.on_setting_change(&host, &change).await.unwrap();
        assert!(mock.written().contains(&"OUT_SP_00_018.20\r\n".to_string()));
    }

    #[tokio::test]
    async fn feedback_off_drops_controller() {
        let mock = MockTransport::new("lauda");
        script(&mock);
        let (host, _rx) = LocalHost::in_memory();
        let mut equipment = chiller(&mock, &host).await;
        host.odb_set(&format!("{}/Feedback", SETTINGS), true.into()).unwrap();
        host.odb_set("/Equipment/ArduinoEquipment/Variables/ARD0", vec![19.0].into())
            .unwrap();

        equipment.poll(&host).await.unwrap();
        assert!(equipment.controller().is_some());

        host.odb_set(&format!("{}/Feedback", SETTINGS), false.into()).unwrap();
        equipment.poll(&host).await.unwrap();
        assert!(equipment.controller().is_none());
    }

    #[tokio::test]
    async fn cooling_requires_ok() {
        let mock = MockTransport::new("lauda");
        script(&mock);
        let (host, _rx) = LocalHost::in_memory();
        let mut equipment = chiller(&mock, &host).await;
        let cooling = |on: bool| SettingChange {
            path: format!("{}/Cooling", SETTINGS),
            value: OdbValue::Bool(on),
        };

        mock.respond(START, "OK\r\n").respond(STOP, "ERR_3\r\n");
        equipment.on_setting_change(&host, &cooling(true)).await.unwrap();
        let err = equipment
            .on_setting_change(&host, &cooling(false))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Parse);
    }
}
