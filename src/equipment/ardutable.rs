//! Arduino driven rotation stage.
//!
//! The stage is driven through two keys under `Variables`: `Demand` (target
//! angle in degrees) and `Led`. It publishes no events; its position and
//! state are mirrored into `Variables/Position` and `Variables/State`.
//!
//! Protocol (newline terminated):
//!
//! | command   | meaning                               | reply                             |
//! |-----------|---------------------------------------|-----------------------------------|
//! | `pos\n`   | position query                        | `Current position: 12.500°\r\n`   |
//! | `aNNN\n`  | rotate NNN degrees towards higher angle | `Moved ...` once finished       |
//! | `iNNN\n`  | rotate NNN degrees towards lower angle  | `Moved ...` once finished       |
//! | `led_on\n` / `led_off\n` | LED control            |                                   |
//!
//! ```text
//!   Idle ── demand accepted, command written ──> Moving
//!   Moving ── "Moved ..." line ──> Idle
//!   Moving ── transport failure ──> Error
//!   Error ── position query succeeds ──> Idle
//! ```
//!
//! While not Idle, demand and LED changes are rejected and the stored target
//! stays as it was.

use super::{
    link, open_serial_from_settings, report_change, with_context, Equipment, EquipmentCommon,
};
use crate::error::{AppResult, DaqError};
use crate::host::{Event, HostBus, OdbValue, SettingChange};
use crate::parser::ResponseTemplate;
use crate::transport::Transport;
use async_trait::async_trait;
use std::fmt;
use tracing::{debug, info, warn};

/// Equipment name registered with the host.
pub const EQUIPMENT_NAME: &str = "ArdutableEquipment";

const POSITION_QUERY: &str = "pos\n";
const POSITION_TEMPLATE: &str = "Current position: {pos:f}°\r\n";
const MOVE_DONE_PREFIX: &str = "Moved ";

/// Motion state of the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Ready for commands
    Idle,
    /// A relative move is in progress
    Moving,
    /// The link failed during a move
    Error,
}

impl StageState {
    /// Numeric code written to `Variables/State`.
    pub fn code(self) -> i64 {
        match self {
            StageState::Idle => 0,
            StageState::Moving => 1,
            StageState::Error => 2,
        }
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageState::Idle => "Idle",
            StageState::Moving => "Moving",
            StageState::Error => "Error",
        };
        f.write_str(name)
    }
}

/// Rotation stage equipment.
pub struct ArdutableEquipment {
    common: EquipmentCommon,
    transport: Option<Box<dyn Transport>>,
    template: ResponseTemplate,
    state: StageState,
    position: f64,
    target: f64,
    led: i64,
}

impl ArdutableEquipment {
    /// Equipment that opens its serial port from the settings on connect.
    pub fn new() -> AppResult<Self> {
        Ok(Self {
            common: EquipmentCommon::periodic(501, 1_000).with_log_history(false),
            transport: None,
            template: ResponseTemplate::compile(POSITION_TEMPLATE)?,
            state: StageState::Idle,
            position: 0.0,
            target: 0.0,
            led: 0,
        })
    }

    /// Uses `transport` instead of opening a serial port.
    pub fn with_transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Current motion state.
    pub fn state(&self) -> StageState {
        self.state
    }

    /// Last accepted demand.
    pub fn target(&self) -> f64 {
        self.target
    }

    /// Last measured position.
    pub fn position(&self) -> f64 {
        self.position
    }

    fn variable(&self, key: &str) -> String {
        format!("{}/{}", self.variables_dir(), key)
    }

    async fn read_position(&mut self, host: &dyn HostBus) -> AppResult<()> {
        let reply = link(&mut self.transport)?
            .query(POSITION_QUERY)
            .await
            .map_err(|e| with_context(e, "reading position"))?;
        let fields = self.template.parse(&reply)?;
        let position = round3(fields.require("pos")?);
        self.position = position;
        host.odb_set(&self.variable("Position"), OdbValue::Float(position))
    }

    async fn check_motion(&mut self) -> AppResult<()> {
        let transport = link(&mut self.transport)?;
        if transport.bytes_available().await? > 0 {
            let line = transport.read_line().await?;
            debug!(equipment = EQUIPMENT_NAME, line = line.trim_end(), "stage reported");
            if line.starts_with(MOVE_DONE_PREFIX) {
                info!(equipment = EQUIPMENT_NAME, "move finished");
                self.state = StageState::Idle;
            }
        }
        Ok(())
    }

    /// Puts the operator's Demand key back to the stored target.
    fn restore_demand(&self, host: &dyn HostBus) {
        let demand = self.variable("Demand");
        if let Err(e) = host.odb_set_unwatched(&demand, OdbValue::Float(self.target)) {
            warn!(equipment = EQUIPMENT_NAME, error = %e, "failed to restore Demand");
        }
    }

    fn restore_led(&self, host: &dyn HostBus) {
        if let Err(e) = host.odb_set_unwatched(&self.variable("Led"), OdbValue::Int(self.led)) {
            warn!(equipment = EQUIPMENT_NAME, error = %e, "failed to restore Led");
        }
    }

    fn busy(&self) -> DaqError {
        DaqError::Busy {
            equipment: EQUIPMENT_NAME.to_string(),
            state: self.state.to_string(),
        }
    }

    async fn on_demand(&mut self, host: &dyn HostBus, value: &OdbValue) -> AppResult<()> {
        if self.state != StageState::Idle {
            self.restore_demand(host);
            return Err(self.busy());
        }
        let Some(demand) = value.as_f64().filter(|d| d.is_finite()) else {
            self.restore_demand(host);
            return Err(DaqError::InvalidSetting {
                path: self.variable("Demand"),
                reason: format!("{} is not an angle", value),
            });
        };

        let command = move_command(self.position, demand);
        let written = match link(&mut self.transport) {
            Ok(transport) => transport
                .write(&command)
                .await
                .map_err(|e| with_context(e, "moving")),
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.restore_demand(host);
            return Err(e);
        }

        info!(equipment = EQUIPMENT_NAME, from = self.position, to = demand, "moving");
        self.target = demand;
        self.state = StageState::Moving;
        Ok(())
    }

    async fn on_led(&mut self, host: &dyn HostBus, value: &OdbValue) -> AppResult<()> {
        if self.state != StageState::Idle {
            self.restore_led(host);
            return Err(self.busy());
        }
        let on = value.as_i64() == Some(1);
        let command = if on { "led_on\n" } else { "led_off\n" };
        let written = match link(&mut self.transport) {
            Ok(transport) => transport
                .write(command)
                .await
                .map_err(|e| with_context(e, "sending LED command")),
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.restore_led(host);
            return Err(e);
        }
        self.led = i64::from(on);
        Ok(())
    }
}

/// Relative move command from `position` to `demand`.
///
/// The step count is the truncated difference, zero padded to three digits.
pub fn move_command(position: f64, demand: f64) -> String {
    if position > demand {
        format!("i{:03}\n", (position - demand) as i64)
    } else {
        format!("a{:03}\n", (demand - position) as i64)
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[async_trait]
impl Equipment for ArdutableEquipment {
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
            ("Editable", "Demand".into()),
            ("Names", "Arduino stage".into()),
            ("Unit Demand", "deg".into()),
            ("Unit State", "".into()),
            ("Unit Position", "deg".into()),
            ("Format Demand", "%f0".into()),
            ("Format State", "%f0".into()),
            ("Format Position", "%f3".into()),
            ("Grid display", true.into()),
        ]
    }

    fn watched_paths(&self) -> Vec<String> {
        vec![
            self.settings_dir(),
            self.variable("Demand"),
            self.variable("Led"),
        ]
    }

    async fn connect(&mut self, host: &dyn HostBus) -> AppResult<()> {
        if self.transport.is_none() {
            self.transport = Some(open_serial_from_settings(host, &self.settings_dir())?);
        }

        self.state = StageState::Idle;
        self.position = 0.0;
        self.target = 0.0;
        self.led = 0;
        host.odb_set(&self.variable("Demand"), OdbValue::Float(0.0))?;
        host.odb_set(&self.variable("State"), OdbValue::Int(StageState::Idle.code()))?;
        host.odb_set(&self.variable("Position"), OdbValue::Float(0.0))?;
        host.odb_set(&self.variable("Led"), OdbValue::Int(0))?;

        if let Some(transport) = &self.transport {
            info!(equipment = EQUIPMENT_NAME, link = %transport.describe(), "connected");
        }
        Ok(())
    }

    async fn poll(&mut self, host: &dyn HostBus) -> AppResult<Option<Event>> {
        let result = match self.state {
            StageState::Idle => self.read_position(host).await,
            StageState::Moving => {
                let checked = self.check_motion().await;
                if matches!(&checked, Err(e) if e.is_transport()) {
                    warn!(equipment = EQUIPMENT_NAME, "link lost while moving");
                    self.state = StageState::Error;
                }
                checked.map_err(|e| with_context(e, "checking end of movement"))
            }
            StageState::Error => {
                let recovered = self.read_position(host).await;
                if recovered.is_ok() {
                    info!(equipment = EQUIPMENT_NAME, "stage responding again");
                    self.state = StageState::Idle;
                }
                recovered
            }
        };

        host.odb_set(&self.variable("State"), OdbValue::Int(self.state.code()))?;
        result.map(|()| None)
    }

    async fn on_setting_change(
        &mut self,
        host: &dyn HostBus,
        change: &SettingChange,
    ) -> AppResult<()> {
        if change.path == self.variable("Demand") {
            self.on_demand(host, &change.value).await
        } else if change.path == self.variable("Led") {
            self.on_led(host, &change.value).await
        } else {
            report_change(host, change);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::host::LocalHost;
    use crate::transport::MockTransport;

    const DEMAND: &str = "/Equipment/ArdutableEquipment/Variables/Demand";

    async fn stage() -> (ArdutableEquipment, MockTransport, LocalHost) {
        let mock = MockTransport::new("stage");
        let mut equipment = ArdutableEquipment::new()
            .unwrap()
            .with_transport(Box::new(mock.clone()));
        let (host, _rx) = LocalHost::in_memory();
        equipment.connect(&host).await.unwrap();
        (equipment, mock, host)
    }

    fn demand(value: f64) -> SettingChange {
        SettingChange {
            path: DEMAND.to_string(),
            value: OdbValue::Float(value),
        }
    }

    #[test]
    fn move_commands() {
        assert_eq!(move_command(0.0, 45.0), "a045\n");
        assert_eq!(move_command(90.0, 12.5), "i077\n");
        assert_eq!(move_command(10.0, 10.0), "a000\n");
        assert_eq!(move_command(0.0, 359.9), "a359\n");
    }

    #[tokio::test]
    async fn idle_poll_stores_rounded_position() {
        let (mut equipment, mock, host) = stage().await;
        mock.respond("pos\n", "Current position: 12.34567°\r\n");

        assert!(equipment.poll(&host).await.unwrap().is_none());
        assert_eq!(
            host.odb_get_f64("/Equipment/ArdutableEquipment/Variables/Position"),
            Some(12.346)
        );
        assert_eq!(
            host.odb_get("/Equipment/ArdutableEquipment/Variables/State"),
            Some(OdbValue::Int(0))
        );
    }

    #[tokio::test]
    async fn demand_while_moving_is_rejected() {
        let (mut equipment, mock, host) = stage().await;

        equipment.on_setting_change(&host, &demand(30.0)).await.unwrap();
        assert_eq!(equipment.state(), StageState::Moving);
        assert_eq!(mock.written(), ["a030\n"]);

        host.odb_set(DEMAND, 50.0.into()).unwrap();
        let err = equipment
            .on_setting_change(&host, &demand(50.0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
        assert_eq!(equipment.target(), 30.0);
        assert_eq!(host.odb_get_f64(DEMAND), Some(30.0));
        assert_eq!(mock.written().len(), 1);
    }

    #[tokio::test]
    async fn completion_line_returns_to_idle() {
        let (mut equipment, mock, host) = stage().await;
        equipment.on_setting_change(&host, &demand(10.0)).await.unwrap();

        // Nothing pending: still moving, no read attempted.
        equipment.poll(&host).await.unwrap();
        assert_eq!(equipment.state(), StageState::Moving);

        mock.push_line("Moved 10\r\n");
        equipment.poll(&host).await.unwrap();
        assert_eq!(equipment.state(), StageState::Idle);
        assert_eq!(
            host.odb_get("/Equipment/ArdutableEquipment/Variables/State"),
            Some(OdbValue::Int(0))
        );
    }

    #[tokio::test]
    async fn failed_write_keeps_idle() {
        let (mut equipment, mock, host) = stage().await;
        mock.fail_next_write();

        let err = equipment
            .on_setting_change(&host, &demand(20.0))
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert_eq!(equipment.state(), StageState::Idle);
        assert_eq!(equipment.target(), 0.0);
    }

    #[tokio::test]
    async fn demand_without_link_is_restored() {
        let mut equipment = ArdutableEquipment::new().unwrap();
        let (host, _rx) = LocalHost::in_memory();
        host.odb_set(DEMAND, OdbValue::Float(40.0)).unwrap();

        let err = equipment
            .on_setting_change(&host, &demand(40.0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(host.odb_get_f64(DEMAND), Some(0.0));
        assert_eq!(equipment.state(), StageState::Idle);
    }

    #[tokio::test]
    async fn link_loss_while_moving_then_recovery() {
        let (mut equipment, mock, host) = stage().await;
        equipment.on_setting_change(&host, &demand(10.0)).await.unwrap();

        mock.push_line("garbage\r\n");
        mock.fail_next_read();
        assert!(equipment.poll(&host).await.is_err());
        assert_eq!(equipment.state(), StageState::Error);
        assert_eq!(
            host.odb_get("/Equipment/ArdutableEquipment/Variables/State"),
            Some(OdbValue::Int(2))
        );

        mock.respond("pos\n", "Current position: 10.000°\r\n");
        // Drain the stale line first, then the position reply parses.
        let _ = equipment.poll(&host).await;
        equipment.poll(&host).await.unwrap();
        assert_eq!(equipment.state(), StageState::Idle);
        assert_eq!(equipment.position(), 10.0);
    }

    #[tokio::test]
    async fn led_commands() {
        let (mut equipment, mock, host) = stage().await;
        let led = |v: i64| SettingChange {
            path: "/Equipment/ArdutableEquipment/Variables/Led".into(),
            value: OdbValue::Int(v),
        };
        equipment.on_setting_change(&host, &led(1)).await.unwrap();
        equipment.on_setting_change(&host, &led(0)).await.unwrap();
        assert_eq!(mock.written(), ["led_on\n", "led_off\n"]);
    }
}
