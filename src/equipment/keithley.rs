//! Keithley source-meter (SCPI).
//!
//! Several source-meters can run side by side; each instance is numbered by
//! its frontend index, which also offsets the event ID (`600 + index`).
//!
//! The operator drives the unit through `Variables/Demand` (source voltage)
//! and `Variables/Output` (output enable). Every poll reads the device's own
//! view of both back into those keys without re-triggering the watch.

use super::{
    link, report_change, setting_f64, setting_str, with_context, Equipment, EquipmentCommon,
};
use crate::command::CommandTemplate;
use crate::error::{AppResult, DaqError};
use crate::host::{Event, HostBus, OdbValue, SettingChange};
use crate::parser::parse_number;
use crate::transport::{self, Transport, DEFAULT_READ_TIMEOUT};
use async_trait::async_trait;
use tracing::{debug, info};

const MEASURE_VOLTAGE: &str = "MEAS:VOLT?\n";
const MEASURE_CURRENT: &str = "MEAS:CURR?\n";
const SOURCE_VOLTAGE: &str = "SOUR:VOLT?\n";
const OUTPUT_STATE: &str = "OUTP:STAT?\n";
const SET_VOLTAGE: CommandTemplate = CommandTemplate::new("SOUR:VOLT {value}\n");
const SET_OUTPUT: CommandTemplate = CommandTemplate::new("OUTP:STAT {state}\n");

/// Equipment name for frontend index `index`.
pub fn equipment_name(index: u16) -> String {
    format!("KeithleyEquipment_{}", index)
}

/// Source-meter equipment.
pub struct KeithleyEquipment {
    name: String,
    common: EquipmentCommon,
    transport: Option<Box<dyn Transport>>,
}

impl KeithleyEquipment {
    /// Equipment for frontend index `index`; the link is opened on connect.
    pub fn new(index: u16) -> Self {
        Self {
            name: equipment_name(index),
            common: EquipmentCommon::periodic(600u16.saturating_add(index), 60_000),
            transport: None,
        }
    }

    /// Uses `transport` instead of opening the configured resource.
    pub fn with_transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    fn variable(&self, key: &str) -> String {
        format!("{}/{}", self.variables_dir(), key)
    }

    fn open_link(&self, host: &dyn HostBus) -> AppResult<Box<dyn Transport>> {
        let dir = self.settings_dir();
        let resource = setting_str(host, &dir, "Resource")?;
        let kind = host
            .odb_get(&format!("{}/Transport", dir))
            .and_then(|v| v.as_str().map(str::to_ascii_lowercase))
            .unwrap_or_else(|| "visa".to_string());

        match kind.as_str() {
            "visa" => transport::open_visa(&resource, DEFAULT_READ_TIMEOUT),
            "serial" => {
                let baud = setting_f64(host, &dir, "Serial Speed")?;
                transport::open_serial(&resource, baud as u32, DEFAULT_READ_TIMEOUT)
            }
            other => Err(DaqError::InvalidSetting {
                path: format!("{}/Transport", dir),
                reason: format!("unknown transport '{}', expected visa or serial", other),
            }),
        }
    }

    async fn query_number(&mut self, command: &str) -> AppResult<f64> {
        let reply = link(&mut self.transport)?
            .query(command)
            .await
            .map_err(|e| with_context(e, "reading from device"))?;
        parse_number(&reply)
    }

    async fn query_output(&mut self) -> AppResult<bool> {
        let reply = link(&mut self.transport)?
            .query(OUTPUT_STATE)
            .await
            .map_err(|e| with_context(e, "reading from device"))?;
        Ok(reply.trim_start().starts_with('1'))
    }

    async fn send(&mut self, command: &str) -> AppResult<()> {
        link(&mut self.transport)?
            .write(command)
            .await
            .map_err(|e| with_context(e, "writing to device"))
    }
}

#[async_trait]
impl Equipment for KeithleyEquipment {
    fn name(&self) -> &str {
        &self.name
    }

    fn common(&self) -> &EquipmentCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut EquipmentCommon {
        &mut self.common
    }

    fn default_settings(&self) -> Vec<(&'static str, OdbValue)> {
        vec![
            ("Resource", "".into()),
            ("Transport", "visa".into()),
            ("Serial Speed", OdbValue::Int(9_600)),
            ("Editable", "Demand,Output".into()),
            ("Names KEIT", vec!["Voltage", "Current"].into()),
            ("Unit KEIT", vec!["V", "A"].into()),
            ("Format KEIT", vec!["%f2", "%e2"].into()),
            ("Grid display", false.into()),
        ]
    }

    fn watched_paths(&self) -> Vec<String> {
        vec![
            self.settings_dir(),
            self.variable("Demand"),
            self.variable("Output"),
        ]
    }

    async fn connect(&mut self, host: &dyn HostBus) -> AppResult<()> {
        if self.transport.is_none() {
            self.transport = Some(self.open_link(host)?);
        }
        host.odb_set(&self.variable("Demand"), OdbValue::Float(0.0))?;
        host.odb_set(&self.variable("Output"), OdbValue::Bool(false))?;

        if let Some(transport) = &self.transport {
            info!(equipment = %self.name, link = %transport.describe(), "connected");
        }
        Ok(())
    }

    async fn poll(&mut self, host: &dyn HostBus) -> AppResult<Option<Event>> {
        let voltage = self.query_number(MEASURE_VOLTAGE).await?;
        let current = self.query_number(MEASURE_CURRENT).await?;
        let demand = self.query_number(SOURCE_VOLTAGE).await?;
        let output = self.query_output().await?;
        debug!(equipment = %self.name, voltage, current, demand, output, "measured");

        let mut event = self.new_event();
        event.create_bank("KEIT", vec![voltage, current])?;

        host.odb_set_unwatched(&self.variable("Demand"), OdbValue::Float(demand))?;
        host.odb_set_unwatched(&self.variable("Output"), OdbValue::Bool(output))?;
        Ok(Some(event))
    }

    async fn on_setting_change(
        &mut self,
        host: &dyn HostBus,
        change: &SettingChange,
    ) -> AppResult<()> {
        if change.path == self.variable("Demand") {
            let volts = change
                .value
                .as_f64()
                .filter(|v| v.is_finite())
                .ok_or_else(|| DaqError::InvalidSetting {
                    path: change.path.clone(),
                    reason: format!("{} is not a voltage", change.value),
                })?;
            let command = SET_VOLTAGE.render(&[("value", format!("{:.6}", volts))])?;
            self.send(&command).await
        } else if change.path == self.variable("Output") {
            let on = change.value.as_bool().ok_or_else(|| DaqError::InvalidSetting {
                path: change.path.clone(),
                reason: format!("{} is not an on/off state", change.value),
            })?;
            let state = if on { "1" } else { "0" };
            let command = SET_OUTPUT.render(&[("state", state.to_string())])?;
            self.send(&command).await
        } else {
            report_change(host, change);
            Ok(())
        }
    }
}
