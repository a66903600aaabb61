//! CAEN N1081B programmable logic unit, read out as a four-section scaler.
//!
//! The vendor SDK is not part of this crate. Integrators wrap their client in
//! a [`CounterModule`] and register the equipment with
//! [`Frontend::add_equipment`](crate::frontend::Frontend::add_equipment).
//! The module answers `function_results` with the SDK's JSON document:
//!
//! ```json
//! {"Result": true, "data": {"result": "...", "counters": [{"lemo": 0, "value": 12}]}}
//! ```
//!
//! Each section A..D becomes one bank (`SCAA`..`SCAD`) of four counter
//! values indexed by LEMO connector. A section whose function has no
//! counters emits no bank; a failed section is reported and skipped. A
//! transport error from the module, or a cycle in which every section
//! fails, fails the whole poll so the equipment is marked unhealthy.

use super::{Equipment, EquipmentCommon};
use crate::error::{AppResult, DaqError};
use crate::host::{Event, HostBus, OdbValue};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use tracing::{info, warn};

/// Equipment name registered with the host.
pub const EQUIPMENT_NAME: &str = "N1081B";

/// Counter channels per section.
pub const LEMO_CHANNELS: usize = 4;

/// One of the four module sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    /// Section A
    A,
    /// Section B
    B,
    /// Section C
    C,
    /// Section D
    D,
}

impl Section {
    /// All sections in readout order.
    pub const ALL: [Section; 4] = [Section::A, Section::B, Section::C, Section::D];

    /// Bank carrying this section's counters.
    pub fn bank_name(self) -> &'static str {
        match self {
            Section::A => "SCAA",
            Section::B => "SCAB",
            Section::C => "SCAC",
            Section::D => "SCAD",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Section::A => "SEC_A",
            Section::B => "SEC_B",
            Section::C => "SEC_C",
            Section::D => "SEC_D",
        };
        f.write_str(name)
    }
}

/// Client for the module's network SDK.
#[async_trait]
pub trait CounterModule: Send {
    /// Opens the connection to the module at `address`.
    async fn connect(&mut self, address: &str) -> AppResult<()>;

    /// Authenticates the session.
    async fn login(&mut self, password: &str) -> AppResult<()>;

    /// Raw function results document for `section`.
    async fn function_results(&mut self, section: Section) -> AppResult<serde_json::Value>;
}

/// Function results as reported by the SDK.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FunctionResults {
    /// Whether the SDK call succeeded
    #[serde(rename = "Result")]
    pub ok: bool,
    /// Payload
    #[serde(default)]
    pub data: FunctionData,
}

/// Payload of [`FunctionResults`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FunctionData {
    /// Function-specific result (`"none"` for pure counters)
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Counter readings, if the function counts
    #[serde(default)]
    pub counters: Option<Vec<Counter>>,
}

/// One counter reading.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Counter {
    /// LEMO connector index
    pub lemo: usize,
    /// Count
    pub value: f64,
}

impl FunctionResults {
    /// Counter values by LEMO index, or `None` if the function has no counters.
    ///
    /// Readings for connectors beyond [`LEMO_CHANNELS`] are dropped.
    pub fn counter_values(&self) -> Option<Vec<f64>> {
        let counters = self.data.counters.as_ref()?;
        let mut values = vec![0.0; LEMO_CHANNELS];
        for counter in counters {
            match values.get_mut(counter.lemo) {
                Some(slot) => *slot = counter.value,
                None => warn!(lemo = counter.lemo, "counter on unknown connector ignored"),
            }
        }
        Some(values)
    }
}

/// Scaler equipment over a [`CounterModule`].
pub struct N1081BEquipment {
    common: EquipmentCommon,
    module: Box<dyn CounterModule>,
}

impl N1081BEquipment {
    /// Equipment reading through `module`.
    pub fn new(module: Box<dyn CounterModule>) -> Self {
        Self {
            common: EquipmentCommon::periodic(500, 1_000),
            module,
        }
    }

    async fn read_section(&mut self, section: Section) -> AppResult<Option<Vec<f64>>> {
        let raw = self.module.function_results(section).await?;
        let results: FunctionResults = serde_json::from_value(raw)
            .map_err(|e| DaqError::Sdk(format!("{}: malformed function results: {}", section, e)))?;
        if !results.ok {
            return Err(DaqError::Sdk(format!("{}: function results request failed", section)));
        }
        Ok(results.counter_values())
    }
}

#[async_trait]
impl Equipment for N1081BEquipment {
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
            ("Ip Address", "192.168.50.20".into()),
            ("Password", "password".into()),
        ]
    }

    async fn connect(&mut self, host: &dyn HostBus) -> AppResult<()> {
        let dir = self.settings_dir();
        let address = super::setting_str(host, &dir, "Ip Address")?;
        let password = super::setting_str(host, &dir, "Password")?;

        self.module.connect(&address).await?;
        self.module.login(&password).await?;
        info!(equipment = EQUIPMENT_NAME, %address, "connected");
        Ok(())
    }

    async fn poll(&mut self, host: &dyn HostBus) -> AppResult<Option<Event>> {
        let mut event = self.new_event();
        let mut failed = 0;
        let mut link_error = None;
        for section in Section::ALL {
            match self.read_section(section).await {
                Ok(Some(values)) => event.create_bank(section.bank_name(), values)?,
                Ok(None) => {}
                Err(e) if e.is_transport() => {
                    link_error.get_or_insert(e);
                    failed += 1;
                }
                Err(e) => {
                    host.msg(&format!("Error reading section {}: {}", section, e), true);
                    failed += 1;
                }
            }
        }

        if let Some(e) = link_error {
            return Err(e);
        }
        // A module that answers no section at all has lost its link.
        if failed == Section::ALL.len() {
            return Err(DaqError::Transport(format!(
                "{}: no section answered",
                EQUIPMENT_NAME
            )));
        }
        Ok(if event.is_empty() { None } else { Some(event) })
    }
}
