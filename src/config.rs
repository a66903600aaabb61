//! Frontend configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/frontend.toml` (or an explicit file)
//! 2. Environment variables prefixed with `DAQFE_`
//!
//! Nested keys are separated by a double underscore in the environment:
//!
//! ```text
//! DAQFE_APPLICATION__LOG_LEVEL=debug
//! DAQFE_HOST__CSV_OUTPUT=false
//! ```
//!
//! # Example
//!
//! ```no_run
//! use daq_frontends::config::FrontendConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = FrontendConfig::load()?;
//!     println!("Frontend: {}", config.application.name);
//!     println!("Equipment: {}", config.enabled_equipment().count());
//!     Ok(())
//! }
//! ```

use crate::equipment::{arduino, ardutable, keithley, lauda};
use crate::error::{AppResult, DaqError};
use crate::host::OdbValue;
use crate::ivcurve::IvSweepConfig;
use crate::logging::{parse_log_level, OutputFormat};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/frontend.toml";

/// Top-level frontend configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrontendConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Local host stub settings
    #[serde(default)]
    pub host: HostConfig,
    /// Equipment definitions
    #[serde(default)]
    pub equipment: Vec<EquipmentDefinition>,
    /// Optional I-V sweep parameters
    #[serde(default)]
    pub iv_sweep: Option<IvSweepConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Frontend (client) name announced to the host
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default)]
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

/// Settings of the in-process host stub
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Directory for CSV event files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Append every published event to `<data_dir>/events.csv`
    #[serde(default)]
    pub csv_output: bool,
    /// Operator messages kept in memory
    #[serde(default = "default_message_log_capacity")]
    pub message_log_capacity: usize,
    /// Published events kept in memory
    #[serde(default = "default_event_log_capacity")]
    pub event_log_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            csv_output: false,
            message_log_capacity: default_message_log_capacity(),
            event_log_capacity: default_event_log_capacity(),
        }
    }
}

/// Supported equipment types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EquipmentKind {
    /// Arduino environmental sensor board
    Arduino,
    /// Arduino driven rotation stage
    Ardutable,
    /// Keithley source-meter
    Keithley,
    /// Lauda chiller
    Lauda,
}

impl fmt::Display for EquipmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EquipmentKind::Arduino => "arduino",
            EquipmentKind::Ardutable => "ardutable",
            EquipmentKind::Keithley => "keithley",
            EquipmentKind::Lauda => "lauda",
        };
        f.write_str(name)
    }
}

/// Overrides of an equipment's common settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommonOverrides {
    /// Event ID
    #[serde(default)]
    pub event_id: Option<u16>,
    /// Trigger mask
    #[serde(default)]
    pub trigger_mask: Option<u16>,
    /// Event buffer name
    #[serde(default)]
    pub buffer: Option<String>,
    /// Poll period in milliseconds
    #[serde(default)]
    pub period_ms: Option<u64>,
}

/// Equipment definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquipmentDefinition {
    /// Equipment type
    pub r#type: EquipmentKind,
    /// Whether this equipment is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Frontend index (Keithley instances are numbered)
    #[serde(default)]
    pub index: Option<u16>,
    /// Common setting overrides
    #[serde(default)]
    pub common: CommonOverrides,
    /// Initial values for `/Equipment/<name>/Settings/<key>`
    #[serde(default)]
    pub settings: BTreeMap<String, OdbValue>,
}

impl EquipmentDefinition {
    /// Equipment name as registered with the host.
    pub fn name(&self) -> String {
        match self.r#type {
            EquipmentKind::Arduino => arduino::EQUIPMENT_NAME.to_string(),
            EquipmentKind::Ardutable => ardutable::EQUIPMENT_NAME.to_string(),
            EquipmentKind::Keithley => keithley::equipment_name(self.index.unwrap_or(0)),
            EquipmentKind::Lauda => lauda::EQUIPMENT_NAME.to_string(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "daq_frontends".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_message_log_capacity() -> usize {
    1000
}

fn default_event_log_capacity() -> usize {
    100
}

fn default_enabled() -> bool {
    true
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl FrontendConfig {
    /// Load configuration from `config/frontend.toml` and the environment.
    ///
    /// # Errors
    ///
    /// Returns a `DaqError` if the file cannot be loaded or validation fails.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables (`DAQFE_` prefix) take precedence over the file.
    ///
    /// # Errors
    ///
    /// Returns a `DaqError` if the file cannot be loaded or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DAQFE_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Equipment names are unique
    /// - Poll periods are non-zero
    /// - The I-V sweep range is not empty
    ///
    /// # Errors
    ///
    /// Returns `DaqError::Configuration` describing the first problem found.
    pub fn validate(&self) -> AppResult<()> {
        parse_log_level(&self.application.log_level)?;

        let mut names = HashSet::new();
        for definition in &self.equipment {
            let name = definition.name();
            if !names.insert(name.clone()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate equipment '{}'",
                    name
                )));
            }
            if definition.common.period_ms == Some(0) {
                return Err(DaqError::Configuration(format!(
                    "Equipment '{}': period_ms must be > 0",
                    name
                )));
            }
        }

        if let Some(sweep) = &self.iv_sweep {
            sweep.validate()?;
        }

        Ok(())
    }

    /// Iterate over enabled equipment definitions
    pub fn enabled_equipment(&self) -> impl Iterator<Item = &EquipmentDefinition> {
        self.equipment.iter().filter(|def| def.enabled)
    }

    /// Definitions of one equipment type (enabled only)
    pub fn equipment_by_type(&self, kind: EquipmentKind) -> Vec<&EquipmentDefinition> {
        self.enabled_equipment()
            .filter(|def| def.r#type == kind)
            .collect()
    }
}
