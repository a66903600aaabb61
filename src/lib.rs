//! Instrument-control frontends for a MIDAS-style DAQ host.
//!
//! Each frontend polls one piece of lab hardware over serial, VISA or a
//! vendor SDK, turns its text replies into fixed-shape numeric banks and
//! hands them to the host framework, which owns run control, buffering and
//! the configuration tree. Operator edits of watched configuration keys are
//! turned back into device commands.
//!
//! Supported devices: an Arduino environmental sensor board, an Arduino
//! driven rotation stage, Keithley source-meters, a Lauda chiller (with
//! optional PID feedback on its setpoint) and a CAEN N1081B scaler.
//!
//! The library is organised bottom-up:
//!
//! - [`parser`] and [`command`]: device reply templates and command templates
//! - [`transport`]: the byte link to a device
//! - [`host`]: the host bus client interface and an in-process stand-in
//! - [`equipment`]: one module per device
//! - [`frontend`]: the registry and single-task poll loop
//! - [`ivcurve`]: I-V sweeps driven through the configuration tree

pub mod command;
pub mod config;
pub mod equipment;
pub mod error;
pub mod frontend;
pub mod host;
pub mod ivcurve;
pub mod logging;
pub mod parser;
pub mod pid;
pub mod transport;

pub use error::{AppResult, DaqError};
