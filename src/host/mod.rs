//! Host framework client interface.
//!
//! The host DAQ framework owns scheduling, run control, event buffering and
//! the configuration tree; frontends only call into it. Every equipment
//! receives a `&dyn HostBus` explicitly instead of reaching for a global
//! client object.
//!
//! [`LocalHost`] is an in-process stand-in implementing just enough of the
//! host for standalone operation and tests: a flat configuration store,
//! change notification for watched keys, serial numbering of published
//! events, CSV persistence and an operator message log.

pub mod event;
pub mod local;
pub mod odb;
pub mod storage;

pub use event::{Bank, Event, EventHeader};
pub use local::{HostMessage, LocalHost, PublishedEvent};
pub use odb::{Odb, OdbValue};

use crate::error::AppResult;
use std::fmt;

/// Notification that a watched configuration value changed.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingChange {
    /// Normalized path that was written (with `[i]` suffix for element writes)
    pub path: String,
    /// The new value
    pub value: OdbValue,
}

/// Status light shown next to an equipment on the host's status page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusColor {
    /// Healthy
    GreenLight,
    /// Degraded / busy
    YellowLight,
    /// Hardware error
    RedLight,
}

impl StatusColor {
    /// Host-side color name.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusColor::GreenLight => "greenLight",
            StatusColor::YellowLight => "yellowLight",
            StatusColor::RedLight => "redLight",
        }
    }
}

impl fmt::Display for StatusColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client stub for the host's data and configuration bus.
pub trait HostBus: Send + Sync {
    /// Reads a configuration value (`path` or `path[i]`).
    fn odb_get(&self, path: &str) -> Option<OdbValue>;

    /// Writes a configuration value; watched paths emit a [`SettingChange`].
    fn odb_set(&self, path: &str, value: OdbValue) -> AppResult<()>;

    /// Keys and values at and below `prefix`, sorted by key.
    fn odb_list(&self, prefix: &str) -> Vec<(String, OdbValue)>;

    /// Registers `path` (and everything below it) for change notification.
    fn watch(&self, path: &str);

    /// Removes a watch. Returns true if the path was watched.
    fn unwatch(&self, path: &str) -> bool;

    /// Hands a finished event to the host. Returns the assigned serial number.
    fn publish(&self, equipment: &str, buffer: &str, event: Event) -> AppResult<u32>;

    /// Sends an operator-visible message.
    fn msg(&self, text: &str, is_error: bool);

    /// Updates the equipment's status text and light.
    fn set_status(&self, equipment: &str, status: &str, color: StatusColor);

    /// Writes a value without triggering this frontend's own watch.
    ///
    /// Used when device state is mirrored back into a key the operator also
    /// edits (read-back of a demand value, for example).
    fn odb_set_unwatched(&self, path: &str, value: OdbValue) -> AppResult<()> {
        let was_watched = self.unwatch(path);
        let result = self.odb_set(path, value);
        if was_watched {
            self.watch(path);
        }
        result
    }

    /// Numeric read helper.
    fn odb_get_f64(&self, path: &str) -> Option<f64> {
        self.odb_get(path).and_then(|v| v.as_f64())
    }

    /// Boolean read helper.
    fn odb_get_bool(&self, path: &str) -> Option<bool> {
        self.odb_get(path).and_then(|v| v.as_bool())
    }
}
