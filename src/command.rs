//! Device command formatting.
//!
//! Commands are written as templates with named slots (`SOUR:VOLT {value}\n`)
//! and rendered with `strfmt`. Numeric formatting (precision, zero padding)
//! is done by the caller before the value is inserted, so every device keeps
//! control over its own number syntax.

use crate::error::{AppResult, DaqError};
use std::collections::HashMap;
use strfmt::strfmt;

/// A device command with named `{slot}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    source: &'static str,
}

impl CommandTemplate {
    /// Wraps a template string.
    pub const fn new(source: &'static str) -> Self {
        Self { source }
    }

    /// Renders the command with the given slot values.
    ///
    /// # Errors
    /// `DaqError::Configuration` if a slot is missing or the template is malformed.
    pub fn render(&self, slots: &[(&str, String)]) -> AppResult<String> {
        let context: HashMap<String, String> = slots
            .iter()
            .map(|(key, value)| ((*key).to_string(), value.clone()))
            .collect();

        strfmt(self.source, &context).map_err(|e| {
            DaqError::Configuration(format!(
                "failed to format command {:?}: {}",
                self.source, e
            ))
        })
    }

    /// The raw template text.
    pub fn as_str(&self) -> &'static str {
        self.source
    }
}
