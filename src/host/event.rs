//! Event and bank records handed to the host's publish interface.
//!
//! One poll cycle produces at most one [`Event`]; an event carries one or
//! more [`Bank`]s, each a short fixed-shape list of readings tagged with a
//! four character name (`ARD0`, `KEIT`, `LAU0`, ...). Records are immutable
//! once built and are not retained by the equipment.

use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Header fields stamped by the frontend and the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHeader {
    /// Event ID from the equipment's common settings
    pub event_id: u16,
    /// Trigger mask from the equipment's common settings
    pub trigger_mask: u16,
    /// Serial number assigned by the host on publish
    pub serial_number: u32,
    /// Creation time
    pub timestamp: DateTime<Utc>,
}

impl Default for EventHeader {
    fn default() -> Self {
        Self {
            event_id: 0,
            trigger_mask: 0,
            serial_number: 0,
            timestamp: Utc::now(),
        }
    }
}

/// A named, ordered list of readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bank {
    name: String,
    data: Vec<f64>,
}

impl Bank {
    /// Creates a bank after validating its name.
    ///
    /// # Errors
    /// `DaqError::Host` unless the name is exactly four ASCII alphanumerics.
    pub fn new(name: &str, data: Vec<f64>) -> AppResult<Self> {
        let valid = name.len() == 4 && name.bytes().all(|b| b.is_ascii_alphanumeric());
        if !valid {
            return Err(DaqError::Host(format!(
                "bank name {:?} must be four ASCII alphanumerics",
                name
            )));
        }
        Ok(Self {
            name: name.to_string(),
            data,
        })
    }

    /// Bank name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bank contents.
    pub fn data(&self) -> &[f64] {
        &self.data
    }
}

/// One published record: header plus banks.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Event {
    /// Event header
    pub header: EventHeader,
    banks: Vec<Bank>,
}

impl Event {
    /// Creates an empty event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a bank.
    ///
    /// # Errors
    /// Invalid bank names and duplicate bank names are rejected.
    pub fn create_bank(&mut self, name: &str, data: Vec<f64>) -> AppResult<()> {
        if self.bank(name).is_some() {
            return Err(DaqError::Host(format!("duplicate bank {:?}", name)));
        }
        self.banks.push(Bank::new(name, data)?);
        Ok(())
    }

    /// Looks up a bank by name.
    pub fn bank(&self, name: &str) -> Option<&Bank> {
        self.banks.iter().find(|bank| bank.name == name)
    }

    /// All banks in creation order.
    pub fn banks(&self) -> &[Bank] {
        &self.banks
    }

    /// True if no bank was created.
    pub fn is_empty(&self) -> bool {
        self.banks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_banks_in_order() {
        let mut event = Event::new();
        event.create_bank("ARD0", vec![21.5, 40.0, 1013.0]).unwrap();
        event.create_bank("ARD1", vec![21.0, 41.0]).unwrap();

        let names: Vec<&str> = event.banks().iter().map(Bank::name).collect();
        assert_eq!(names, ["ARD0", "ARD1"]);
        assert_eq!(event.bank("ARD1").unwrap().data(), &[21.0, 41.0]);
    }

    #[test]
    fn rejects_bad_and_duplicate_names() {
        let mut event = Event::new();
        assert!(event.create_bank("AR", vec![]).is_err());
        assert!(event.create_bank("AR-0", vec![]).is_err());
        event.create_bank("KEIT", vec![1.0]).unwrap();
        assert!(event.create_bank("KEIT", vec![2.0]).is_err());
    }
}
