//! CSV persistence for published events.
//!
//! One row per bank: `timestamp, equipment, serial, event_id, bank, values...`.
//! Rows have a variable number of value columns, so the writer is flexible
//! and the header only names the fixed columns. [`read_events`] groups
//! consecutive rows of the same event back into [`RecordedEvent`]s.

use super::Event;
use crate::error::{AppResult, DaqError};
use std::fmt;
use std::path::Path;

/// An event read back from a CSV file.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    /// Equipment that published the event
    pub equipment: String,
    /// Header and banks as recorded
    pub event: Event,
}

impl fmt::Display for RecordedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.event.banks().iter().map(|bank| bank.name()).collect();
        write!(
            f,
            "Event # {} of type ID {} contains banks {}",
            self.event.header.serial_number,
            self.event.header.event_id,
            names.join(", ")
        )
    }
}

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use chrono::{DateTime, Utc};
    use std::fs::{File, OpenOptions};
    use std::path::PathBuf;
    use tracing::info;

    /// Appends events to a CSV file.
    pub struct CsvEventSink {
        path: PathBuf,
        writer: csv::Writer<File>,
    }

    impl CsvEventSink {
        /// Opens (or creates) `path` for appending.
        ///
        /// The parent directory is created if needed and the header row is
        /// written when the file is empty.
        ///
        /// # Errors
        /// `DaqError::Io` if the directory or file cannot be created.
        pub fn open(path: &Path) -> AppResult<Self> {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let is_new = file.metadata()?.len() == 0;

            let mut writer = csv::WriterBuilder::new()
                .flexible(true)
                .from_writer(file);
            if is_new {
                writer
                    .write_record(["timestamp", "equipment", "serial", "event_id", "bank", "values"])
                    .map_err(|e| DaqError::Host(format!("Failed to write CSV header: {}", e)))?;
                writer.flush()?;
            }

            info!(path = %path.display(), "CSV event sink opened");
            Ok(Self {
                path: path.to_path_buf(),
                writer,
            })
        }

        /// Output file.
        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Writes one row per bank and flushes.
        ///
        /// # Errors
        /// `DaqError::Host` / `DaqError::Io` on write failures.
        pub fn append(&mut self, equipment: &str, event: &Event) -> AppResult<()> {
            let header = &event.header;
            for bank in event.banks() {
                let mut record = vec![
                    header.timestamp.to_rfc3339(),
                    equipment.to_string(),
                    header.serial_number.to_string(),
                    header.event_id.to_string(),
                    bank.name().to_string(),
                ];
                record.extend(bank.data().iter().map(f64::to_string));
                self.writer.write_record(&record).map_err(|e| {
                    DaqError::Host(format!(
                        "Failed to write event to {}: {}",
                        self.path.display(),
                        e
                    ))
                })?;
            }
            self.writer.flush()?;
            Ok(())
        }
    }

    /// Reads every event recorded in `path`, in file order.
    ///
    /// # Errors
    /// `DaqError::Io` if the file cannot be opened, `DaqError::Host` naming
    /// the line for malformed rows.
    pub fn read_events(path: &Path) -> AppResult<Vec<RecordedEvent>> {
        let file = File::open(path)?;
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .has_headers(true)
            .from_reader(file);

        let mut events: Vec<RecordedEvent> = Vec::new();
        for (row, record) in reader.records().enumerate() {
            // Line 1 is the header.
            let line = row + 2;
            let record = record.map_err(|e| {
                DaqError::Host(format!("{} line {}: {}", path.display(), line, e))
            })?;
            let bad = |what: &str| {
                DaqError::Host(format!("{} line {}: {}", path.display(), line, what))
            };
            if record.len() < 5 {
                return Err(bad("too few columns"));
            }

            let timestamp = DateTime::parse_from_rfc3339(&record[0])
                .map_err(|_| bad("invalid timestamp"))?
                .with_timezone(&Utc);
            let equipment = &record[1];
            let serial: u32 = record[2].parse().map_err(|_| bad("invalid serial number"))?;
            let event_id: u16 = record[3].parse().map_err(|_| bad("invalid event id"))?;
            let values = record
                .iter()
                .skip(5)
                .map(|field| field.parse::<f64>().map_err(|_| bad("invalid bank value")))
                .collect::<AppResult<Vec<f64>>>()?;

            let continues = events.last().is_some_and(|last| {
                last.equipment == equipment
                    && last.event.header.serial_number == serial
                    && last.event.header.event_id == event_id
                    && last.event.header.timestamp == timestamp
            });
            if !continues {
                let mut event = Event::new();
                event.header.serial_number = serial;
                event.header.event_id = event_id;
                event.header.timestamp = timestamp;
                events.push(RecordedEvent {
                    equipment: equipment.to_string(),
                    event,
                });
            }
            if let Some(last) = events.last_mut() {
                last.event
                    .create_bank(&record[4], values)
                    .map_err(|e| bad(&e.to_string()))?;
            }
        }
        Ok(events)
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;

    /// Placeholder when built without `storage_csv`.
    pub struct CsvEventSink;

    impl CsvEventSink {
        /// Always fails: CSV support is not compiled in.
        pub fn open(_path: &Path) -> AppResult<Self> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }

        /// Always fails: CSV support is not compiled in.
        pub fn append(&mut self, _equipment: &str, _event: &Event) -> AppResult<()> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }
    }

    /// Always fails: CSV support is not compiled in.
    pub fn read_events(_path: &Path) -> AppResult<Vec<RecordedEvent>> {
        Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::{read_events, CsvEventSink};

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::{read_events, CsvEventSink};
