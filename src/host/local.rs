//! In-process host stub.
//!
//! `LocalHost` stands in for the external DAQ host when a frontend runs
//! standalone or under test. It keeps the configuration tree in a flat
//! [`Odb`], forwards writes to watched keys as [`SettingChange`]s over an
//! unbounded channel, numbers published events per equipment and mirrors
//! their banks into `/Equipment/<name>/Variables/<BANK>`.

use super::storage::CsvEventSink;
use super::{odb, Event, HostBus, Odb, OdbValue, SettingChange, StatusColor};
use crate::config::HostConfig;
use crate::error::AppResult;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// One operator message.
#[derive(Debug, Clone, PartialEq)]
pub struct HostMessage {
    /// When the message was sent
    pub timestamp: DateTime<Utc>,
    /// Message text
    pub text: String,
    /// Error (true) or informational (false)
    pub is_error: bool,
}

/// One event as received by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedEvent {
    /// Publishing equipment
    pub equipment: String,
    /// Target buffer
    pub buffer: String,
    /// The event, serial number filled in
    pub event: Event,
}

#[derive(Default)]
struct HostState {
    odb: Odb,
    watches: BTreeSet<String>,
    serials: HashMap<String, u32>,
    events: VecDeque<PublishedEvent>,
    messages: VecDeque<HostMessage>,
    status: HashMap<String, (String, StatusColor)>,
}

/// In-process implementation of [`HostBus`].
pub struct LocalHost {
    state: Mutex<HostState>,
    changes: mpsc::UnboundedSender<SettingChange>,
    sink: Option<Mutex<CsvEventSink>>,
    message_capacity: usize,
    event_capacity: usize,
}

impl LocalHost {
    /// Creates a host from the `[host]` configuration section.
    ///
    /// Returns the host and the receiving end of its change channel.
    ///
    /// # Errors
    /// Fails if CSV output is requested and the file cannot be opened.
    pub fn new(
        config: &HostConfig,
    ) -> AppResult<(Self, mpsc::UnboundedReceiver<SettingChange>)> {
        let sink = if config.csv_output {
            let path = config.data_dir.join("events.csv");
            Some(Mutex::new(CsvEventSink::open(&path)?))
        } else {
            None
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let host = Self {
            state: Mutex::new(HostState::default()),
            changes: tx,
            sink,
            message_capacity: config.message_log_capacity.max(1),
            event_capacity: config.event_log_capacity.max(1),
        };
        Ok((host, rx))
    }

    /// Host without persistence, using default capacities.
    pub fn in_memory() -> (Self, mpsc::UnboundedReceiver<SettingChange>) {
        let config = HostConfig::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let host = Self {
            state: Mutex::new(HostState::default()),
            changes: tx,
            sink: None,
            message_capacity: config.message_log_capacity,
            event_capacity: config.event_log_capacity,
        };
        (host, rx)
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Events retained in the in-memory log, oldest first.
    pub fn published(&self) -> Vec<PublishedEvent> {
        self.lock().events.iter().cloned().collect()
    }

    /// Operator messages retained in memory, oldest first.
    pub fn messages(&self) -> Vec<HostMessage> {
        self.lock().messages.iter().cloned().collect()
    }

    /// Error messages only.
    pub fn errors(&self) -> Vec<String> {
        self.lock()
            .messages
            .iter()
            .filter(|m| m.is_error)
            .map(|m| m.text.clone())
            .collect()
    }

    /// Last status reported for `equipment`.
    pub fn status(&self, equipment: &str) -> Option<(String, StatusColor)> {
        self.lock().status.get(equipment).cloned()
    }

    /// True if `path` is covered by a watch.
    pub fn is_watched(&self, path: &str) -> bool {
        let state = self.lock();
        watched_by(&state.watches, path)
    }

    fn push_message(&self, message: HostMessage) {
        let mut state = self.lock();
        if state.messages.len() >= self.message_capacity {
            state.messages.pop_front();
        }
        state.messages.push_back(message);
    }
}

/// A watch on `/a/b` covers `/a/b`, `/a/b/...` and `/a/b[i]`.
fn watched_by(watches: &BTreeSet<String>, path: &str) -> bool {
    let (base, _) = odb::split_index(path);
    let base = odb::normalize(base);
    watches.iter().any(|watch| {
        base == *watch
            || base.starts_with(&format!("{}/", watch))
            || watch == "/"
    })
}

/// Normalized form of a possibly indexed path.
fn canonical(path: &str) -> String {
    match odb::split_index(path) {
        (base, Some(index)) => format!("{}[{}]", odb::normalize(base), index),
        (base, None) => odb::normalize(base),
    }
}

impl HostBus for LocalHost {
    fn odb_get(&self, path: &str) -> Option<OdbValue> {
        self.lock().odb.get(path)
    }

    fn odb_set(&self, path: &str, value: OdbValue) -> AppResult<()> {
        let notify = {
            let mut state = self.lock();
            state.odb.set(path, value.clone())?;
            watched_by(&state.watches, path)
        };

        if notify {
            let change = SettingChange {
                path: canonical(path),
                value,
            };
            debug!(path = %change.path, value = %change.value, "watched key changed");
            if self.changes.send(change).is_err() {
                debug!("setting change dropped, no receiver");
            }
        }
        Ok(())
    }

    fn odb_list(&self, prefix: &str) -> Vec<(String, OdbValue)> {
        self.lock().odb.list(prefix)
    }

    fn watch(&self, path: &str) {
        self.lock().watches.insert(odb::normalize(path));
    }

    fn unwatch(&self, path: &str) -> bool {
        self.lock().watches.remove(&odb::normalize(path))
    }

    fn publish(&self, equipment: &str, buffer: &str, mut event: Event) -> AppResult<u32> {
        let serial = {
            let mut state = self.lock();
            let counter = state.serials.entry(equipment.to_string()).or_insert(0);
            let serial = *counter;
            *counter = counter.wrapping_add(1);
            serial
        };
        event.header.serial_number = serial;

        for bank in event.banks() {
            let path = format!("/Equipment/{}/Variables/{}", equipment, bank.name());
            self.odb_set(&path, OdbValue::FloatArray(bank.data().to_vec()))?;
        }

        if let Some(sink) = &self.sink {
            let mut sink = sink.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = sink.append(equipment, &event) {
                warn!(equipment, error = %e, "failed to persist event");
            }
        }

        debug!(
            equipment,
            buffer,
            serial,
            event_id = event.header.event_id,
            banks = event.banks().len(),
            "event published"
        );

        let mut state = self.lock();
        if state.events.len() >= self.event_capacity {
            state.events.pop_front();
        }
        state.events.push_back(PublishedEvent {
            equipment: equipment.to_string(),
            buffer: buffer.to_string(),
            event,
        });
        Ok(serial)
    }

    fn msg(&self, text: &str, is_error: bool) {
        if is_error {
            error!(target: "operator", "{}", text);
        } else {
            info!(target: "operator", "{}", text);
        }
        self.push_message(HostMessage {
            timestamp: Utc::now(),
            text: text.to_string(),
            is_error,
        });
    }

    fn set_status(&self, equipment: &str, status: &str, color: StatusColor) {
        let mut state = self.lock();
        let common = format!("/Equipment/{}/Common", equipment);
        // Status keys are host-owned and never watched.
        let _ = state
            .odb
            .set(&format!("{}/Status", common), OdbValue::from(status));
        let _ = state
            .odb
            .set(&format!("{}/Status color", common), OdbValue::from(color.as_str()));
        state
            .status
            .insert(equipment.to_string(), (status.to_string(), color));
    }
}
