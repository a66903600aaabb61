//! Frontend runner: equipment registry and the cooperative poll loop.
//!
//! One frontend serves any number of equipments from a single task. Polls
//! and setting-change callbacks are interleaved, never concurrent, so an
//! equipment's state machine only ever sees one call at a time.
//!
//! Failures never stop the loop. Every error is sent to the operator
//! through [`HostBus::msg`]; transport failures additionally flip the
//! equipment's status light to red until its next successful poll.

use crate::config::{EquipmentKind, FrontendConfig};
use crate::equipment::{
    ArduinoEquipment, ArdutableEquipment, Equipment, KeithleyEquipment, LaudaEquipment,
};
use crate::error::AppResult;
use crate::host::{odb, HostBus, OdbValue, SettingChange, StatusColor};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const STATUS_OK: &str = "Ok";
const STATUS_HW_ERROR: &str = "HW Error";

struct Slot {
    equipment: Box<dyn Equipment>,
    next_poll: Instant,
    healthy: bool,
}

/// A set of equipments sharing one host connection and one task.
pub struct Frontend {
    name: String,
    host: Arc<dyn HostBus>,
    slots: Vec<Slot>,
}

impl Frontend {
    /// Empty frontend named `name`.
    pub fn new(name: &str, host: Arc<dyn HostBus>) -> Self {
        Self {
            name: name.to_string(),
            host,
            slots: Vec::new(),
        }
    }

    /// Builds the equipments enabled in `config`.
    ///
    /// Settings given in the configuration are written before any default,
    /// so they win over the equipment's own defaults.
    pub fn from_config(config: &FrontendConfig, host: Arc<dyn HostBus>) -> AppResult<Self> {
        let mut frontend = Self::new(&config.application.name, host);
        for definition in config.enabled_equipment() {
            let mut equipment: Box<dyn Equipment> = match definition.r#type {
                EquipmentKind::Arduino => Box::new(ArduinoEquipment::new()?),
                EquipmentKind::Ardutable => Box::new(ArdutableEquipment::new()?),
                EquipmentKind::Keithley => {
                    Box::new(KeithleyEquipment::new(definition.index.unwrap_or(0)))
                }
                EquipmentKind::Lauda => Box::new(LaudaEquipment::new()),
            };
            equipment.common_mut().apply(&definition.common);

            let dir = equipment.settings_dir();
            for (key, value) in &definition.settings {
                frontend
                    .host
                    .odb_set(&format!("{}/{}", dir, key), value.clone())?;
            }
            frontend.add_equipment(equipment);
        }
        Ok(frontend)
    }

    /// Frontend name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host this frontend talks to.
    pub fn host(&self) -> &Arc<dyn HostBus> {
        &self.host
    }

    /// Registers an equipment. It is connected by [`connect_all`](Self::connect_all).
    pub fn add_equipment(&mut self, equipment: Box<dyn Equipment>) {
        debug!(frontend = %self.name, equipment = equipment.name(), "equipment registered");
        self.slots.push(Slot {
            equipment,
            next_poll: Instant::now(),
            healthy: true,
        });
    }

    /// Names of the registered equipments, in registration order.
    pub fn equipment_names(&self) -> Vec<String> {
        self.slots
            .iter()
            .map(|slot| slot.equipment.name().to_string())
            .collect()
    }

    /// Seeds default settings and connects every equipment.
    ///
    /// Equipments that fail to connect are reported, marked `HW Error` and
    /// dropped. The survivors' watched paths are registered afterwards, so
    /// nothing written during connect produces a change notification.
    /// Returns the number of connected equipments.
    pub async fn connect_all(&mut self) -> usize {
        let host = Arc::clone(&self.host);
        let mut connected = Vec::with_capacity(self.slots.len());

        for mut slot in std::mem::take(&mut self.slots) {
            let name = slot.equipment.name().to_string();
            if let Err(e) = seed_defaults(host.as_ref(), slot.equipment.as_ref()) {
                host.msg(&format!("{}: cannot write default settings: {}", name, e), true);
            }

            match slot.equipment.connect(host.as_ref()).await {
                Ok(()) => {
                    host.set_status(&name, STATUS_OK, StatusColor::GreenLight);
                    slot.next_poll = Instant::now();
                    slot.healthy = true;
                    connected.push(slot);
                }
                Err(e) => {
                    host.msg(&format!("{}: connection failed: {}", name, e), true);
                    host.set_status(&name, STATUS_HW_ERROR, StatusColor::RedLight);
                }
            }
        }

        for slot in &connected {
            for path in slot.equipment.watched_paths() {
                host.watch(&path);
            }
        }
        self.slots = connected;

        info!(frontend = %self.name, equipment = self.slots.len(), "frontend connected");
        self.slots.len()
    }

    /// Polls every equipment whose period has elapsed at `now`.
    pub async fn poll_due(&mut self, now: Instant) {
        let host = Arc::clone(&self.host);
        for slot in self.slots.iter_mut().filter(|slot| slot.next_poll <= now) {
            poll_slot(host.as_ref(), slot).await;
            slot.next_poll = Instant::now() + slot.equipment.common().period();
        }
    }

    /// Polls every equipment once, regardless of schedule.
    pub async fn poll_all(&mut self) {
        let host = Arc::clone(&self.host);
        for slot in &mut self.slots {
            poll_slot(host.as_ref(), slot).await;
            slot.next_poll = Instant::now() + slot.equipment.common().period();
        }
    }

    /// Hands a change to every equipment watching its path.
    pub async fn dispatch(&mut self, change: &SettingChange) {
        let host = Arc::clone(&self.host);
        let mut handled = false;
        for slot in &mut self.slots {
            let watches = slot.equipment.watched_paths();
            if !watches.iter().any(|watch| covers(watch, &change.path)) {
                continue;
            }
            handled = true;
            if let Err(e) = slot.equipment.on_setting_change(host.as_ref(), change).await {
                host.msg(&format!("{}: {}", slot.equipment.name(), e), true);
            }
        }
        if !handled {
            debug!(path = %change.path, "change not claimed by any equipment");
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.slots.iter().map(|slot| slot.next_poll).min()
    }

    /// Serves polls and setting changes until `shutdown` resolves.
    ///
    /// Also returns when the change channel closes.
    pub async fn run<F>(
        &mut self,
        changes: &mut mpsc::UnboundedReceiver<SettingChange>,
        shutdown: F,
    ) -> AppResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        self.host.msg(&format!("{} started", self.name), false);

        loop {
            let deadline = self.next_deadline();
            let due = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!(frontend = %self.name, "shutdown requested");
                    break;
                }
                change = changes.recv() => match change {
                    Some(change) => self.dispatch(&change).await,
                    None => {
                        warn!(frontend = %self.name, "change channel closed, stopping");
                        break;
                    }
                },
                _ = due => self.poll_due(Instant::now()).await,
            }
        }

        self.host.msg(&format!("{} stopped", self.name), false);
        Ok(())
    }
}

fn seed_defaults(host: &dyn HostBus, equipment: &dyn Equipment) -> AppResult<()> {
    let dir = equipment.settings_dir();
    for (key, value) in equipment.default_settings() {
        let path = format!("{}/{}", dir, key);
        if host.odb_get(&path).is_none() {
            host.odb_set(&path, value)?;
        }
    }
    Ok(())
}

async fn poll_slot(host: &dyn HostBus, slot: &mut Slot) {
    let name = slot.equipment.name().to_string();
    match slot.equipment.poll(host).await {
        Ok(event) => {
            if !slot.healthy {
                info!(equipment = %name, "equipment recovered");
                host.set_status(&name, STATUS_OK, StatusColor::GreenLight);
                slot.healthy = true;
            }
            if let Some(event) = event {
                let buffer = slot.equipment.common().buffer.clone();
                if let Err(e) = host.publish(&name, &buffer, event) {
                    host.msg(&format!("{}: publishing failed: {}", name, e), true);
                }
            }
        }
        Err(e) => {
            host.msg(&format!("{}: {}", name, e), true);
            if e.is_transport() && slot.healthy {
                host.set_status(&name, STATUS_HW_ERROR, StatusColor::RedLight);
                slot.healthy = false;
            }
        }
    }
}

/// True if a watch on `watch` reports writes to `path`.
fn covers(watch: &str, path: &str) -> bool {
    let watch = odb::normalize(watch);
    let (base, _) = odb::split_index(path);
    let base = odb::normalize(base);
    base == watch || watch == "/" || base.starts_with(&format!("{}/", watch))
}

// ============================================================================
// Operator console
// ============================================================================

/// Result of one console line.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleReply {
    /// Text to show the operator (may be empty)
    Output(String),
    /// The operator asked to stop
    Quit,
}

const CONSOLE_HELP: &str = "commands: get <path> | set <path> <value> | ls [prefix] | quit";

/// Executes one console command against the host's configuration tree.
///
/// `set` values are read as JSON (`true`, `2.5`, `[1, 2]`) and fall back to
/// plain text.
pub fn console_command(host: &dyn HostBus, line: &str) -> ConsoleReply {
    let line = line.trim();
    let (command, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();

    let text = match command {
        "" => String::new(),
        "quit" | "exit" => return ConsoleReply::Quit,
        "help" => CONSOLE_HELP.to_string(),
        "get" if !rest.is_empty() => match host.odb_get(rest) {
            Some(value) => value.to_string(),
            None => format!("{}: not found", rest),
        },
        "set" => match split_set_arguments(rest) {
            Some((path, text)) => {
                let value = OdbValue::parse_input(text);
                match host.odb_set(path, value.clone()) {
                    Ok(()) => format!("{} = {}", path, value),
                    Err(e) => format!("error: {}", e),
                }
            }
            None => CONSOLE_HELP.to_string(),
        },
        "ls" => {
            let prefix = if rest.is_empty() { "/" } else { rest };
            host.odb_list(prefix)
                .into_iter()
                .map(|(key, value)| format!("{} = {}", key, value))
                .collect::<Vec<_>>()
                .join("\n")
        }
        _ => CONSOLE_HELP.to_string(),
    };
    ConsoleReply::Output(text)
}

/// Splits `<path> <value>`. Paths may contain spaces, so the value is the
/// last whitespace separated word unless it is a JSON array.
fn split_set_arguments(rest: &str) -> Option<(&str, &str)> {
    let split_at = match rest.rfind('[') {
        Some(open) if rest.ends_with(']') && open > 0 && rest[..open].ends_with(' ') => open,
        _ => rest.rfind(char::is_whitespace)? + 1,
    };
    let (path, value) = rest.split_at(split_at);
    let path = path.trim_end();
    if path.is_empty() || value.trim().is_empty() {
        None
    } else {
        Some((path, value))
    }
}

/// Reads console commands from `input` until `quit` or end of input.
pub async fn run_console<R, W>(host: &dyn HostBus, input: R, mut output: W) -> AppResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        match console_command(host, &line) {
            ConsoleReply::Quit => break,
            ConsoleReply::Output(text) if text.is_empty() => {}
            ConsoleReply::Output(text) => {
                output.write_all(text.as_bytes()).await?;
                output.write_all(b"\n").await?;
                output.flush().await?;
            }
        }
    }
    Ok(())
}
