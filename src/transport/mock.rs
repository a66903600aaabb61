//! Scripted transport for testing equipments without hardware.
//!
//! The mock answers each written command from a reply script:
//! - `respond(cmd, reply)` answers `cmd` with `reply` every time;
//! - `respond_once(cmd, reply)` queues a one-shot reply that takes
//!   precedence over the permanent one;
//! - `push_line(line)` makes an unsolicited line available (e.g. a
//!   "motion finished" notice).
//!
//! Commands without a scripted reply produce nothing, so the next
//! `read_line` behaves like a timeout and returns an empty string.
//! The handle is cheaply cloneable; a test keeps one clone to script and
//! inspect the device while the equipment owns the other.

use super::Transport;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct MockState {
    replies: HashMap<String, String>,
    one_shot: HashMap<String, VecDeque<String>>,
    outgoing: VecDeque<String>,
    written: Vec<String>,
    fail_next_write: bool,
    fail_next_read: bool,
}

/// Mock transport with a reply script and a write log.
#[derive(Clone, Default)]
pub struct MockTransport {
    name: String,
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Answer `command` with `reply` on every write.
    pub fn respond(&self, command: &str, reply: &str) -> &Self {
        self.lock()
            .replies
            .insert(command.to_string(), reply.to_string());
        self
    }

    /// Answer the next write of `command` with `reply`.
    pub fn respond_once(&self, command: &str, reply: &str) -> &Self {
        self.lock()
            .one_shot
            .entry(command.to_string())
            .or_default()
            .push_back(reply.to_string());
        self
    }

    /// Remove the permanent reply for `command`.
    pub fn forget(&self, command: &str) {
        self.lock().replies.remove(command);
    }

    /// Make an unsolicited line available for reading.
    pub fn push_line(&self, line: &str) {
        self.lock().outgoing.push_back(line.to_string());
    }

    /// Fail the next write with a transport error.
    pub fn fail_next_write(&self) {
        self.lock().fail_next_write = true;
    }

    /// Fail the next read with a transport error.
    pub fn fail_next_read(&self) {
        self.lock().fail_next_read = true;
    }

    /// Every command written so far, in order.
    pub fn written(&self) -> Vec<String> {
        self.lock().written.clone()
    }

    /// Clear the write log.
    pub fn clear_written(&self) {
        self.lock().written.clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn describe(&self) -> String {
        format!("mock:{}", self.name)
    }

    async fn write(&mut self, command: &str) -> AppResult<()> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next_write) {
            return Err(DaqError::Transport(format!(
                "injected write failure on {}",
                self.name
            )));
        }
        state.written.push(command.to_string());

        let reply = state
            .one_shot
            .get_mut(command)
            .and_then(VecDeque::pop_front)
            .or_else(|| state.replies.get(command).cloned());
        if let Some(reply) = reply {
            state.outgoing.push_back(reply);
        }
        Ok(())
    }

    async fn read_line(&mut self) -> AppResult<String> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next_read) {
            return Err(DaqError::Transport(format!(
                "injected read failure on {}",
                self.name
            )));
        }
        Ok(state.outgoing.pop_front().unwrap_or_default())
    }

    async fn bytes_available(&mut self) -> AppResult<usize> {
        Ok(self.lock().outgoing.iter().map(String::len).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_query_round_trip() {
        let mock = MockTransport::new("dev");
        mock.respond("IN_PV_00\r\n", "21.30\r\n");
        let mut transport = mock.clone();

        assert_eq!(transport.query("IN_PV_00\r\n").await.unwrap(), "21.30\r\n");
        assert_eq!(transport.query("IN_PV_00\r\n").await.unwrap(), "21.30\r\n");
        assert_eq!(mock.written().len(), 2);
    }

    #[tokio::test]
    async fn one_shot_reply_takes_precedence() {
        let mock = MockTransport::new("dev");
        mock.respond("Q", "steady\n").respond_once("Q", "first\n");
        let mut transport = mock.clone();

        assert_eq!(transport.query("Q").await.unwrap(), "first\n");
        assert_eq!(transport.query("Q").await.unwrap(), "steady\n");
    }

    #[tokio::test]
    async fn unscripted_command_reads_as_timeout() {
        let mut transport = MockTransport::new("dev");
        assert_eq!(transport.query("?").await.unwrap(), "");
    }

    #[tokio::test]
    async fn failure_injection_is_consumed() {
        let mock = MockTransport::new("dev");
        mock.fail_next_write();
        let mut transport = mock.clone();

        assert!(transport.write("X").await.is_err());
        assert!(transport.write("X").await.is_ok());
        assert_eq!(mock.written(), vec!["X".to_string()]);
    }

    #[tokio::test]
    async fn unsolicited_lines_are_counted() {
        let mock = MockTransport::new("dev");
        let mut transport = mock.clone();
        assert_eq!(transport.bytes_available().await.unwrap(), 0);

        mock.push_line("Moved 10\r\n");
        assert_eq!(transport.bytes_available().await.unwrap(), 10);
        assert_eq!(transport.read_line().await.unwrap(), "Moved 10\r\n");
    }
}
