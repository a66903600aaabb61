//! Custom error types for the frontends.
//!
//! This module defines the primary error type, `DaqError`, shared by every
//! equipment, transport and host-bus call. Using the `thiserror` crate, it
//! provides a centralized and consistent way to report the three failure
//! families an instrument frontend has to deal with:
//!
//! - **Transport** failures: the serial port, VISA session or SDK connection
//!   could not be opened, written or read.
//! - **Parse** failures: a reply arrived but did not match the expected
//!   fixed format (an empty line after a read timeout included).
//! - **Illegal state** transitions: a command arrived while the device was
//!   busy (for example a move request while the stage is still moving).
//!
//! Configuration and host-side problems get their own variants so the
//! binary can report them with context. [`DaqError::kind`] folds every
//! variant onto the coarse [`ErrorKind`] taxonomy that the frontend loop
//! uses to decide whether an equipment is marked unhealthy.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Coarse classification of a [`DaqError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection lost, write or read failure.
    Transport,
    /// Response did not match the expected format.
    Parse,
    /// Command rejected because of the current device state.
    IllegalState,
    /// Bad configuration or setting value.
    Configuration,
    /// Host bus, SDK or local I/O problem.
    Host,
}

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Invalid value for setting '{path}': {reason}")]
    InvalidSetting { path: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport not connected")]
    NotConnected,

    #[error("Response {response:?} does not match template {template:?}")]
    Parse { response: String, template: String },

    #[error("Invalid number {0:?} in device response")]
    InvalidNumber(String),

    #[error("{equipment} is busy ({state}), command rejected")]
    Busy { equipment: String, state: String },

    #[error("Host bus error: {0}")]
    Host(String),

    #[error("Device SDK error: {0}")]
    Sdk(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl DaqError {
    /// Returns the taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaqError::Transport(_) | DaqError::NotConnected => ErrorKind::Transport,
            DaqError::Parse { .. } | DaqError::InvalidNumber(_) => ErrorKind::Parse,
            DaqError::Busy { .. } => ErrorKind::IllegalState,
            DaqError::Config(_) | DaqError::Configuration(_) | DaqError::InvalidSetting { .. } => {
                ErrorKind::Configuration
            }
            DaqError::Io(_)
            | DaqError::Host(_)
            | DaqError::Sdk(_)
            | DaqError::FeatureNotEnabled(_) => ErrorKind::Host,
        }
    }

    /// True for failures that should mark the equipment unhealthy.
    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}
