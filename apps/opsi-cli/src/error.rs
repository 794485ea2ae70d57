use messagebus::BusError;
use std::io;
use thiserror::Error;
use transport_bus::TransportError;

use crate::telemetry::logging::InitError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Bus(#[from] BusError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("logging initialization failed: {0}")]
    Logging(#[from] InitError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("host {0} is currently not connected to the messagebus")]
    HostNotConnected(String),
    #[error("no matching {event} event received")]
    NoMatchingEvent { event: String },
    /// The command ran but reported failure; the message was already printed.
    #[error("command failed with exit code {0}")]
    Failed(i32),
}

impl From<TransportError> for CliError {
    fn from(err: TransportError) -> Self {
        CliError::Bus(BusError::Transport(err))
    }
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Failed(code) => *code,
            CliError::InvalidArgument(_) | CliError::Config(_) => 2,
            CliError::Bus(BusError::InvalidArgument(_)) => 2,
            _ => 1,
        }
    }

    /// Whether `main` still has to print the error.
    pub fn is_reported(&self) -> bool {
        matches!(self, CliError::Failed(_))
    }
}
