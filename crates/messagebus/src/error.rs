use serde_json::Value;
use thiserror::Error;
use transport_bus::TransportError;

#[derive(Debug, Error)]
pub enum BusError {
    /// Something the server should have acknowledged never was.
    #[error("connection error: {0}")]
    Connection(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("a jsonrpc call is already in flight on this connection")]
    RpcInFlight,
    #[error("jsonrpc error from {channel}: {error}")]
    Remote { channel: String, error: Value },
    #[error("terminal error: {0}")]
    Terminal(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BusError {
    pub fn is_connection(&self) -> bool {
        matches!(self, BusError::Connection(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::Timeout(_))
    }
}

pub type BusResult<T> = Result<T, BusError>;

/// Failure inside a message handler. Always logged by the dispatcher and
/// never propagated to the delivery thread.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerFault(pub String);

impl HandlerFault {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}
