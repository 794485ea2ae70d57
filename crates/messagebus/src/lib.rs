//! Messagebus client core.
//!
//! One externally owned delivery thread feeds every inbound message through
//! a [`Dispatcher`]; callers block on [`WaitHandle`]s with bounded timeouts
//! until the handlers they registered have seen what they wait for.
//!
//! ```no_run
//! use std::sync::Arc;
//! use messagebus::{BusConfig, BusConnection, RpcCorrelator};
//! use transport_bus::LocalBus;
//!
//! # fn main() -> Result<(), messagebus::BusError> {
//! let connection = BusConnection::new(Arc::new(LocalBus::new()), BusConfig::default());
//! let scope = connection.open()?;
//! let rpc = RpcCorrelator::new(Arc::clone(scope.connection()));
//! let ids = rpc.jsonrpc("service:config:jsonrpc", "host_getMessagebusConnectedIds", vec![])?;
//! # drop(ids);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod fanout;
pub mod process;
pub mod registry;
pub mod rpc;
pub mod signal;
pub mod terminal;
pub mod waiter;

pub use config::BusConfig;
pub use connection::{BusConnection, ConnectionScope};
pub use dispatch::{Dispatcher, HandlerRegistration, MessageHandler};
pub use error::{BusError, BusResult, HandlerFault};
pub use fanout::{FanoutExecutor, FanoutReport, FanoutRequest, TargetOutcome};
pub use process::{ProcessExecutor, ProcessOutcome, ProcessOutput, ProcessReport, ProcessRequest};
pub use registry::ChannelRegistry;
pub use rpc::{RpcCorrelator, RpcFailure, RpcOutcome};
pub use signal::WaitHandle;
pub use terminal::{TerminalExit, TerminalIo, TerminalSession, TerminalState};
pub use waiter::{EventWaiter, HostDirectory, HostWaitReport};
