pub mod execute;
pub mod jsonrpc;
pub mod terminal;
pub mod wait;

use std::sync::Arc;

use messagebus::{BusConnection, ConnectionScope};
use transport_bus::Transport;

use crate::config::Settings;
use crate::error::CliError;

/// What every command needs: resolved settings and the session to talk over.
pub struct Context {
    pub settings: Settings,
    pub transport: Arc<dyn Transport>,
}

impl Context {
    pub fn new(settings: Settings, transport: Arc<dyn Transport>) -> Self {
        Self {
            settings,
            transport,
        }
    }

    /// Opens a scoped connection; the session is released when the scope drops.
    pub fn connect(&self) -> Result<ConnectionScope, CliError> {
        let connection = BusConnection::new(Arc::clone(&self.transport), self.settings.bus.clone());
        Ok(connection.open()?)
    }
}
