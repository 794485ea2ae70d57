#![allow(dead_code)]

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use messagebus::{BusConfig, BusConnection, ConnectionScope};
use parking_lot::Mutex;
use transport_bus::LocalBus;

/// Timing short enough that timeout paths finish quickly.
pub fn fast_config() -> BusConfig {
    BusConfig {
        subscription_timeout: Duration::from_millis(300),
        jsonrpc_timeout: Duration::from_millis(300),
        process_start_timeout: Duration::from_millis(300),
        input_poll_interval: Duration::from_millis(5),
        process_poll_interval: Duration::from_millis(20),
    }
}

pub fn open(bus: &LocalBus) -> ConnectionScope {
    open_with(bus, fast_config())
}

pub fn open_with(bus: &LocalBus, config: BusConfig) -> ConnectionScope {
    BusConnection::new(Arc::new(bus.clone()), config)
        .open()
        .expect("connection scope opens")
}

/// In-memory stand-in for stdout that tests can read back.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
