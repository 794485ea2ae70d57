use std::time::Duration;

pub const CHANNEL_SUBSCRIPTION_TIMEOUT: Duration = Duration::from_secs(5);
pub const JSONRPC_TIMEOUT: Duration = Duration::from_secs(10);
pub const PROCESS_START_TIMEOUT: Duration = Duration::from_secs(15);
pub const HOST_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Protocol timing for one bus connection. Every field is caller-overridable.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub subscription_timeout: Duration,
    pub jsonrpc_timeout: Duration,
    pub process_start_timeout: Duration,
    /// How long the terminal loop waits for local input before rechecking state.
    pub input_poll_interval: Duration,
    /// Scheduling tick of the streaming process executor.
    pub process_poll_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscription_timeout: CHANNEL_SUBSCRIPTION_TIMEOUT,
            jsonrpc_timeout: JSONRPC_TIMEOUT,
            process_start_timeout: PROCESS_START_TIMEOUT,
            input_poll_interval: Duration::from_millis(10),
            process_poll_interval: Duration::from_millis(250),
        }
    }
}

impl BusConfig {
    pub fn with_subscription_timeout(mut self, timeout: Duration) -> Self {
        self.subscription_timeout = timeout;
        self
    }

    pub fn with_jsonrpc_timeout(mut self, timeout: Duration) -> Self {
        self.jsonrpc_timeout = timeout;
        self
    }

    pub fn with_process_start_timeout(mut self, timeout: Duration) -> Self {
        self.process_start_timeout = timeout;
        self
    }
}
