use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A resettable flag callers block on while the delivery thread sets it.
#[derive(Debug, Default)]
pub struct WaitHandle {
    flag: Mutex<bool>,
    signal: Condvar,
}

impl WaitHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut flag = self.flag.lock();
        *flag = true;
        self.signal.notify_all();
    }

    pub fn clear(&self) {
        *self.flag.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.flag.lock()
    }

    /// Returns whether the flag was set before `timeout` elapsed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut flag = self.flag.lock();
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            while !*flag {
                self.signal.wait(&mut flag);
            }
            return true;
        };
        while !*flag {
            if self.signal.wait_until(&mut flag, deadline).timed_out() {
                return *flag;
            }
        }
        true
    }
}
