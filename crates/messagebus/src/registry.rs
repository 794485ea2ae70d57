use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::signal::WaitHandle;

#[derive(Default)]
struct SubscriptionState {
    subscribed: BTreeSet<String>,
    pending: HashMap<String, Arc<WaitHandle>>,
}

/// Server-authoritative view of this connection's channel subscriptions.
///
/// The server answers every subscription request by echoing the full list of
/// channels the session is subscribed to, so requests are correlated on the
/// content of that list rather than on any request id.
#[derive(Default)]
pub struct ChannelRegistry {
    state: Mutex<SubscriptionState>,
    initial: WaitHandle,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.state.lock().subscribed.contains(channel)
    }

    pub fn subscribed_channels(&self) -> Vec<String> {
        self.state.lock().subscribed.iter().cloned().collect()
    }

    pub fn is_pending(&self, channel: &str) -> bool {
        self.state.lock().pending.contains_key(channel)
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Registers a wait handle for `channel`. The entry lives exactly as long
    /// as the returned guard.
    pub(crate) fn begin_request(&self, channel: &str) -> PendingSubscription<'_> {
        let handle = Arc::new(WaitHandle::new());
        self.state
            .lock()
            .pending
            .insert(channel.to_string(), Arc::clone(&handle));
        PendingSubscription {
            registry: self,
            channel: channel.to_string(),
            handle,
        }
    }

    /// Applies a `channel_subscription_event`: the listed channels become the
    /// subscribed set and every waiter on one of them is released.
    pub fn apply_event(&self, channels: &[String]) {
        let mut state = self.state.lock();
        state.subscribed = channels.iter().cloned().collect();
        for channel in channels {
            if let Some(handle) = state.pending.get(channel) {
                trace!(target: "messagebus::registry", channel = %channel, "subscription acknowledged");
                handle.set();
            }
        }
        drop(state);
        self.initial.set();
    }

    /// Blocks until the first subscription event of this session arrived.
    pub fn wait_initial(&self, timeout: Duration) -> bool {
        self.initial.wait(timeout)
    }

    pub fn initial_acknowledged(&self) -> bool {
        self.initial.is_set()
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.subscribed.clear();
        state.pending.clear();
        drop(state);
        self.initial.clear();
        debug!(target: "messagebus::registry", "subscription state cleared");
    }
}

pub(crate) struct PendingSubscription<'a> {
    registry: &'a ChannelRegistry,
    channel: String,
    handle: Arc<WaitHandle>,
}

impl PendingSubscription<'_> {
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        self.handle.wait(timeout)
    }
}

impl Drop for PendingSubscription<'_> {
    fn drop(&mut self) {
        let mut state = self.registry.state.lock();
        if state
            .pending
            .get(&self.channel)
            .is_some_and(|current| Arc::ptr_eq(current, &self.handle))
        {
            state.pending.remove(&self.channel);
        }
    }
}
